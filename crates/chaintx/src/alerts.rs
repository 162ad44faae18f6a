//! Threshold alerts over webhook outbox aggregates.
//!
//! Each signal keeps its own state. A breach first emits `triggered`; while it
//! persists, `ongoing` is re-emitted once per cooldown and suppressed in
//! between; the first clean poll emits `resolved`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AlertConfig;
use crate::domain::{rfc3339, WebhookOutboxOverview};

pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSignal {
    FailedCount,
    PendingReadyCount,
    OldestPendingAgeSeconds,
}

impl AlertSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedCount => "failed_count",
            Self::PendingReadyCount => "pending_ready_count",
            Self::OldestPendingAgeSeconds => "oldest_pending_age_seconds",
        }
    }
}

impl fmt::Display for AlertSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Triggered,
    Ongoing,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Ongoing => "ongoing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAlert {
    pub state: AlertState,
    pub signal: AlertSignal,
    pub current: i64,
    pub threshold: i64,
    #[serde(with = "rfc3339")]
    pub triggered_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs")]
    pub cooldown: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

#[derive(Debug, Clone, Copy)]
struct SignalState {
    triggered_at: DateTime<Utc>,
    last_notified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThresholds {
    pub failed_count: i64,
    pub pending_ready_count: i64,
    pub oldest_pending_age_seconds: i64,
}

impl AlertThresholds {
    pub fn any(&self) -> bool {
        self.failed_count > 0 || self.pending_ready_count > 0 || self.oldest_pending_age_seconds > 0
    }
}

/// Per-signal alert state machine. Not shared across processes.
#[derive(Debug)]
pub struct AlertMonitor {
    thresholds: AlertThresholds,
    cooldown: Duration,
    states: HashMap<AlertSignal, SignalState>,
}

impl AlertMonitor {
    pub fn new(thresholds: AlertThresholds, cooldown: Duration) -> Self {
        let cooldown = if cooldown.is_zero() {
            DEFAULT_ALERT_COOLDOWN
        } else {
            cooldown
        };
        Self {
            thresholds,
            cooldown,
            states: HashMap::new(),
        }
    }

    pub fn from_config(config: &AlertConfig) -> Self {
        Self::new(
            AlertThresholds {
                failed_count: config.failed_count_threshold,
                pending_ready_count: config.pending_ready_threshold,
                oldest_pending_age_seconds: config.oldest_pending_age_seconds,
            },
            config.cooldown,
        )
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_armed(&self) -> bool {
        self.thresholds.any()
    }

    /// Alerts to emit for this poll, in signal order.
    pub fn evaluate(
        &mut self,
        now: DateTime<Utc>,
        overview: &WebhookOutboxOverview,
    ) -> Vec<WebhookAlert> {
        let mut alerts = Vec::new();
        let t = self.thresholds;
        if t.failed_count > 0 {
            alerts.extend(self.evaluate_signal(
                now,
                AlertSignal::FailedCount,
                overview.failed_count,
                t.failed_count,
                overview.failed_count >= t.failed_count,
            ));
        }
        if t.pending_ready_count > 0 {
            alerts.extend(self.evaluate_signal(
                now,
                AlertSignal::PendingReadyCount,
                overview.pending_ready_count,
                t.pending_ready_count,
                overview.pending_ready_count >= t.pending_ready_count,
            ));
        }
        if t.oldest_pending_age_seconds > 0 {
            let age = overview.oldest_pending_age_seconds;
            alerts.extend(self.evaluate_signal(
                now,
                AlertSignal::OldestPendingAgeSeconds,
                age.unwrap_or(0),
                t.oldest_pending_age_seconds,
                age.is_some_and(|a| a >= t.oldest_pending_age_seconds),
            ));
        }
        alerts
    }

    fn evaluate_signal(
        &mut self,
        now: DateTime<Utc>,
        signal: AlertSignal,
        current: i64,
        threshold: i64,
        breached: bool,
    ) -> Option<WebhookAlert> {
        let cooldown = self.cooldown;
        let alert = |state, triggered_at| WebhookAlert {
            state,
            signal,
            current,
            threshold,
            triggered_at,
            cooldown,
        };

        match (self.states.get(&signal).copied(), breached) {
            (None, true) => {
                self.states.insert(
                    signal,
                    SignalState {
                        triggered_at: now,
                        last_notified_at: now,
                    },
                );
                Some(alert(AlertState::Triggered, now))
            }
            (Some(state), true) => {
                let since = (now - state.last_notified_at).to_std().unwrap_or_default();
                if since < cooldown {
                    tracing::debug!(signal = %signal, current, threshold, "webhook alert suppressed");
                    return None;
                }
                self.states.insert(
                    signal,
                    SignalState {
                        last_notified_at: now,
                        ..state
                    },
                );
                Some(alert(AlertState::Ongoing, state.triggered_at))
            }
            (Some(state), false) => {
                self.states.remove(&signal);
                Some(alert(AlertState::Resolved, state.triggered_at))
            }
            (None, false) => None,
        }
    }
}
