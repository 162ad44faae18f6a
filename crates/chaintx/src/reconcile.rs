//! One reconciliation pass over open payment requests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::domain::{
    ObservePaymentRequestInput, ObservePaymentRequestOutput, OpenPaymentRequest,
    PaymentRequestStatus, ReconcilePaymentRequestsCommand, ReconcilePaymentRequestsOutput,
    ReconcileTransitionMetadata, TransitionStatusCommand,
};
use crate::error::{AppError, AppResult};
use crate::ports::{ChainObserverGateway, ReconciliationRepository};

pub const REASON_EXPIRED: &str = "payment_expired";
pub const REASON_CONFIRMED: &str = "payment_confirmed";
pub const REASON_DETECTED: &str = "payment_detected";
const POLICY_SOURCE: &str = "reconcile_policy";

pub struct Reconciler {
    repository: Arc<dyn ReconciliationRepository>,
    observer: Arc<dyn ChainObserverGateway>,
}

fn validate(command: &ReconcilePaymentRequestsCommand) -> AppResult<()> {
    if command.batch_size <= 0 {
        return Err(AppError::validation(
            "reconcile_batch_size_invalid",
            "reconcile batch size must be greater than zero",
        )
        .with("batch_size", command.batch_size));
    }
    if command.worker_id.trim().is_empty() {
        return Err(AppError::validation(
            "reconcile_worker_id_invalid",
            "reconcile worker id is required",
        ));
    }
    if command.lease_duration <= chrono::Duration::zero() {
        return Err(AppError::validation(
            "reconcile_lease_duration_invalid",
            "reconcile lease duration must be greater than zero",
        )
        .with("lease_seconds", command.lease_duration.num_seconds()));
    }
    Ok(())
}

/// Target status and reason for an observation of a row in `current`.
pub fn classify_observation(
    current: PaymentRequestStatus,
    observation: &ObservePaymentRequestOutput,
) -> (PaymentRequestStatus, &'static str) {
    use PaymentRequestStatus::*;
    match current {
        Pending | Detected if observation.confirmed => (Confirmed, REASON_CONFIRMED),
        Pending if observation.detected => (Detected, REASON_DETECTED),
        _ => (current, ""),
    }
}

fn policy_metadata(now: DateTime<Utc>, details: Map<String, Value>) -> ReconcileTransitionMetadata {
    ReconcileTransitionMetadata {
        observed_amount_minor: String::new(),
        observation_source: POLICY_SOURCE.to_string(),
        observation_details: details,
        transition_reason: String::new(),
        updated_at: now,
    }
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn ReconciliationRepository>,
        observer: Arc<dyn ChainObserverGateway>,
    ) -> Self {
        Self {
            repository,
            observer,
        }
    }

    pub async fn run_cycle(
        &self,
        command: &ReconcilePaymentRequestsCommand,
    ) -> AppResult<ReconcilePaymentRequestsOutput> {
        validate(command)?;
        let now = command.now;
        let worker_id = command.worker_id.trim();
        let rows = self
            .repository
            .claim_open_for_reconciliation(
                now,
                command.batch_size,
                worker_id,
                now + command.lease_duration,
            )
            .await?;

        let mut output = ReconcilePaymentRequestsOutput {
            claimed: rows.len(),
            scanned: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            self.reconcile_row(row, now, worker_id, &mut output).await?;
        }
        Ok(output)
    }

    async fn reconcile_row(
        &self,
        row: &OpenPaymentRequest,
        now: DateTime<Utc>,
        worker_id: &str,
        output: &mut ReconcilePaymentRequestsOutput,
    ) -> AppResult<()> {
        let current = row.status;

        if row.expires_at <= now {
            let metadata = ReconcileTransitionMetadata {
                observed_amount_minor: String::new(),
                observation_source: String::new(),
                observation_details: Map::new(),
                transition_reason: REASON_EXPIRED.to_string(),
                updated_at: now,
            };
            if self
                .transition(row, PaymentRequestStatus::Expired, worker_id, metadata)
                .await?
            {
                output.expired += 1;
            } else {
                output.skipped += 1;
            }
            return Ok(());
        }

        let observation = match self.observer.observe(&ObservePaymentRequestInput::from(row)).await {
            Ok(observation) => observation,
            Err(e) => {
                output.errors += 1;
                tracing::warn!(
                    id = %row.id,
                    chain = %row.chain,
                    network = %row.network,
                    code = %e.code,
                    message = %e.message,
                    "chain observation failed"
                );
                let mut details = Map::new();
                details.insert("observation_error".into(), e.code.into());
                self.transition(row, current, worker_id, policy_metadata(now, details))
                    .await?;
                return Ok(());
            }
        };

        if !observation.supported {
            let mut details = Map::new();
            details.insert("supported".into(), false.into());
            self.transition(row, current, worker_id, policy_metadata(now, details))
                .await?;
            output.skipped += 1;
            return Ok(());
        }

        let (target, reason) = classify_observation(current, &observation);
        let metadata = ReconcileTransitionMetadata {
            observed_amount_minor: observation.observed_amount_minor.clone(),
            observation_source: observation.source.clone(),
            observation_details: observation.details.clone(),
            transition_reason: reason.to_string(),
            updated_at: now,
        };
        let updated = self.transition(row, target, worker_id, metadata).await?;
        match (updated, target) {
            (true, PaymentRequestStatus::Confirmed) => output.confirmed += 1,
            (true, PaymentRequestStatus::Detected) if current != target => output.detected += 1,
            _ => output.skipped += 1,
        }
        if updated && target != current {
            tracing::info!(
                id = %row.id,
                from = current.as_str(),
                to = target.as_str(),
                observed = %observation.observed_amount_minor,
                "payment request transitioned"
            );
        }
        Ok(())
    }

    async fn transition(
        &self,
        row: &OpenPaymentRequest,
        next: PaymentRequestStatus,
        worker_id: &str,
        metadata: ReconcileTransitionMetadata,
    ) -> AppResult<bool> {
        let command = TransitionStatusCommand {
            id: row.id.clone(),
            current_status: row.status,
            next_status: next,
            lease_owner: worker_id.to_string(),
            updated_at: metadata.updated_at,
            metadata,
        };
        self.repository.transition_status_if_current(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(detected: bool, confirmed: bool) -> ObservePaymentRequestOutput {
        ObservePaymentRequestOutput {
            supported: true,
            detected,
            confirmed,
            ..Default::default()
        }
    }

    #[test]
    fn classification_table() {
        use PaymentRequestStatus::*;
        assert_eq!(
            classify_observation(Pending, &observed(false, true)),
            (Confirmed, REASON_CONFIRMED)
        );
        assert_eq!(
            classify_observation(Detected, &observed(false, true)),
            (Confirmed, REASON_CONFIRMED)
        );
        assert_eq!(
            classify_observation(Pending, &observed(true, false)),
            (Detected, REASON_DETECTED)
        );
        assert_eq!(classify_observation(Detected, &observed(true, false)), (Detected, ""));
        assert_eq!(classify_observation(Pending, &observed(false, false)), (Pending, ""));
    }

    #[test]
    fn command_bounds() {
        let base = ReconcilePaymentRequestsCommand {
            now: Utc::now(),
            batch_size: 10,
            worker_id: "w1".into(),
            lease_duration: chrono::Duration::seconds(30),
        };
        assert!(validate(&base).is_ok());

        let mut c = base.clone();
        c.batch_size = 0;
        assert_eq!(validate(&c).unwrap_err().code, "reconcile_batch_size_invalid");

        let mut c = base.clone();
        c.worker_id = "  ".into();
        assert_eq!(validate(&c).unwrap_err().code, "reconcile_worker_id_invalid");

        let mut c = base;
        c.lease_duration = chrono::Duration::zero();
        assert_eq!(validate(&c).unwrap_err().code, "reconcile_lease_duration_invalid");
    }
}
