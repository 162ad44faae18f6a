//! Basis-point thresholds that turn an observed amount into detected or
//! confirmed.

use alloy::primitives::U512;

use crate::error::{AppError, AppResult};

pub const BPS_DENOMINATOR: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    pub detected_bps: i64,
    pub confirmed_bps: i64,
}

/// Outcome of comparing observed amounts with the thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdEvaluation {
    pub detected: bool,
    pub confirmed: bool,
    pub required_detected: U512,
    pub required_confirmed: U512,
}

impl ThresholdPolicy {
    /// Non-positive values fall back to 10000; confirmed is capped at 10000
    /// and detected at confirmed.
    pub fn new(detected_bps: i64, confirmed_bps: i64) -> Self {
        let mut confirmed = if confirmed_bps <= 0 {
            BPS_DENOMINATOR
        } else {
            confirmed_bps
        };
        confirmed = confirmed.min(BPS_DENOMINATOR);
        let mut detected = if detected_bps <= 0 {
            BPS_DENOMINATOR
        } else {
            detected_bps
        };
        detected = detected.min(confirmed);
        Self {
            detected_bps: detected,
            confirmed_bps: confirmed,
        }
    }

    pub fn required_detected(&self, expected: U512) -> U512 {
        required_amount(expected, self.detected_bps)
    }

    pub fn required_confirmed(&self, expected: U512) -> U512 {
        required_amount(expected, self.confirmed_bps)
    }

    /// `confirmed` looks only at confirmed-depth funds; `detected` is set only
    /// when not already confirmed.
    pub fn evaluate(
        &self,
        expected: U512,
        total_observed: U512,
        confirmed_observed: U512,
    ) -> ThresholdEvaluation {
        let required_detected = self.required_detected(expected);
        let required_confirmed = self.required_confirmed(expected);
        let confirmed = confirmed_observed >= required_confirmed;
        let detected = !confirmed && total_observed >= required_detected;
        ThresholdEvaluation {
            detected,
            confirmed,
            required_detected,
            required_confirmed,
        }
    }
}

/// `ceil(expected * bps / 10000)`, never below 1.
fn required_amount(expected: U512, bps: i64) -> U512 {
    let denominator = U512::from(BPS_DENOMINATOR as u64);
    let product = expected.saturating_mul(U512::from(bps.max(0) as u64));
    let (quotient, remainder) = product.div_rem(denominator);
    let required = if remainder.is_zero() {
        quotient
    } else {
        quotient + U512::from(1u8)
    };
    required.max(U512::from(1u8))
}

/// Absent or blank expectations mean "any positive amount".
pub fn parse_expected_amount(raw: Option<&str>) -> AppResult<U512> {
    let Some(trimmed) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(U512::from(1u8));
    };
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::validation(
            "invalid_request",
            "expected_amount_minor must be a non-negative integer",
        )
        .with("expected_amount_minor", trimmed));
    }
    U512::from_str_radix(trimmed, 10).map_err(|_| {
        AppError::validation(
            "invalid_request",
            "expected_amount_minor must be a non-negative integer",
        )
        .with("expected_amount_minor", trimmed)
    })
}
