//! Outcome model: results of platform sends and of whole deliveries.
//!
//! This module does not assume workers, queues or persistence. It only defines
//! the "shape" of results that the engine records and reports.

use serde::{Deserialize, Serialize};

/// What the platform said about one send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum DeliveryResult {
    Success,
    /// Worth retrying (rate limit, timeout, flood wait...).
    TransientError(String),
    /// Retrying will not help (chat not found, bot kicked...).
    PermanentError(String),
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryResult::Success)
    }
}

/// Classification of one recorded attempt.
///
/// Serialized as SCREAMING_SNAKE_CASE: SUCCESS / TRANSIENT_FAILURE / PERMANENT_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Final result of `send` for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    PermanentFailure { attempts: u32, error: String },
    /// Aborted because the task left Active. Neither delivered nor failed.
    Cancelled,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_outcome_serializes_as_required_names() {
        let s = serde_json::to_string(&AttemptOutcome::Success).unwrap();
        assert_eq!(s, "\"SUCCESS\"");
        let s = serde_json::to_string(&AttemptOutcome::TransientFailure).unwrap();
        assert_eq!(s, "\"TRANSIENT_FAILURE\"");
        let s = serde_json::to_string(&AttemptOutcome::PermanentFailure).unwrap();
        assert_eq!(s, "\"PERMANENT_FAILURE\"");
    }

    #[test]
    fn delivery_result_is_tagged_enum() {
        let v = serde_json::to_value(DeliveryResult::TransientError("flood wait".into())).unwrap();
        assert_eq!(v["kind"], "transient_error");
        assert_eq!(v["error"], "flood wait");
    }
}
