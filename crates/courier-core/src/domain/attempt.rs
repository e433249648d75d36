//! Delivery attempt records: the append-only history behind analytics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, MessageId, TaskId};
use super::outcome::AttemptOutcome;

/// A single send of one message to the destination.
///
/// Records:
/// - Which message, for which task
/// - Which try it was (1-based)
/// - What happened
///
/// Owned by the analytics collector once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt_id: AttemptId,
    pub task_id: TaskId,
    pub message_id: MessageId,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,

    /// Platform error text for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn new(
        attempt_id: AttemptId,
        task_id: TaskId,
        message_id: MessageId,
        attempt_number: u32,
        outcome: AttemptOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id,
            task_id,
            message_id,
            attempt_number,
            outcome,
            error: None,
            timestamp,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Time window for analytics queries. Both ends inclusive; `None` is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| ts >= from) && self.to.is_none_or(|to| ts <= to)
    }
}
