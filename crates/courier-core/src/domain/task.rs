//! Forwarding task record and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{MessageId, TaskId};
use super::stage::PipelineConfig;

/// Reference to a channel/group on the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRef(String);

impl ChannelRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ChannelRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Task status.
///
/// State transitions:
/// - Active -> Paused -> Active (any number of times)
/// - Active | Paused -> Deleted (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Paused,
    Deleted,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TaskStatus::Active),
            "PAUSED" => Some(TaskStatus::Paused),
            "DELETED" => Some(TaskStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status change requested on the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Pause,
    Resume,
    Delete,
}

impl Transition {
    /// Target status if `self` is legal from `from`, `None` otherwise.
    pub fn target(self, from: TaskStatus) -> Option<TaskStatus> {
        match (self, from) {
            (Transition::Pause, TaskStatus::Active) => Some(TaskStatus::Paused),
            (Transition::Resume, TaskStatus::Paused) => Some(TaskStatus::Active),
            (Transition::Delete, TaskStatus::Active | TaskStatus::Paused) => {
                Some(TaskStatus::Deleted)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Why a task is paused. Dashboards show auto-pauses differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    AutoErrors { reason: String },
}

/// Forwarding task record.
///
/// Owned by the task registry; workers only hold the `TaskId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingTask {
    pub id: TaskId,
    pub source: ChannelRef,
    pub dest: ChannelRef,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,

    pub pipeline: PipelineConfig,

    /// Number of messages delivered. Never decreases.
    pub sync_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Source timestamp of the last released message.
    /// Intake replays from this instant, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<DateTime<Utc>>,

    /// Ids already released at exactly `cursor`. Sources with coarse
    /// timestamps put several messages on one instant; these are skipped on replay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cursor_ids: Vec<MessageId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForwardingTask {
    pub fn new(
        id: TaskId,
        source: ChannelRef,
        dest: ChannelRef,
        pipeline: PipelineConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source,
            dest,
            status: TaskStatus::Active,
            pause_reason: None,
            pipeline,
            sync_count: 0,
            last_error: None,
            cursor: None,
            cursor_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Where intake should resume from (inclusive). See `cursor_ids`.
    pub fn intake_after(&self) -> DateTime<Utc> {
        self.cursor.unwrap_or(self.created_at)
    }

    /// Apply a transition. Returns the new status, or `None` if it is illegal.
    pub fn apply(
        &mut self,
        transition: Transition,
        reason: Option<PauseReason>,
        now: DateTime<Utc>,
    ) -> Option<TaskStatus> {
        let next = transition.target(self.status)?;
        self.status = next;
        self.pause_reason = match next {
            TaskStatus::Paused => Some(reason.unwrap_or(PauseReason::Manual)),
            _ => None,
        };
        self.updated_at = now;
        Some(next)
    }

    /// Record a released delivery. `sync_count` only moves forward.
    pub fn record_delivery(&mut self, sync_count: u64, now: DateTime<Utc>) {
        self.sync_count = self.sync_count.max(sync_count);
        self.updated_at = now;
    }

    /// Move the cursor to a released message. Never moves backwards.
    pub fn advance_cursor(&mut self, message_id: &MessageId, at: DateTime<Utc>, now: DateTime<Utc>) {
        match self.cursor {
            Some(cursor) if at < cursor => return,
            Some(cursor) if at == cursor => {
                if !self.cursor_ids.contains(message_id) {
                    self.cursor_ids.push(message_id.clone());
                }
            }
            _ => {
                self.cursor = Some(at);
                self.cursor_ids = vec![message_id.clone()];
            }
        }
        self.updated_at = now;
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            source: self.source.clone(),
            dest: self.dest.clone(),
            status: self.status,
            pause_reason: self.pause_reason.clone(),
            sync_count: self.sync_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Dashboard view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub source: ChannelRef,
    pub dest: ChannelRef,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    pub sync_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn task() -> ForwardingTask {
        ForwardingTask::new(
            TaskId::from_ulid(Ulid::new()),
            ChannelRef::new("news-channel"),
            ChannelRef::new("group-1"),
            PipelineConfig::default(),
            Utc::now(),
        )
    }

    #[rstest]
    #[case(Transition::Pause, TaskStatus::Active, Some(TaskStatus::Paused))]
    #[case(Transition::Pause, TaskStatus::Paused, None)]
    #[case(Transition::Pause, TaskStatus::Deleted, None)]
    #[case(Transition::Resume, TaskStatus::Paused, Some(TaskStatus::Active))]
    #[case(Transition::Resume, TaskStatus::Active, None)]
    #[case(Transition::Resume, TaskStatus::Deleted, None)]
    #[case(Transition::Delete, TaskStatus::Active, Some(TaskStatus::Deleted))]
    #[case(Transition::Delete, TaskStatus::Paused, Some(TaskStatus::Deleted))]
    #[case(Transition::Delete, TaskStatus::Deleted, None)]
    fn transition_table(
        #[case] transition: Transition,
        #[case] from: TaskStatus,
        #[case] expected: Option<TaskStatus>,
    ) {
        assert_eq!(transition.target(from), expected);
    }

    #[test]
    fn new_task_is_active_with_zero_count() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Active);
        assert_eq!(t.sync_count, 0);
        assert!(t.last_error.is_none());
        assert_eq!(t.intake_after(), t.created_at);
    }

    #[test]
    fn pause_records_reason_and_resume_clears_it() {
        let mut t = task();
        let reason = PauseReason::AutoErrors {
            reason: "too many failures".into(),
        };
        assert_eq!(
            t.apply(Transition::Pause, Some(reason.clone()), Utc::now()),
            Some(TaskStatus::Paused)
        );
        assert_eq!(t.pause_reason, Some(reason));

        t.apply(Transition::Resume, None, Utc::now());
        assert_eq!(t.pause_reason, None);
    }

    #[test]
    fn illegal_transition_leaves_task_untouched() {
        let mut t = task();
        let before = t.clone();
        assert_eq!(t.apply(Transition::Resume, None, Utc::now()), None);
        assert_eq!(t, before);
    }

    #[test]
    fn record_delivery_never_decreases() {
        let mut t = task();
        t.record_delivery(5, Utc::now());
        t.record_delivery(3, Utc::now());
        assert_eq!(t.sync_count, 5);
    }

    #[test]
    fn cursor_keeps_every_id_released_at_its_instant() {
        let mut t = task();
        let ts = Utc::now();
        t.advance_cursor(&MessageId::new("a"), ts, Utc::now());
        t.advance_cursor(&MessageId::new("b"), ts, Utc::now());
        t.advance_cursor(&MessageId::new("b"), ts, Utc::now());
        t.advance_cursor(&MessageId::new("old"), ts - chrono::Duration::seconds(1), Utc::now());
        assert_eq!(t.cursor, Some(ts));
        assert_eq!(t.cursor_ids, vec![MessageId::new("a"), MessageId::new("b")]);

        let later = ts + chrono::Duration::seconds(1);
        t.advance_cursor(&MessageId::new("c"), later, Utc::now());
        assert_eq!(t.cursor, Some(later));
        assert_eq!(t.cursor_ids, vec![MessageId::new("c")]);
    }

    #[test]
    fn status_round_trips_through_its_text_form() {
        for s in [TaskStatus::Active, TaskStatus::Paused, TaskStatus::Deleted] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("nope"), None);
    }
}
