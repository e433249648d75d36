//! Events - ダッシュボードへ push する変更通知
//!
//! Registry と Counter の変更はすべて `TaskEvent` として broadcast されます。
//! ダッシュボードはポーリングせずに購読します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::{PauseReason, TaskStatus, TaskSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEventKind {
    Created {
        summary: TaskSummary,
    },
    StatusChanged {
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<PauseReason>,
    },
    SyncCountChanged {
        sync_count: u64,
        global_total: u64,
    },
    LastError {
        error: String,
    },
    PipelineUpdated,
}

impl TaskEvent {
    pub fn new(task_id: TaskId, at: DateTime<Utc>, kind: TaskEventKind) -> Self {
        Self { task_id, at, kind }
    }
}
