//! Status - ダッシュボード向けのスナップショット
//!
//! レジストリのタスク一覧、カウンタ、タスクごとのメトリクス、
//! analytics の滞留状況を一つのシリアライズ可能な値にまとめます。

use serde::{Deserialize, Serialize};

use crate::domain::{TaskStatus, TaskSummary};
use crate::observability::MetricsSnapshot;

/// One task as a dashboard shows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    #[serde(flatten)]
    pub summary: TaskSummary,
    /// A worker unit is currently running for this task.
    pub worker_running: bool,
    /// Messages held over from the last activation.
    pub carried_over: usize,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
}

/// Whole-engine view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub tasks: Vec<TaskStatusView>,
    pub global_sync_count: u64,
    pub analytics_pending: usize,
    pub analytics_lagging: bool,
}

impl EngineStatus {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.summary.status == status)
            .count()
    }

    /// Tasks whose worker should be running but is not.
    pub fn stalled(&self) -> Vec<&TaskStatusView> {
        self.tasks
            .iter()
            .filter(|t| t.summary.status == TaskStatus::Active && !t.worker_running)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelRef, TaskId};
    use ulid::Ulid;

    fn view(status: TaskStatus, worker_running: bool) -> TaskStatusView {
        TaskStatusView {
            summary: TaskSummary {
                id: TaskId::from_ulid(Ulid::new()),
                source: ChannelRef::new("src"),
                dest: ChannelRef::new("dst"),
                status,
                pause_reason: None,
                sync_count: 0,
                last_error: None,
            },
            worker_running,
            carried_over: 0,
            metrics: MetricsSnapshot::default(),
        }
    }

    #[test]
    fn counts_and_stalled_tasks() {
        let status = EngineStatus {
            tasks: vec![
                view(TaskStatus::Active, true),
                view(TaskStatus::Active, false),
                view(TaskStatus::Paused, false),
            ],
            global_sync_count: 0,
            analytics_pending: 0,
            analytics_lagging: false,
        };
        assert_eq!(status.count(TaskStatus::Active), 2);
        assert_eq!(status.count(TaskStatus::Deleted), 0);
        assert_eq!(status.stalled().len(), 1);
    }

    #[test]
    fn summary_fields_are_flattened() {
        let json = serde_json::to_value(view(TaskStatus::Paused, false)).unwrap();
        assert_eq!(json["status"], "PAUSED");
        assert_eq!(json["worker_running"], false);
        assert!(json.get("summary").is_none());
    }
}
