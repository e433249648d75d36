//! Engine - ダッシュボード API の表面
//!
//! レジストリへの変更と、タスクごとのワーカー単位の起動・停止を一か所で束ねます。
//!
//! # 不変条件
//! - Active なタスクにはワーカーがちょうど一つ
//! - pause / delete は `cancel_grace` 以内にワーカーを止める（超えたら abort）
//! - ワーカーの停止待ちは `slots` のロックを手放してから行う（他タスクの操作を塞がない）
//! - `TaskRuntime`（dedup・carry-over・メトリクス）は delete まで保持

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::analytics::{AnalyticsCollector, AttemptStats};
use crate::app::counters::CounterSnapshot;
use crate::app::registry::TaskRegistry;
use crate::app::status::{EngineStatus, TaskStatusView};
use crate::app::worker_loop::{TaskRuntime, WorkerDeps, WorkerHandle};
use crate::config::EngineConfig;
use crate::domain::{
    ChannelRef, DeliveryAttempt, ForwardingTask, PipelineConfig, RegistryError, TaskEvent,
    TaskId, TaskStatus, TaskSummary, TimeRange,
};
use crate::observability::MetricsSnapshot;

struct TaskSlot {
    runtime: Arc<TaskRuntime>,
    worker: Option<WorkerHandle>,
}

/// The forwarding engine.
///
/// Built with [`EngineBuilder`](crate::app::EngineBuilder).
pub struct Engine {
    deps: WorkerDeps,
    slots: Mutex<HashMap<TaskId, TaskSlot>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub(crate) fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            slots: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn registry(&self) -> &TaskRegistry {
        &self.deps.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.deps.config
    }

    /// Seed counters from persisted records and start workers for Active tasks.
    pub(crate) async fn resume_persisted(&self, tasks: Vec<ForwardingTask>) {
        let mut slots = self.slots.lock().await;
        for task in tasks {
            if task.status.is_terminal() {
                continue;
            }
            self.deps.counters.restore(task.id, task.sync_count);
            let slot = slots.entry(task.id).or_insert_with(|| self.new_slot());
            if task.status == TaskStatus::Active {
                slot.worker = Some(self.spawn_worker(task.id, &slot.runtime));
            }
        }
        info!(workers = slots.values().filter(|s| s.worker.is_some()).count(), "engine resumed");
    }

    fn new_slot(&self) -> TaskSlot {
        TaskSlot {
            runtime: Arc::new(TaskRuntime::new(&self.deps.config)),
            worker: None,
        }
    }

    fn spawn_worker(&self, id: TaskId, runtime: &Arc<TaskRuntime>) -> WorkerHandle {
        WorkerHandle::spawn(
            id,
            self.deps.clone(),
            Arc::clone(runtime),
            self.shutdown.child_token(),
        )
    }

    /// Validate, persist and start a new Active task.
    pub async fn create_task(
        &self,
        source: ChannelRef,
        dest: ChannelRef,
        pipeline: PipelineConfig,
    ) -> Result<TaskId, RegistryError> {
        let mut slots = self.slots.lock().await;
        let id = self.registry().create(source, dest, pipeline).await?;
        self.deps.counters.restore(id, 0);
        let slot = slots.entry(id).or_insert_with(|| self.new_slot());
        slot.worker = Some(self.spawn_worker(id, &slot.runtime));
        Ok(id)
    }

    pub async fn list_tasks(&self) -> Vec<TaskSummary> {
        self.registry().list().await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<TaskSummary, RegistryError> {
        self.registry().get(id).await
    }

    /// Pause: the worker stops within the cancel grace; counters are kept.
    pub async fn pause_task(&self, id: TaskId) -> Result<TaskSummary, RegistryError> {
        let (task, worker) = {
            let mut slots = self.slots.lock().await;
            let task = self.registry().pause(id).await?;
            (task, slots.get_mut(&id).and_then(|s| s.worker.take()))
        };
        if let Some(worker) = worker {
            worker.stop(self.deps.config.dispatch.cancel_grace()).await;
        }
        Ok(task.summary())
    }

    /// Resume a Paused task, manual or auto-paused alike.
    pub async fn resume_task(&self, id: TaskId) -> Result<TaskSummary, RegistryError> {
        let (task, previous) = {
            let mut slots = self.slots.lock().await;
            let task = self.registry().resume(id).await?;
            let slot = slots.entry(id).or_insert_with(|| self.new_slot());
            (task, slot.worker.take())
        };
        // an auto-paused worker may still be winding down; its carry-over must land first
        if let Some(previous) = previous {
            previous.stop(self.deps.config.dispatch.cancel_grace()).await;
        }

        let mut slots = self.slots.lock().await;
        let still_active = self
            .registry()
            .record(id)
            .await
            .is_ok_and(|t| t.status == TaskStatus::Active);
        match slots.get_mut(&id) {
            Some(slot) if still_active && slot.worker.is_none() => {
                slot.worker = Some(self.spawn_worker(id, &slot.runtime));
            }
            _ => debug!(task_id = %id, "task changed while resuming, no worker started"),
        }
        Ok(task.summary())
    }

    /// Logical delete. The record stays listed as Deleted; its counter is dropped.
    pub async fn delete_task(&self, id: TaskId) -> Result<TaskSummary, RegistryError> {
        let (task, slot) = {
            let mut slots = self.slots.lock().await;
            let task = self.registry().delete(id).await?;
            (task, slots.remove(&id))
        };
        if let Some(slot) = slot {
            if let Some(worker) = slot.worker {
                worker.stop(self.deps.config.dispatch.cancel_grace()).await;
            }
            let carried = slot.runtime.carryover_len();
            if carried > 0 {
                info!(task_id = %id, carried, "discarding carried-over messages of deleted task");
            }
        }
        self.deps.counters.remove(id);
        Ok(task.summary())
    }

    /// Replace a task's pipeline. Takes effect from the next message transformed.
    pub async fn update_pipeline(
        &self,
        id: TaskId,
        pipeline: PipelineConfig,
    ) -> Result<(), RegistryError> {
        self.registry().update_pipeline(id, pipeline).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.registry().subscribe()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.deps.counters.snapshot()
    }

    /// Delivery attempts of one task, ordered by timestamp.
    ///
    /// Waits for the collector to catch up first, so attempts already released
    /// are always visible.
    pub async fn query_attempts(&self, id: TaskId, range: TimeRange) -> Vec<DeliveryAttempt> {
        self.deps.analytics.flush().await;
        self.deps.analytics.query(id, range)
    }

    pub async fn attempt_stats(&self, id: TaskId) -> AttemptStats {
        self.deps.analytics.flush().await;
        self.deps.analytics.stats(id)
    }

    pub async fn task_metrics(&self, id: TaskId) -> Option<MetricsSnapshot> {
        let slots = self.slots.lock().await;
        slots.get(&id).map(|s| s.runtime.metrics().snapshot())
    }

    pub fn analytics(&self) -> &AnalyticsCollector {
        &self.deps.analytics
    }

    /// Everything a dashboard shows, in one value.
    pub async fn status(&self) -> EngineStatus {
        let summaries = self.registry().list().await;
        let slots = self.slots.lock().await;
        let tasks = summaries
            .into_iter()
            .map(|summary| {
                let slot = slots.get(&summary.id);
                TaskStatusView {
                    worker_running: slot
                        .and_then(|s| s.worker.as_ref())
                        .is_some_and(|w| !w.is_finished()),
                    carried_over: slot.map_or(0, |s| s.runtime.carryover_len()),
                    metrics: slot
                        .map(|s| s.runtime.metrics().snapshot())
                        .unwrap_or_default(),
                    summary,
                }
            })
            .collect();
        EngineStatus {
            tasks,
            global_sync_count: self.deps.counters.global(),
            analytics_pending: self.deps.analytics.pending(),
            analytics_lagging: self.deps.analytics.is_lagging(),
        }
    }

    /// Stop every worker, then wait for the analytics writer to drain.
    ///
    /// Task statuses are left as they are so the next start resumes them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let grace = self.deps.config.dispatch.cancel_grace();
        let workers: Vec<WorkerHandle> = {
            let mut slots = self.slots.lock().await;
            slots.values_mut().filter_map(|s| s.worker.take()).collect()
        };
        let stopping = workers.len();
        for worker in workers {
            worker.stop(grace).await;
        }
        self.deps.analytics.flush().await;
        if self.deps.analytics.pending() > 0 {
            warn!(pending = self.deps.analytics.pending(), "analytics not fully drained");
        }
        info!(workers = stopping, "engine stopped");
    }
}
