//! Task Registry - タスク定義とライフサイクルの正本
//!
//! # 設計
//! - すべての変更は一つの write lock の中で「検証 → 永続化 → 反映 → 通知」の順に行う
//!   （永続化に失敗したらメモリ上の状態は変わらない）
//! - ステータスは所有ワーカーへ `watch` で、変更イベントはダッシュボードへ `broadcast` で流す
//! - 削除は論理削除（Deleted は終端状態、レコードは残る）

use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{info, warn};

use crate::app::pipeline::StageSet;
use crate::domain::{
    ChannelRef, ForwardingTask, Message, PauseReason, PipelineConfig, RegistryError, TaskEvent,
    TaskEventKind, TaskId, TaskStatus, TaskSummary, Transition,
};
use crate::ports::{Clock, IdGenerator, MessagingPlatform, TaskStore};

const EVENT_BUFFER: usize = 1024;

struct Entry {
    task: ForwardingTask,
    status_tx: watch::Sender<TaskStatus>,
}

impl Entry {
    fn new(task: ForwardingTask) -> Self {
        let (status_tx, _) = watch::channel(task.status);
        Self { task, status_tx }
    }
}

pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    store: Arc<dyn TaskStore>,
    platform: Arc<dyn MessagingPlatform>,
    stages: Arc<StageSet>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        platform: Arc<dyn MessagingPlatform>,
        stages: Arc<StageSet>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tasks: RwLock::new(HashMap::new()),
            store,
            platform,
            stages,
            ids,
            clock,
            events,
        }
    }

    /// Load persisted records. Returns them so the caller can restart workers.
    pub async fn restore(&self) -> Result<Vec<ForwardingTask>, RegistryError> {
        let loaded = self.store.load_all().await?;
        let mut tasks = self.tasks.write().await;
        for task in &loaded {
            tasks.insert(task.id, Entry::new(task.clone()));
        }
        info!(count = loaded.len(), "restored tasks");
        Ok(loaded)
    }

    fn emit(&self, task_id: TaskId, kind: TaskEventKind) {
        // no subscribers is fine
        let _ = self.events.send(TaskEvent::new(task_id, self.clock.now(), kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn check_pipeline(&self, pipeline: &PipelineConfig) -> Result<(), RegistryError> {
        pipeline.validate().map_err(RegistryError::Config)?;
        let missing = self.stages.missing(pipeline);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            return Err(RegistryError::Config(format!(
                "no capability registered for stage kind(s): {}",
                names.join(", ")
            )));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        source: ChannelRef,
        dest: ChannelRef,
        pipeline: PipelineConfig,
    ) -> Result<TaskId, RegistryError> {
        if source.is_blank() || dest.is_blank() {
            return Err(RegistryError::Config(
                "source and destination must not be empty".to_string(),
            ));
        }
        if source == dest {
            return Err(RegistryError::Config(format!(
                "source and destination are the same channel: {source}"
            )));
        }
        self.check_pipeline(&pipeline)?;
        for channel in [&source, &dest] {
            self.platform
                .resolve(channel)
                .await
                .map_err(|e| RegistryError::Config(format!("cannot resolve {channel}: {e}")))?;
        }

        let task = ForwardingTask::new(
            self.ids.generate_task_id(),
            source,
            dest,
            pipeline,
            self.clock.now(),
        );
        let mut tasks = self.tasks.write().await;
        self.store.save(&task).await?;
        let id = task.id;
        let summary = task.summary();
        tasks.insert(id, Entry::new(task));
        drop(tasks);

        info!(task_id = %id, source = %summary.source, dest = %summary.dest, "task created");
        self.emit(id, TaskEventKind::Created { summary });
        Ok(id)
    }

    /// Every task, Deleted ones included, oldest first.
    pub async fn list(&self) -> Vec<TaskSummary> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<&ForwardingTask> = tasks.values().map(|e| &e.task).collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all.into_iter().map(ForwardingTask::summary).collect()
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskSummary, RegistryError> {
        self.record(id).await.map(|t| t.summary())
    }

    /// Full record, including pipeline and cursor.
    pub async fn record(&self, id: TaskId) -> Result<ForwardingTask, RegistryError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(|e| e.task.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    pub async fn watch_status(&self, id: TaskId) -> Result<watch::Receiver<TaskStatus>, RegistryError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(|e| e.status_tx.subscribe())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Apply `f` to a copy of the record, persist it, then commit.
    async fn mutate<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut ForwardingTask, DateTime<Utc>) -> Result<R, RegistryError>,
    ) -> Result<(ForwardingTask, R), RegistryError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let mut updated = entry.task.clone();
        let out = f(&mut updated, self.clock.now())?;
        self.store.save(&updated).await?;
        entry.task = updated.clone();
        entry.status_tx.send_if_modified(|status| {
            let changed = *status != updated.status;
            *status = updated.status;
            changed
        });
        Ok((updated, out))
    }

    async fn transition(
        &self,
        id: TaskId,
        transition: Transition,
        reason: Option<PauseReason>,
    ) -> Result<ForwardingTask, RegistryError> {
        let (task, ()) = self
            .mutate(id, |task, now| {
                let from = task.status;
                task.apply(transition, reason, now)
                    .map(|_| ())
                    .ok_or(RegistryError::InvalidTransition {
                        task_id: id,
                        from,
                        transition,
                    })
            })
            .await?;
        info!(task_id = %id, %transition, status = %task.status, "task status changed");
        self.emit(
            id,
            TaskEventKind::StatusChanged {
                status: task.status,
                reason: task.pause_reason.clone(),
            },
        );
        Ok(task)
    }

    pub async fn pause(&self, id: TaskId) -> Result<ForwardingTask, RegistryError> {
        self.transition(id, Transition::Pause, Some(PauseReason::Manual))
            .await
    }

    pub async fn resume(&self, id: TaskId) -> Result<ForwardingTask, RegistryError> {
        self.transition(id, Transition::Resume, None).await
    }

    pub async fn delete(&self, id: TaskId) -> Result<ForwardingTask, RegistryError> {
        self.transition(id, Transition::Delete, None).await
    }

    /// Pause requested by the dispatcher. `Ok(false)` if the task is no longer Active.
    pub async fn auto_pause(&self, id: TaskId, reason: String) -> Result<bool, RegistryError> {
        let status = self.record(id).await?.status;
        if status != TaskStatus::Active {
            return Ok(false);
        }
        match self
            .transition(id, Transition::Pause, Some(PauseReason::AutoErrors { reason }))
            .await
        {
            Ok(_) => Ok(true),
            // lost a race with a manual transition
            Err(RegistryError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_last_error(&self, id: TaskId, error: String) -> Result<(), RegistryError> {
        let message = error.clone();
        self.mutate(id, |task, now| {
            task.last_error = Some(error);
            task.updated_at = now;
            Ok(())
        })
        .await?;
        self.emit(id, TaskEventKind::LastError { error: message });
        Ok(())
    }

    /// Worker-side `set_last_error`: logs instead of failing.
    pub(crate) async fn report_error(&self, id: TaskId, error: String) {
        warn!(task_id = %id, %error, "task error");
        if let Err(e) = self.set_last_error(id, error).await {
            warn!(task_id = %id, error = %e, "failed to record task error");
        }
    }

    /// Record a released delivery: new count and intake cursor, persisted together.
    pub async fn record_delivery(
        &self,
        id: TaskId,
        sync_count: u64,
        released: &Message,
        global_total: u64,
    ) -> Result<(), RegistryError> {
        let (task, ()) = self
            .mutate(id, |task, now| {
                task.record_delivery(sync_count, now);
                task.advance_cursor(&released.id, released.source_timestamp, now);
                Ok(())
            })
            .await?;
        self.emit(
            id,
            TaskEventKind::SyncCountChanged {
                sync_count: task.sync_count,
                global_total,
            },
        );
        Ok(())
    }

    /// Move the intake cursor past a message that was released without delivery.
    pub async fn advance_cursor(&self, id: TaskId, released: &Message) -> Result<(), RegistryError> {
        self.mutate(id, |task, now| {
            task.advance_cursor(&released.id, released.source_timestamp, now);
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn update_pipeline(
        &self,
        id: TaskId,
        pipeline: PipelineConfig,
    ) -> Result<(), RegistryError> {
        self.check_pipeline(&pipeline)?;
        self.mutate(id, |task, now| {
            if task.status.is_terminal() {
                return Err(RegistryError::Deleted(id));
            }
            task.pipeline = pipeline;
            task.updated_at = now;
            Ok(())
        })
        .await?;
        info!(task_id = %id, "pipeline updated");
        self.emit(id, TaskEventKind::PipelineUpdated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Payload, StageConfig, StoreError};
    use crate::impls::{InMemoryPlatform, InMemoryTaskStore};
    use crate::ports::{SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use rstest::rstest;

    struct Fixture {
        registry: TaskRegistry,
        store: Arc<InMemoryTaskStore>,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(InMemoryPlatform::new());
        for ch in ["src", "dst", "other"] {
            platform.add_channel(ch);
        }
        let store = Arc::new(InMemoryTaskStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = TaskRegistry::new(
            store.clone(),
            platform,
            Arc::new(StageSet::with_builtins()),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
        );
        Fixture { registry, store }
    }

    async fn create(registry: &TaskRegistry) -> TaskId {
        registry
            .create("src".into(), "dst".into(), PipelineConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_starts_active_with_zero_count() {
        let fx = fixture();
        let id = create(&fx.registry).await;
        let summary = fx.registry.get(id).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Active);
        assert_eq!(summary.sync_count, 0);
        assert!(summary.last_error.is_none());
        assert!(fx.store.get(id).is_some());
    }

    #[rstest]
    #[case("", "dst")]
    #[case("src", "  ")]
    #[case("src", "src")]
    #[case("ghost", "dst")]
    #[case("src", "ghost")]
    #[tokio::test]
    async fn create_rejects_bad_channels(#[case] source: &str, #[case] dest: &str) {
        let fx = fixture();
        let err = fx
            .registry
            .create(source.into(), dest.into(), PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)), "{err}");
        assert!(fx.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_stage_without_capability() {
        let fx = fixture();
        let pipeline = PipelineConfig::new(vec![StageConfig::Translate {
            target_lang: "ja".into(),
        }]);
        let err = fx
            .registry
            .create("src".into(), "dst".into(), pipeline)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("translate"));
    }

    #[tokio::test]
    async fn lifecycle_follows_the_transition_table() {
        let fx = fixture();
        let id = create(&fx.registry).await;

        let err = fx.registry.resume(id).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        fx.registry.pause(id).await.unwrap();
        assert!(fx.registry.pause(id).await.is_err());
        let task = fx.registry.resume(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Active);

        fx.registry.delete(id).await.unwrap();
        for result in [
            fx.registry.pause(id).await,
            fx.registry.resume(id).await,
            fx.registry.delete(id).await,
        ] {
            assert!(matches!(
                result,
                Err(RegistryError::InvalidTransition {
                    from: TaskStatus::Deleted,
                    ..
                })
            ));
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let fx = fixture();
        let ghost = TaskId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            fx.registry.pause(ghost).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            fx.registry.get(ghost).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_watch_sees_transitions() {
        let fx = fixture();
        let id = create(&fx.registry).await;
        let mut rx = fx.registry.watch_status(id).await.unwrap();
        assert_eq!(*rx.borrow_and_update(), TaskStatus::Active);

        fx.registry.pause(id).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), TaskStatus::Paused);
    }

    #[tokio::test]
    async fn auto_pause_only_from_active() {
        let fx = fixture();
        let id = create(&fx.registry).await;
        assert!(fx.registry.auto_pause(id, "6 failures in 300s".into()).await.unwrap());
        let summary = fx.registry.get(id).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Paused);
        assert!(matches!(summary.pause_reason, Some(PauseReason::AutoErrors { .. })));

        assert!(!fx.registry.auto_pause(id, "again".into()).await.unwrap());
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let fx = fixture();
        let mut events = fx.registry.subscribe();
        let id = create(&fx.registry).await;
        let released = Message::new("m-1", Payload::text("x"), Utc::now());
        fx.registry.record_delivery(id, 1, &released, 1).await.unwrap();
        fx.registry.set_last_error(id, "boom".into()).await.unwrap();

        assert!(matches!(events.recv().await.unwrap().kind, TaskEventKind::Created { .. }));
        assert_eq!(
            events.recv().await.unwrap().kind,
            TaskEventKind::SyncCountChanged {
                sync_count: 1,
                global_total: 1
            }
        );
        assert_eq!(
            events.recv().await.unwrap().kind,
            TaskEventKind::LastError {
                error: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn record_delivery_persists_count_and_cursor() {
        let fx = fixture();
        let id = create(&fx.registry).await;
        let ts = Utc::now();
        let released = Message::new("m-3", Payload::text("x"), ts);
        fx.registry.record_delivery(id, 3, &released, 3).await.unwrap();
        let stored = fx.store.get(id).unwrap();
        assert_eq!(stored.sync_count, 3);
        assert_eq!(stored.cursor, Some(ts));
        assert_eq!(stored.cursor_ids, vec![released.id]);
    }

    #[tokio::test]
    async fn update_pipeline_rejected_after_delete() {
        let fx = fixture();
        let id = create(&fx.registry).await;
        let pipeline = PipelineConfig::new(vec![StageConfig::HeaderFooter {
            header: Some("H".into()),
            footer: None,
        }]);
        fx.registry.update_pipeline(id, pipeline.clone()).await.unwrap();
        assert_eq!(fx.registry.record(id).await.unwrap().pipeline, pipeline);

        fx.registry.delete(id).await.unwrap();
        assert!(matches!(
            fx.registry.update_pipeline(id, pipeline).await,
            Err(RegistryError::Deleted(_))
        ));
    }

    struct BrokenStore;

    #[async_trait]
    impl TaskStore for BrokenStore {
        async fn load_all(&self) -> Result<Vec<ForwardingTask>, StoreError> {
            Ok(Vec::new())
        }

        async fn save(&self, _task: &ForwardingTask) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn failed_persist_leaves_no_task_behind() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.add_channel("src");
        platform.add_channel("dst");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = TaskRegistry::new(
            Arc::new(BrokenStore),
            platform,
            Arc::new(StageSet::with_builtins()),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
        );
        let err = registry
            .create("src".into(), "dst".into(), PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(registry.list().await.is_empty());
    }
}
