//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - `expect_stages()` で必要なステージ種別を宣言し、未登録なら build() で失敗
//! - 永続化済みタスクのパイプラインが未登録のステージを使っていても失敗
//! - 設定値の検証（`EngineConfig::validate`）

use std::sync::Arc;

use crate::app::analytics::AnalyticsCollector;
use crate::app::counters::CounterAggregator;
use crate::app::dispatcher::Dispatcher;
use crate::app::pipeline::{Pipeline, StageSet, StageSetError};
use crate::app::registry::TaskRegistry;
use crate::app::runtime::Engine;
use crate::app::worker_loop::WorkerDeps;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{RegistryError, StageKind, TaskId};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, MessagingPlatform, Stage, SystemClock, TaskStore, UlidGenerator};

/// Builds an [`Engine`].
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(config)
///     .platform(platform)
///     .register_stage(StageKind::Translate, Arc::new(MyTranslator))?
///     .expect_stages(&[StageKind::Translate])
///     .build()
///     .await?;
/// ```
///
/// Defaults: in-memory task store, system clock, ULID ids, the built-in
/// text stages.
pub struct EngineBuilder {
    config: EngineConfig,
    stages: StageSet,
    expected_stages: Option<Vec<StageKind>>,
    platform: Option<Arc<dyn MessagingPlatform>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing stage kinds: {0:?}. These stages were expected but not registered.")]
    MissingStageKinds(Vec<StageKind>),

    #[error("no messaging platform configured")]
    MissingPlatform,

    #[error("task {task_id} uses unregistered stage kinds: {kinds:?}")]
    UnsupportedPipeline {
        task_id: TaskId,
        kinds: Vec<StageKind>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to restore tasks: {0}")]
    Restore(#[from] RegistryError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            stages: StageSet::with_builtins(),
            expected_stages: None,
            platform: None,
            store: None,
            clock: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn platform(mut self, platform: Arc<dyn MessagingPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Register a stage capability. A kind can only be registered once.
    pub fn register_stage(
        mut self,
        kind: StageKind,
        stage: Arc<dyn Stage>,
    ) -> Result<Self, StageSetError> {
        self.stages.register(kind, stage)?;
        Ok(self)
    }

    /// Swap a built-in stage for another implementation.
    pub fn replace_stage(mut self, kind: StageKind, stage: Arc<dyn Stage>) -> Self {
        self.stages.replace(kind, stage);
        self
    }

    /// Stage kinds that must be registered for `build()` to succeed.
    pub fn expect_stages(mut self, kinds: &[StageKind]) -> Self {
        self.expected_stages = Some(kinds.to_vec());
        self
    }

    /// Validate, restore persisted tasks and start their workers.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_stages {
            let registered = self.stages.registered_kinds();
            let missing: Vec<StageKind> = expected
                .iter()
                .filter(|k| !registered.contains(k))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingStageKinds(missing));
            }
        }

        let platform = self.platform.ok_or(BuildError::MissingPlatform)?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let stages = Arc::new(self.stages);
        let config = Arc::new(self.config);

        let registry = Arc::new(TaskRegistry::new(
            store,
            Arc::clone(&platform),
            Arc::clone(&stages),
            Arc::clone(&ids),
            Arc::clone(&clock),
        ));
        let persisted = registry.restore().await?;
        for task in persisted.iter().filter(|t| !t.status.is_terminal()) {
            let kinds = stages.missing(&task.pipeline);
            if !kinds.is_empty() {
                return Err(BuildError::UnsupportedPipeline {
                    task_id: task.id,
                    kinds,
                });
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&platform),
            ids,
            clock,
            &config.retry,
        ));
        let deps = WorkerDeps {
            registry,
            platform,
            pipeline: Pipeline::new(stages),
            dispatcher,
            counters: Arc::new(CounterAggregator::new()),
            analytics: Arc::new(AnalyticsCollector::spawn(config.analytics.lag_threshold)),
            config,
        };

        let engine = Engine::new(deps);
        engine.resume_persisted(persisted).await;
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelRef, ForwardingTask, PipelineConfig, StageConfig, TaskStatus};
    use crate::impls::{InMemoryPlatform, LabelTranslator, StyleRewriter};
    use chrono::Utc;
    use ulid::Ulid;

    fn platform() -> Arc<InMemoryPlatform> {
        Arc::new(InMemoryPlatform::new())
    }

    #[tokio::test]
    async fn builds_with_defaults() {
        let engine = EngineBuilder::new().platform(platform()).build().await;
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn missing_platform_is_an_error() {
        let err = EngineBuilder::new().build().await.err().unwrap();
        assert!(matches!(err, BuildError::MissingPlatform));
    }

    #[tokio::test]
    async fn expected_stages_must_be_registered() {
        let err = EngineBuilder::new()
            .platform(platform())
            .register_stage(StageKind::Translate, Arc::new(LabelTranslator))
            .unwrap()
            .expect_stages(&[StageKind::Translate, StageKind::Rewrite, StageKind::Clean])
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::MissingStageKinds(missing) if missing == vec![StageKind::Rewrite]
        ));
    }

    #[tokio::test]
    async fn expected_stages_satisfied() {
        let engine = EngineBuilder::new()
            .platform(platform())
            .register_stage(StageKind::Translate, Arc::new(LabelTranslator))
            .unwrap()
            .register_stage(StageKind::Rewrite, Arc::new(StyleRewriter))
            .unwrap()
            .expect_stages(&[StageKind::Translate, StageKind::Rewrite])
            .build()
            .await;
        assert!(engine.is_ok());
    }

    #[test]
    fn built_in_stage_cannot_be_registered_twice() {
        let result = EngineBuilder::new().register_stage(StageKind::Clean, Arc::new(StyleRewriter));
        assert!(matches!(
            result.err(),
            Some(StageSetError::AlreadyRegistered(StageKind::Clean))
        ));
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        let err = EngineBuilder::new()
            .config(config)
            .platform(platform())
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn persisted_task_with_unknown_stage_fails_fast() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = ForwardingTask::new(
            TaskId::from_ulid(Ulid::new()),
            ChannelRef::new("src"),
            ChannelRef::new("dst"),
            PipelineConfig::new(vec![StageConfig::Translate {
                target_lang: "fr".into(),
            }]),
            Utc::now(),
        );
        task.status = TaskStatus::Paused;
        store.save(&task).await.unwrap();

        let err = EngineBuilder::new()
            .platform(platform())
            .store(store)
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::UnsupportedPipeline { task_id, .. } if task_id == task.id
        ));
    }
}
