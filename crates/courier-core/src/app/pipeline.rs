//! Transformation Pipeline - フィルタとステージの適用
//!
//! # 流れ
//! 1. コンテンツフィルタ（ひとつでも落ちれば `Filtered`、エラーではない）
//! 2. ステージを設定順に適用（順序は決定的）
//! 3. ステージ失敗時は FailurePolicy に従う
//!    - SkipOnError: そのステージの効果を捨てて続行（warn ログ）
//!    - AbortOnError: メッセージを転送しない（TransformError）
//!
//! ステージの能力（capability）は `StageSet` に StageKind ごとに登録します。

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::filter::passes_all;
use crate::domain::{FailurePolicy, Message, PipelineConfig, StageKind, TransformError};
use crate::impls::{
    ButtonsToTextStage, CleanStage, HeaderFooterStage, RemoveLineNumbersStage, RemoveLinesStage,
    ReplaceStage, TextWatermarkStage,
};
use crate::ports::Stage;

#[derive(Debug, thiserror::Error)]
pub enum StageSetError {
    #[error("stage capability for '{0}' is already registered")]
    AlreadyRegistered(StageKind),
}

/// Stage capabilities keyed by kind.
///
/// Built during initialization (mutable), shared read-only afterwards.
#[derive(Default, Clone)]
pub struct StageSet {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local text stages that need no external service.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        set.stages.insert(StageKind::HeaderFooter, Arc::new(HeaderFooterStage));
        set.stages.insert(StageKind::Clean, Arc::new(CleanStage));
        set.stages.insert(StageKind::Replace, Arc::new(ReplaceStage));
        set.stages.insert(StageKind::Watermark, Arc::new(TextWatermarkStage));
        set.stages.insert(StageKind::RemoveLines, Arc::new(RemoveLinesStage));
        set.stages.insert(StageKind::RemoveLineNumbers, Arc::new(RemoveLineNumbersStage));
        set.stages.insert(StageKind::ButtonsToText, Arc::new(ButtonsToTextStage));
        set
    }

    pub fn register(
        &mut self,
        kind: StageKind,
        stage: Arc<dyn Stage>,
    ) -> Result<(), StageSetError> {
        if self.stages.contains_key(&kind) {
            return Err(StageSetError::AlreadyRegistered(kind));
        }
        self.stages.insert(kind, stage);
        Ok(())
    }

    /// Register or overwrite.
    pub fn replace(&mut self, kind: StageKind, stage: Arc<dyn Stage>) {
        self.stages.insert(kind, stage);
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<StageKind> {
        let mut kinds: Vec<StageKind> = self.stages.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Kinds used by `pipeline` that have no capability here.
    pub fn missing(&self, pipeline: &PipelineConfig) -> Vec<StageKind> {
        pipeline
            .kinds()
            .into_iter()
            .filter(|k| !self.stages.contains_key(k))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    /// Transformed message, ready for delivery.
    Forward(Message),
    /// Rejected by a content filter.
    Filtered,
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<StageSet>,
}

impl Pipeline {
    pub fn new(stages: Arc<StageSet>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    pub async fn apply(
        &self,
        message: &Message,
        config: &PipelineConfig,
    ) -> Result<PipelineOutput, TransformError> {
        if !passes_all(&config.filters, message) {
            debug!(message_id = %message.id, "filtered");
            return Ok(PipelineOutput::Filtered);
        }

        let mut payload = message.payload.clone();
        for (index, stage_config) in config.stages.iter().enumerate() {
            let kind = stage_config.kind();
            let stage = self
                .stages
                .get(kind)
                .ok_or(TransformError::MissingCapability(kind))?;

            match stage.apply(payload.clone(), stage_config).await {
                Ok(next) => payload = next,
                Err(source) => match config.on_error {
                    FailurePolicy::SkipOnError => {
                        warn!(message_id = %message.id, index, error = %source, "stage skipped");
                    }
                    FailurePolicy::AbortOnError => {
                        return Err(TransformError::Stage { index, source });
                    }
                },
            }
        }
        Ok(PipelineOutput::Forward(message.with_payload(payload)))
    }
}
