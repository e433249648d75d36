//! Stage port - 変換ステージの能力（capability）
//!
//! watermark / translate / rewrite の中身はこのクレートの外側です。
//! 新しい種類のステージは継承ではなく、この trait を実装して登録します。

use async_trait::async_trait;

use crate::domain::{Payload, StageConfig, StageError};

/// One transformation capability.
///
/// Must behave as a pure function of `(payload, config)`: no pipeline state,
/// no knowledge of other stages.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn apply(&self, payload: Payload, config: &StageConfig) -> Result<Payload, StageError>;
}
