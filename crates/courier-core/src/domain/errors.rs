//! Errors - エラー型と分類
//!
//! 関心ごとに thiserror の enum を一つずつ定義します。
//! - RegistryError: タスク操作の誤用（Config / NotFound / InvalidTransition / Deleted）
//! - StoreError: 永続化レイヤーの障害
//! - StageError / TransformError: パイプラインの失敗（タスクは止めない）
//! - PlatformError: メッセージングプラットフォームの障害
//! - DeliveryError: 送信失敗の分類（Transient はリトライ、Permanent は記録のみ）

use thiserror::Error;

use super::ids::TaskId;
use super::stage::StageKind;
use super::task::{ChannelRef, TaskStatus, Transition};

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 一時的なエラー（リトライ推奨）
    Transient,
    /// 恒久的なエラー（リトライ無意味）
    Permanent,
    /// インフラエラー（ストレージなど）
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid task configuration: {0}")]
    Config(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("cannot {transition} task {task_id} in status {from}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        transition: Transition,
    },

    #[error("task {0} is deleted")]
    Deleted(TaskId),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Storage(_) => ErrorKind::Infrastructure,
            _ => ErrorKind::Permanent,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt task record: {0}")]
    Corrupt(String),
}

/// Failure of a single stage capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} stage failed: {message}")]
pub struct StageError {
    pub kind: StageKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("stage #{index}: {source}")]
    Stage { index: usize, source: StageError },

    #[error("no capability registered for stage kind {0}")]
    MissingCapability(StageKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelRef),

    #[error("channel unreachable: {0}")]
    Unreachable(String),
}

/// Classification of a failed send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Transient(_) => ErrorKind::Transient,
            DeliveryError::Permanent(_) => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn invalid_transition_message_names_everything() {
        let id = TaskId::from_ulid(Ulid::new());
        let err = RegistryError::InvalidTransition {
            task_id: id,
            from: TaskStatus::Deleted,
            transition: Transition::Resume,
        };
        let msg = err.to_string();
        assert!(msg.contains("resume"));
        assert!(msg.contains("DELETED"));
        assert!(msg.contains(&id.to_string()));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn transform_error_wraps_stage_error() {
        let err = TransformError::Stage {
            index: 2,
            source: StageError::new(StageKind::Rewrite, "unknown style"),
        };
        assert_eq!(err.to_string(), "stage #2: rewrite stage failed: unknown style");
    }
}
