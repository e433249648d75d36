//! TaskStore port - タスク定義の永続化（正本）
//!
//! TaskRegistry はメモリ上の状態を持ちますが、変更はすべてここを通して
//! 永続化されます。再起動時は `load_all()` から registry を再構築します。
//!
//! # 実装
//! - InMemoryTaskStore（テスト・デモ用）
//! - SqliteTaskStore（本番用）

use async_trait::async_trait;

use crate::domain::{ForwardingTask, StoreError};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every stored task, including Deleted ones.
    async fn load_all(&self) -> Result<Vec<ForwardingTask>, StoreError>;

    /// Insert or replace one task record.
    async fn save(&self, task: &ForwardingTask) -> Result<(), StoreError>;
}
