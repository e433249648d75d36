//! InMemoryTaskStore - テスト・デモ用の TaskStore
//!
//! プロセスが終われば消えます。再起動シナリオのテストでは同じインスタンスを
//! 二つの Engine で共有することで「再起動」を再現します。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{ForwardingTask, StoreError, TaskId};
use crate::ports::TaskStore;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, ForwardingTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored copy of one task, for assertions.
    pub fn get(&self, id: TaskId) -> Option<ForwardingTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(&id).cloned()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn load_all(&self) -> Result<Vec<ForwardingTask>, StoreError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ForwardingTask> = tasks.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        Ok(all)
    }

    async fn save(&self, task: &ForwardingTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task.id, task.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelRef, PipelineConfig};
    use chrono::Utc;
    use ulid::Ulid;

    #[tokio::test]
    async fn save_overwrites_by_id() {
        let store = InMemoryTaskStore::new();
        let mut task = ForwardingTask::new(
            TaskId::from_ulid(Ulid::new()),
            ChannelRef::new("a"),
            ChannelRef::new("b"),
            PipelineConfig::default(),
            Utc::now(),
        );
        store.save(&task).await.unwrap();
        task.sync_count = 9;
        store.save(&task).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sync_count, 9);
        assert_eq!(store.get(task.id).unwrap().sync_count, 9);
    }
}
