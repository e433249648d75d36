//! SQLite-backed `TaskStore`: task records survive restart.
//!
//! One row per task. The pipeline, pause reason and cursor ids are stored as
//! JSON; the rest are plain columns so the table stays readable from the sqlite shell.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{
    ChannelRef, ForwardingTask, MessageId, PauseReason, PipelineConfig, StoreError, TaskId,
    TaskStatus,
};
use crate::ports::TaskStore;

#[derive(Debug)]
pub struct SqliteTaskStore {
    db_path: PathBuf,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let connection = store.open_connection()?;
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                dest TEXT NOT NULL,
                status TEXT NOT NULL,
                pause_reason_json TEXT NULL,
                pipeline_json TEXT NOT NULL,
                sync_count INTEGER NOT NULL,
                last_error TEXT NULL,
                cursor TEXT NULL,
                cursor_ids_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        store.migrate(&connection)?;
        Ok(store)
    }

    /// Databases created before cursor ids were tracked lack the column.
    fn migrate(&self, connection: &Connection) -> Result<(), StoreError> {
        let has_cursor_ids = connection
            .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = 'cursor_ids_json'")?
            .exists([])?;
        if !has_cursor_ids {
            connection.execute(
                "ALTER TABLE tasks ADD COLUMN cursor_ids_json TEXT NOT NULL DEFAULT '[]'",
                [],
            )?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }
}

struct RawTask {
    id: String,
    source: String,
    dest: String,
    status: String,
    pause_reason_json: Option<String>,
    pipeline_json: String,
    sync_count: i64,
    last_error: Option<String>,
    cursor: Option<String>,
    cursor_ids_json: String,
    created_at: String,
    updated_at: String,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            dest: row.get(2)?,
            status: row.get(3)?,
            pause_reason_json: row.get(4)?,
            pipeline_json: row.get(5)?,
            sync_count: row.get(6)?,
            last_error: row.get(7)?,
            cursor: row.get(8)?,
            cursor_ids_json: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<ForwardingTask, StoreError> {
        let id: TaskId = self
            .id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("task {id}: unknown status {}", self.status)))?;
        let pause_reason: Option<PauseReason> = self
            .pause_reason_json
            .as_deref()
            .map(|raw| serde_json::from_str::<PauseReason>(raw))
            .transpose()?;
        let pipeline: PipelineConfig = serde_json::from_str(&self.pipeline_json)?;
        let sync_count = u64::try_from(self.sync_count)
            .map_err(|_| StoreError::Corrupt(format!("task {id}: negative sync_count")))?;
        let cursor = self.cursor.as_deref().map(parse_ts).transpose()?;
        let cursor_ids: Vec<MessageId> = serde_json::from_str(&self.cursor_ids_json)?;

        Ok(ForwardingTask {
            id,
            source: ChannelRef::new(self.source),
            dest: ChannelRef::new(self.dest),
            status,
            pause_reason,
            pipeline,
            sync_count,
            last_error: self.last_error,
            cursor,
            cursor_ids,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn load_all(&self) -> Result<Vec<ForwardingTask>, StoreError> {
        let connection = self.open_connection()?;
        let mut stmt = connection.prepare(
            "SELECT id, source, dest, status, pause_reason_json, pipeline_json, sync_count,
                    last_error, cursor, cursor_ids_json, created_at, updated_at
             FROM tasks ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], RawTask::from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    async fn save(&self, task: &ForwardingTask) -> Result<(), StoreError> {
        let pause_reason_json = task
            .pause_reason
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let pipeline_json = serde_json::to_string(&task.pipeline)?;
        let cursor_ids_json = serde_json::to_string(&task.cursor_ids)?;
        let sync_count = i64::try_from(task.sync_count)
            .map_err(|_| StoreError::Corrupt(format!("task {}: sync_count overflow", task.id)))?;

        let connection = self.open_connection()?;
        connection.execute(
            "INSERT INTO tasks (id, source, dest, status, pause_reason_json, pipeline_json,
                                sync_count, last_error, cursor, cursor_ids_json, created_at,
                                updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                pause_reason_json = excluded.pause_reason_json,
                pipeline_json = excluded.pipeline_json,
                sync_count = excluded.sync_count,
                last_error = excluded.last_error,
                cursor = excluded.cursor,
                cursor_ids_json = excluded.cursor_ids_json,
                updated_at = excluded.updated_at",
            params![
                task.id.to_string(),
                task.source.as_str(),
                task.dest.as_str(),
                task.status.as_str(),
                pause_reason_json,
                pipeline_json,
                sync_count,
                task.last_error,
                task.cursor.map(|c| c.to_rfc3339()),
                cursor_ids_json,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
