//! Analytics Collector - 配送試行の追記専用ログ
//!
//! `record()` は呼び出し側（配送ワーカー）を決してブロックしません。
//! 書き込みは unbounded mpsc 経由で writer タスクに渡し、
//! 滞留数（pending）が閾値を超えたら「遅延中」として警告を出します。
//! 記録を捨てることはありません。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::domain::{AttemptOutcome, DeliveryAttempt, TaskId, TimeRange};

enum Command {
    Record(DeliveryAttempt),
    Flush(oneshot::Sender<()>),
}

/// Per-task attempt counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStats {
    pub success: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
}

impl AttemptStats {
    pub fn total(&self) -> u64 {
        self.success + self.transient_failures + self.permanent_failures
    }
}

#[derive(Default)]
struct AttemptLog {
    by_task: RwLock<HashMap<TaskId, Vec<DeliveryAttempt>>>,
}

impl AttemptLog {
    fn append(&self, attempt: DeliveryAttempt) {
        let mut by_task = self.by_task.write().unwrap_or_else(|e| e.into_inner());
        let log = by_task.entry(attempt.task_id).or_default();
        // stable for equal timestamps: arrival order wins
        let at = log.partition_point(|a| a.timestamp <= attempt.timestamp);
        log.insert(at, attempt);
    }
}

/// Append-only collector of delivery attempts.
pub struct AnalyticsCollector {
    tx: mpsc::UnboundedSender<Command>,
    log: Arc<AttemptLog>,
    pending: Arc<AtomicUsize>,
    lagging: Arc<AtomicBool>,
    lag_threshold: usize,
}

impl AnalyticsCollector {
    /// Start the collector and its writer task. Must be called inside a tokio runtime.
    pub fn spawn(lag_threshold: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(AttemptLog::default());
        let pending = Arc::new(AtomicUsize::new(0));
        let lagging = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_loop(
            rx,
            Arc::clone(&log),
            Arc::clone(&pending),
            Arc::clone(&lagging),
            lag_threshold,
        ));

        Self {
            tx,
            log,
            pending,
            lagging,
            lag_threshold,
        }
    }

    /// Record one attempt. Never blocks, never rejects.
    pub fn record(&self, attempt: DeliveryAttempt) {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending > self.lag_threshold && !self.lagging.swap(true, Ordering::AcqRel) {
            warn!(pending, threshold = self.lag_threshold, "analytics collector is lagging");
        }
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(Command::Record(attempt)) {
            // writer is gone (runtime shutting down): write through
            if let Command::Record(attempt) = cmd {
                self.log.append(attempt);
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Wait until every attempt recorded before this call is queryable.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Attempts of one task inside `range`, ordered by timestamp.
    pub fn query(&self, task_id: TaskId, range: TimeRange) -> Vec<DeliveryAttempt> {
        let by_task = self.log.by_task.read().unwrap_or_else(|e| e.into_inner());
        by_task
            .get(&task_id)
            .map(|log| {
                log.iter()
                    .filter(|a| range.contains(a.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self, task_id: TaskId) -> AttemptStats {
        let by_task = self.log.by_task.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = AttemptStats::default();
        for attempt in by_task.get(&task_id).into_iter().flatten() {
            match attempt.outcome {
                AttemptOutcome::Success => stats.success += 1,
                AttemptOutcome::TransientFailure => stats.transient_failures += 1,
                AttemptOutcome::PermanentFailure => stats.permanent_failures += 1,
            }
        }
        stats
    }

    /// Attempts accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Acquire)
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    log: Arc<AttemptLog>,
    pending: Arc<AtomicUsize>,
    lagging: Arc<AtomicBool>,
    lag_threshold: usize,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Record(attempt) => {
                log.append(attempt);
                let left = pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                if left <= lag_threshold && lagging.swap(false, Ordering::AcqRel) {
                    debug!(pending = left, "analytics collector caught up");
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
