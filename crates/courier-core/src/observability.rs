//! Per-task metrics and tracing helpers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Span;

use crate::domain::TaskId;

/// Counters that are not errors but still worth watching.
///
/// Written by one task worker, read by dashboards; plain relaxed atomics.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    delivered: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    transform_errors: AtomicU64,
    permanent_failures: AtomicU64,
    cancelled: AtomicU64,
}

impl TaskMetrics {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform_error(&self) {
        self.transform_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub delivered: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub filtered: u64,
    pub transform_errors: u64,
    pub permanent_failures: u64,
    pub cancelled: u64,
}

/// Span every worker of one task runs inside.
#[must_use]
pub fn task_span(task_id: TaskId) -> Span {
    tracing::info_span!("task", id = %task_id)
}
