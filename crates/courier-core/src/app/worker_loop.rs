//! WorkerLoop - Active なタスク一つにつき一つの実行単位
//!
//! # 流れ
//! listener → intake queue → (シーケンス番号付与) → pipeline → dispatcher（並行、最大 max_in_flight）
//! → ReleaseBuffer（番号順に放出）→ counter / registry / analytics
//!
//! # 停止
//! - ステータスが Active 以外になると watcher が CancellationToken を cancel する
//! - 送信中・バックオフ中のメッセージは Cancelled として戻り、未処理のキューと一緒に
//!   carry-over として `TaskRuntime` に残る（次の resume で最初に処理される）
//! - listener が push 待ちで抱えていたメッセージもキューの後ろに並べて carry-over する
//! - 送信タスクが panic しても番号は解放される（メッセージは carry-over、last_error に記録）
//! - `TaskRuntime`（dedup 集合、carry-over、メトリクス）は pause/resume を跨いで生き残り、
//!   delete でのみ破棄される

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::app::analytics::AnalyticsCollector;
use crate::app::counters::CounterAggregator;
use crate::app::dispatcher::{DeliveryReport, Dispatcher, FailureWindow};
use crate::app::listener::{DedupSet, IntakeQueue, ListenerContext, run_listener};
use crate::app::pipeline::{Pipeline, PipelineOutput};
use crate::app::registry::TaskRegistry;
use crate::app::sequencer::ReleaseBuffer;
use crate::config::EngineConfig;
use crate::domain::{ChannelRef, DeliveryOutcome, Message, TaskId, TaskStatus, TransformError};
use crate::observability::{TaskMetrics, task_span};
use crate::ports::MessagingPlatform;

/// Per-task state that outlives a single activation.
#[derive(Debug)]
pub struct TaskRuntime {
    dedup: Mutex<DedupSet>,
    carryover: Mutex<VecDeque<Message>>,
    failures: Mutex<FailureWindow>,
    metrics: TaskMetrics,
}

impl TaskRuntime {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            dedup: Mutex::new(DedupSet::new(
                config.intake.dedup_capacity,
                config.intake.dedup_retention(),
            )),
            carryover: Mutex::new(VecDeque::new()),
            failures: Mutex::new(FailureWindow::new(
                config.dispatch.failure_window(),
                config.dispatch.failure_threshold,
            )),
            metrics: TaskMetrics::default(),
        }
    }

    pub(crate) fn dedup(&self) -> MutexGuard<'_, DedupSet> {
        self.dedup.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, FailureWindow> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    /// Messages waiting for the next activation.
    pub fn carryover_len(&self) -> usize {
        self.carryover.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn take_carryover(&self) -> VecDeque<Message> {
        std::mem::take(&mut *self.carryover.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn put_carryover(&self, messages: impl IntoIterator<Item = Message>) {
        let mut carry = self.carryover.lock().unwrap_or_else(|e| e.into_inner());
        carry.extend(messages);
    }
}

/// Shared services every worker uses.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub registry: Arc<TaskRegistry>,
    pub platform: Arc<dyn MessagingPlatform>,
    pub pipeline: Pipeline,
    pub dispatcher: Arc<Dispatcher>,
    pub counters: Arc<CounterAggregator>,
    pub analytics: Arc<AnalyticsCollector>,
    pub config: Arc<EngineConfig>,
}

/// How a sequenced message finished.
enum Completion {
    Sent { message: Message, report: DeliveryReport },
    Filtered { message: Message },
    Aborted { message: Message, error: TransformError },
    /// Cancelled before reaching the dispatcher.
    Interrupted { message: Message },
    /// The send task panicked or was aborted.
    Crashed { message: Message, reason: String },
}

/// Sends running on the JoinSet, keyed by task id so a failed join still
/// finds its sequence number.
#[derive(Default)]
struct InFlight {
    set: JoinSet<Completion>,
    seqs: HashMap<Id, (u64, Message)>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.set.len()
    }

    fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Next finished send as `(seq, completion)`.
    async fn next(&mut self) -> Option<(u64, Completion)> {
        loop {
            let joined = self.set.join_next_with_id().await?;
            if let Some(done) = self.settle(joined) {
                return Some(done);
            }
        }
    }

    fn settle(&mut self, joined: Result<(Id, Completion), JoinError>) -> Option<(u64, Completion)> {
        match joined {
            Ok((id, completion)) => {
                let (seq, _) = self.seqs.remove(&id)?;
                Some((seq, completion))
            }
            Err(e) => {
                warn!(error = %e, "send task failed");
                let (seq, message) = self.seqs.remove(&e.id())?;
                let reason = if e.is_panic() { "panicked" } else { "was aborted" };
                Some((
                    seq,
                    Completion::Crashed {
                        reason: format!("send of {} {reason}", message.id),
                        message,
                    },
                ))
            }
        }
    }
}

enum Transformed {
    /// `outgoing` goes to the dispatcher; `original` is what gets carried over.
    Forward {
        original: Message,
        outgoing: Message,
        delay: Duration,
    },
    Done(Completion),
}

/// Handle to a running worker.
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn(
        task_id: TaskId,
        deps: WorkerDeps,
        runtime: Arc<TaskRuntime>,
        cancel: CancellationToken,
    ) -> Self {
        let worker = TaskWorker {
            task_id,
            deps,
            runtime,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(worker.run().instrument(task_span(task_id)));
        Self { cancel, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait up to `grace` for the worker to wind down, then abort it.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let mut join = self.join;
        if tokio::time::timeout(grace, &mut join).await.is_err() {
            warn!(?grace, "worker did not stop in time, aborting");
            join.abort();
            let _ = join.await;
        }
    }
}

struct TaskWorker {
    task_id: TaskId,
    deps: WorkerDeps,
    runtime: Arc<TaskRuntime>,
    cancel: CancellationToken,
}

impl TaskWorker {
    async fn run(self) {
        let task = match self.deps.registry.record(self.task_id).await {
            Ok(task) if task.status == TaskStatus::Active => task,
            _ => return,
        };
        let Ok(mut status_rx) = self.deps.registry.watch_status(self.task_id).await else {
            return;
        };

        let watcher = {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    if *status_rx.borrow_and_update() != TaskStatus::Active {
                        cancel.cancel();
                        return;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = status_rx.changed() => {
                            if changed.is_err() {
                                cancel.cancel();
                                return;
                            }
                        }
                    }
                }
            })
        };

        let queue = Arc::new(IntakeQueue::new(self.deps.config.intake.queue_capacity));
        let listener = tokio::spawn(
            run_listener(
                ListenerContext {
                    task_id: self.task_id,
                    source: task.source.clone(),
                    registry: Arc::clone(&self.deps.registry),
                    platform: Arc::clone(&self.deps.platform),
                    runtime: Arc::clone(&self.runtime),
                    queue: Arc::clone(&queue),
                    config: self.deps.config.intake.clone(),
                },
                self.cancel.clone(),
            )
            .in_current_span(),
        );

        let mut carry = self.runtime.take_carryover();
        info!(carried_over = carry.len(), "worker started");

        let max_in_flight = self.deps.config.dispatch.max_in_flight.max(1);
        let mut next_seq: u64 = 0;
        let mut release = ReleaseBuffer::new(0);
        let mut in_flight = InFlight::default();
        let mut returned: Vec<Message> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some((seq, completion)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.release(&mut release, seq, completion, &mut returned).await;
                }
                message = next_message(&mut carry, &queue), if in_flight.len() < max_in_flight => {
                    let seq = next_seq;
                    next_seq += 1;
                    match self.transform(message).await {
                        Transformed::Forward { original, outgoing, delay } => {
                            self.spawn_send(&mut in_flight, seq, original, outgoing, delay, &task.dest);
                        }
                        Transformed::Done(done) => {
                            self.release(&mut release, seq, done, &mut returned).await;
                        }
                    }
                }
            }
        }

        // wind down: the listener hands back an unqueued message, sends observe the token
        self.cancel.cancel();
        let pending = listener.await.unwrap_or_else(|e| {
            warn!(error = %e, "listener task failed");
            None
        });
        while let Some((seq, completion)) = in_flight.next().await {
            self.release(&mut release, seq, completion, &mut returned).await;
        }
        // empty unless some seq was never settled
        for (seq, completion) in release.drain() {
            self.finish(seq, completion, &mut returned).await;
        }
        watcher.abort();

        let queued = queue.drain();
        let carried = returned.len() + carry.len() + queued.len() + usize::from(pending.is_some());
        self.runtime.put_carryover(
            returned
                .into_iter()
                .chain(carry)
                .chain(queued)
                .chain(pending),
        );
        info!(carried_over = carried, "worker stopped");
    }

    /// Run the pipeline with the task's current config, unless cancelled first.
    async fn transform(&self, message: Message) -> Transformed {
        let pipeline = match self.deps.registry.record(self.task_id).await {
            Ok(task) => task.pipeline,
            Err(_) => return Transformed::Done(Completion::Interrupted { message }),
        };
        let delay = pipeline.forward_delay();
        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Transformed::Done(Completion::Interrupted { message });
            }
            output = self.deps.pipeline.apply(&message, &pipeline) => output,
        };
        match output {
            Ok(PipelineOutput::Forward(outgoing)) => Transformed::Forward {
                original: message,
                outgoing,
                delay,
            },
            Ok(PipelineOutput::Filtered) => Transformed::Done(Completion::Filtered { message }),
            Err(error) => Transformed::Done(Completion::Aborted { message, error }),
        }
    }

    /// Send `outgoing` after the task's forward delay. Completions carry `original`.
    fn spawn_send(
        &self,
        in_flight: &mut InFlight,
        seq: u64,
        original: Message,
        outgoing: Message,
        delay: Duration,
        dest: &ChannelRef,
    ) {
        let dispatcher = Arc::clone(&self.deps.dispatcher);
        let cancel = self.cancel.clone();
        let task_id = self.task_id;
        let dest = dest.clone();
        let message = original.clone();
        let handle = in_flight.set.spawn(
            async move {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Completion::Interrupted { message },
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let report = dispatcher.send(task_id, &dest, &outgoing, &cancel).await;
                Completion::Sent { message, report }
            }
            .in_current_span(),
        );
        in_flight.seqs.insert(handle.id(), (seq, original));
    }

    async fn release(
        &self,
        release: &mut ReleaseBuffer<Completion>,
        seq: u64,
        completion: Completion,
        returned: &mut Vec<Message>,
    ) {
        for (seq, completion) in release.complete(seq, completion) {
            self.finish(seq, completion, returned).await;
        }
    }

    /// Side effects of one released message, in source order.
    async fn finish(&self, seq: u64, completion: Completion, returned: &mut Vec<Message>) {
        let id = self.task_id;
        let registry = &self.deps.registry;
        let metrics = self.runtime.metrics();

        match completion {
            Completion::Sent { message, report } => {
                for attempt in &report.attempts {
                    self.deps.analytics.record(attempt.clone());
                }
                match report.outcome {
                    DeliveryOutcome::Delivered { .. } => {
                        let (count, global) = self.deps.counters.increment_on_success(id);
                        metrics.record_delivered();
                        if let Err(e) = registry
                            .record_delivery(id, count, &message, global)
                            .await
                        {
                            warn!(seq, error = %e, "failed to persist delivery");
                        }
                    }
                    DeliveryOutcome::PermanentFailure { attempts, error } => {
                        metrics.record_permanent_failure();
                        self.advance_cursor(&message).await;
                        registry
                            .report_error(
                                id,
                                format!("delivery of {} failed after {attempts} attempt(s): {error}", message.id),
                            )
                            .await;
                        self.count_failure().await;
                    }
                    DeliveryOutcome::Cancelled => {
                        metrics.record_cancelled();
                        debug!(seq, message_id = %message.id, "send cancelled, carried over");
                        returned.push(message);
                    }
                }
            }
            Completion::Filtered { message } => {
                metrics.record_filtered();
                self.advance_cursor(&message).await;
            }
            Completion::Aborted { message, error } => {
                metrics.record_transform_error();
                warn!(seq, message_id = %message.id, %error, "transform aborted, message not forwarded");
                self.advance_cursor(&message).await;
            }
            Completion::Interrupted { message } => {
                metrics.record_cancelled();
                returned.push(message);
            }
            Completion::Crashed { message, reason } => {
                metrics.record_cancelled();
                registry.report_error(id, reason).await;
                returned.push(message);
            }
        }
    }

    async fn advance_cursor(&self, message: &Message) {
        if let Err(e) = self
            .deps
            .registry
            .advance_cursor(self.task_id, message)
            .await
        {
            warn!(error = %e, "failed to persist cursor");
        }
    }

    async fn count_failure(&self) {
        let (count, exceeded) = {
            let mut window = self.runtime.failures();
            let count = window.record(Instant::now());
            (count, window.exceeded())
        };
        if !exceeded {
            return;
        }
        let dispatch = &self.deps.config.dispatch;
        let reason = format!(
            "{count} permanent delivery failures within {}s (threshold {})",
            dispatch.failure_window_secs, dispatch.failure_threshold
        );
        match self.deps.registry.auto_pause(self.task_id, reason).await {
            Ok(true) => {
                self.runtime.failures().clear();
                warn!(failures = count, "task auto-paused");
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "auto-pause failed"),
        }
    }
}

async fn next_message(carry: &mut VecDeque<Message>, queue: &IntakeQueue) -> Message {
    match carry.pop_front() {
        Some(message) => message,
        None => queue.pop().await,
    }
}
