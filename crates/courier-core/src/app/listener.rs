//! Intake Listener - 送信元チャネルの購読、重複排除、取り込みキュー
//!
//! # 構成
//! - **DedupSet**: 最近見たメッセージ ID の有界集合（FIFO 追い出し + 任意の保持期間）
//! - **IntakeQueue**: 有界キュー。満杯なら push_timeout だけ待ち、それでも空かなければ
//!   最古の要素を捨てる（`dropped` メトリクス）。待機中に cancel されたら何も捨てずに
//!   メッセージを呼び出し元へ返す
//! - **run_listener**: subscribe → dedup → push のループ。ストリームが切れたら
//!   last_error に記録して resubscribe_delay 後に再購読する。購読はカーソル時刻を含めて
//!   再生されるので、その時刻で放出済みの ID（`cursor_ids`）を先に dedup へ入れておく

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::registry::TaskRegistry;
use crate::app::worker_loop::TaskRuntime;
use crate::config::IntakeConfig;
use crate::domain::{ChannelRef, Message, MessageId, TaskId};
use crate::ports::MessagingPlatform;

/// Bounded set of recently seen message ids.
#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    retention: Option<Duration>,
    order: VecDeque<(MessageId, Instant)>,
    seen: HashSet<MessageId>,
}

impl DedupSet {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        let Some(retention) = self.retention else {
            return;
        };
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) <= retention {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }

    /// `true` if `id` was not seen before (and is now remembered).
    pub fn insert(&mut self, id: &MessageId, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.clone());
        self.order.push_back((id.clone(), now));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// The queue stayed full for the whole timeout; this item was evicted.
    DroppedOldest(Message),
    /// Cancelled while waiting for room. The message was not queued.
    Cancelled(Message),
}

/// Bounded single-producer single-consumer queue between listener and worker.
#[derive(Debug)]
pub struct IntakeQueue {
    items: Mutex<VecDeque<Message>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl IntakeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_push(&self, message: Message) -> Result<(), Message> {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            return Err(message);
        }
        items.push_back(message);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, waiting up to `timeout` for room before evicting the oldest item.
    ///
    /// Cancellation wins over the timeout: nothing is evicted once `cancel` fires.
    pub async fn push(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PushOutcome {
        let deadline = Instant::now() + timeout;
        let mut message = message;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            message = match self.try_push(message) {
                Ok(()) => return PushOutcome::Queued,
                Err(message) => message,
            };

            let timed_out = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PushOutcome::Cancelled(message),
                waited = tokio::time::timeout_at(deadline, notified) => waited.is_err(),
            };
            if timed_out {
                let mut items = self.lock();
                let evicted = if items.len() >= self.capacity {
                    items.pop_front()
                } else {
                    None
                };
                items.push_back(message);
                drop(items);
                self.not_empty.notify_one();
                return match evicted {
                    Some(old) => PushOutcome::DroppedOldest(old),
                    None => PushOutcome::Queued,
                };
            }
        }
    }

    /// Wait for the next item.
    pub async fn pop(&self) -> Message {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.lock().pop_front();
            if let Some(message) = next {
                self.not_full.notify_one();
                return message;
            }
            notified.await;
        }
    }

    /// Everything still queued, oldest first.
    pub fn drain(&self) -> Vec<Message> {
        let drained: Vec<Message> = self.lock().drain(..).collect();
        self.not_full.notify_one();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub(crate) struct ListenerContext {
    pub task_id: TaskId,
    pub source: ChannelRef,
    pub registry: Arc<TaskRegistry>,
    pub platform: Arc<dyn MessagingPlatform>,
    pub runtime: Arc<TaskRuntime>,
    pub queue: Arc<IntakeQueue>,
    pub config: IntakeConfig,
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause_for(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Subscribe and feed the intake queue until cancelled.
///
/// Returns the message that passed dedup but could not be queued before
/// cancellation; the worker carries it over behind the queued ones.
pub(crate) async fn run_listener(ctx: ListenerContext, cancel: CancellationToken) -> Option<Message> {
    loop {
        let since = match ctx.registry.record(ctx.task_id).await {
            Ok(task) => {
                let mut dedup = ctx.runtime.dedup();
                let now = Instant::now();
                for id in &task.cursor_ids {
                    dedup.insert(id, now);
                }
                task.intake_after()
            }
            Err(_) => return None,
        };

        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            sub = ctx.platform.subscribe(&ctx.source, since) => sub,
        };
        let mut subscription = match subscribed {
            Ok(sub) => sub,
            Err(e) => {
                ctx.registry
                    .report_error(ctx.task_id, format!("source unreachable: {e}"))
                    .await;
                if !pause_for(ctx.config.resubscribe_delay(), &cancel).await {
                    return None;
                }
                continue;
            }
        };
        info!(source = %ctx.source, %since, "subscribed");

        let reason = loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                item = subscription.recv() => item,
            };
            let message = match item {
                Some(Ok(message)) => message,
                Some(Err(e)) => break format!("source unreachable: {e}"),
                None => break "source stream ended".to_string(),
            };

            let fresh = {
                let mut dedup = ctx.runtime.dedup();
                dedup.insert(&message.id, Instant::now())
            };
            if !fresh {
                ctx.runtime.metrics().record_duplicate();
                debug!(message_id = %message.id, "duplicate dropped");
                continue;
            }

            match ctx.queue.push(message, ctx.config.push_timeout(), &cancel).await {
                PushOutcome::Queued => {}
                PushOutcome::DroppedOldest(old) => {
                    ctx.runtime.metrics().record_dropped();
                    warn!(message_id = %old.id, "intake queue full, dropped oldest");
                }
                PushOutcome::Cancelled(pending) => {
                    debug!(message_id = %pending.id, "push cancelled, handing back");
                    return Some(pending);
                }
            }
        };

        ctx.registry.report_error(ctx.task_id, reason).await;
        if !pause_for(ctx.config.resubscribe_delay(), &cancel).await {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use chrono::Utc;

    fn msg(id: &str) -> Message {
        Message::new(id, Payload::text(id), Utc::now())
    }

    #[test]
    fn dedup_rejects_seen_ids() {
        let mut dedup = DedupSet::new(10, None);
        let now = Instant::now();
        assert!(dedup.insert(&MessageId::new("a"), now));
        assert!(!dedup.insert(&MessageId::new("a"), now));
        assert!(dedup.insert(&MessageId::new("b"), now));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn dedup_evicts_oldest_past_capacity() {
        let mut dedup = DedupSet::new(2, None);
        let now = Instant::now();
        dedup.insert(&MessageId::new("a"), now);
        dedup.insert(&MessageId::new("b"), now);
        dedup.insert(&MessageId::new("c"), now);
        assert!(!dedup.contains(&MessageId::new("a")));
        assert!(dedup.contains(&MessageId::new("c")));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn dedup_forgets_after_retention() {
        let mut dedup = DedupSet::new(10, Some(Duration::from_secs(60)));
        let t0 = Instant::now();
        dedup.insert(&MessageId::new("a"), t0);
        assert!(!dedup.insert(&MessageId::new("a"), t0 + Duration::from_secs(30)));
        assert!(dedup.insert(&MessageId::new("a"), t0 + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let queue = IntakeQueue::new(4);
        queue.push(msg("1"), Duration::ZERO, &CancellationToken::new()).await;
        queue.push(msg("2"), Duration::ZERO, &CancellationToken::new()).await;
        assert_eq!(queue.pop().await.id.as_str(), "1");
        assert_eq!(queue.pop().await.id.as_str(), "2");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_after_timeout() {
        let queue = IntakeQueue::new(2);
        queue.push(msg("1"), Duration::ZERO, &CancellationToken::new()).await;
        queue.push(msg("2"), Duration::ZERO, &CancellationToken::new()).await;

        match queue.push(msg("3"), Duration::from_millis(20), &CancellationToken::new()).await {
            PushOutcome::DroppedOldest(old) => assert_eq!(old.id.as_str(), "1"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(queue.len(), 2);
        let rest: Vec<String> = queue.drain().into_iter().map(|m| m.id.to_string()).collect();
        assert_eq!(rest, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn blocked_push_completes_when_consumer_pops() {
        let queue = Arc::new(IntakeQueue::new(1));
        queue.push(msg("1"), Duration::ZERO, &CancellationToken::new()).await;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .push(msg("2"), Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.pop().await.id.as_str(), "1");

        assert_eq!(producer.await.unwrap(), PushOutcome::Queued);
        assert_eq!(queue.pop().await.id.as_str(), "2");
    }

    #[tokio::test]
    async fn cancelled_push_hands_the_message_back_without_evicting() {
        let queue = Arc::new(IntakeQueue::new(1));
        let cancel = CancellationToken::new();
        queue.push(msg("1"), Duration::ZERO, &cancel).await;

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.push(msg("2"), Duration::from_secs(30), &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        match producer.await.unwrap() {
            PushOutcome::Cancelled(pending) => assert_eq!(pending.id.as_str(), "2"),
            other => panic!("unexpected outcome {other:?}"),
        }
        let rest: Vec<String> = queue.drain().into_iter().map(|m| m.id.to_string()).collect();
        assert_eq!(rest, vec!["1"]);
    }
}
