//! InMemoryPlatform - 開発用・テスト用のメッセージングプラットフォーム
//!
//! # 実装詳細
//! - チャネルごとに履歴（history）と購読者（subscribers）を保持
//! - subscribe は `since` 以降（同時刻を含む）の履歴を再生してからライブ配信に切り替える
//! - 宛先チャネルの挙動（常に成功、一時エラー、恒久エラー、遅延など）をテストから差し替えられる
//! - std::sync::Mutex は await を跨いで保持しない

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::{ChannelRef, DeliveryResult, Message, Payload, PlatformError};
use crate::ports::{MessagingPlatform, Subscription};

/// How a destination channel answers `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DestinationBehavior {
    #[default]
    AlwaysOk,
    AlwaysTransient(String),
    AlwaysPermanent(String),
    /// The first `n` sends fail transiently, then everything succeeds.
    FailFirst { n: u32, error: String },
    /// Payloads containing `needle` fail permanently, the rest succeed.
    RejectContaining { needle: String, error: String },
    /// Succeed after sleeping.
    Delay(Duration),
    /// Payloads containing `needle` succeed after `delay`, the rest at once.
    DelayContaining { needle: String, delay: Duration },
}

type Subscriber = mpsc::UnboundedSender<Result<Message, PlatformError>>;

#[derive(Default)]
struct ChannelState {
    history: Vec<Message>,
    subscribers: Vec<Subscriber>,
    behavior: DestinationBehavior,
    delivered: Vec<Payload>,
    send_calls: u32,
}

enum SendPlan {
    Done(DeliveryResult),
    DelayThenDeliver(Duration),
}

#[derive(Default)]
pub struct InMemoryPlatform {
    channels: Mutex<HashMap<ChannelRef, ChannelState>>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_channels<R>(&self, f: impl FnOnce(&mut HashMap<ChannelRef, ChannelState>) -> R) -> R {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut channels)
    }

    /// Make a channel known (resolvable) without publishing anything.
    pub fn add_channel(&self, channel: impl Into<ChannelRef>) {
        let channel = channel.into();
        self.with_channels(|chs| {
            chs.entry(channel).or_default();
        });
    }

    /// Post a message to a channel: retained in history and pushed to live subscribers.
    pub fn publish(&self, channel: impl Into<ChannelRef>, message: Message) {
        let channel = channel.into();
        self.with_channels(|chs| {
            let state = chs.entry(channel).or_default();
            state
                .subscribers
                .retain(|tx| tx.send(Ok(message.clone())).is_ok());
            state.history.push(message);
        });
    }

    pub fn set_behavior(&self, channel: impl Into<ChannelRef>, behavior: DestinationBehavior) {
        let channel = channel.into();
        self.with_channels(|chs| chs.entry(channel).or_default().behavior = behavior);
    }

    /// Payloads successfully delivered to `channel`, in arrival order.
    pub fn delivered(&self, channel: &ChannelRef) -> Vec<Payload> {
        self.with_channels(|chs| {
            chs.get(channel)
                .map(|s| s.delivered.clone())
                .unwrap_or_default()
        })
    }

    /// Number of `send_message` calls that reached `channel`.
    pub fn send_calls(&self, channel: &ChannelRef) -> u32 {
        self.with_channels(|chs| chs.get(channel).map_or(0, |s| s.send_calls))
    }

    pub fn subscriber_count(&self, channel: &ChannelRef) -> usize {
        self.with_channels(|chs| {
            chs.get(channel).map_or(0, |s| {
                s.subscribers.iter().filter(|tx| !tx.is_closed()).count()
            })
        })
    }

    /// End every live stream on `channel`, as a dropped connection would.
    pub fn close_streams(&self, channel: &ChannelRef) {
        self.with_channels(|chs| {
            if let Some(state) = chs.get_mut(channel) {
                state.subscribers.clear();
            }
        });
    }

    /// Push a stream error to every live subscriber of `channel`.
    pub fn fail_streams(&self, channel: &ChannelRef, error: PlatformError) {
        self.with_channels(|chs| {
            if let Some(state) = chs.get_mut(channel) {
                state
                    .subscribers
                    .retain(|tx| tx.send(Err(error.clone())).is_ok());
            }
        });
    }

    fn plan_send(&self, channel: &ChannelRef, payload: &Payload) -> SendPlan {
        self.with_channels(|chs| {
            let Some(state) = chs.get_mut(channel) else {
                return SendPlan::Done(DeliveryResult::PermanentError(format!(
                    "chat not found: {channel}"
                )));
            };
            state.send_calls += 1;
            let result = match &state.behavior {
                DestinationBehavior::AlwaysOk => DeliveryResult::Success,
                DestinationBehavior::AlwaysTransient(e) => DeliveryResult::TransientError(e.clone()),
                DestinationBehavior::AlwaysPermanent(e) => DeliveryResult::PermanentError(e.clone()),
                DestinationBehavior::FailFirst { n, error } => {
                    if state.send_calls <= *n {
                        DeliveryResult::TransientError(error.clone())
                    } else {
                        DeliveryResult::Success
                    }
                }
                DestinationBehavior::RejectContaining { needle, error } => {
                    if payload.text.contains(needle.as_str()) {
                        DeliveryResult::PermanentError(error.clone())
                    } else {
                        DeliveryResult::Success
                    }
                }
                DestinationBehavior::Delay(d) => return SendPlan::DelayThenDeliver(*d),
                DestinationBehavior::DelayContaining { needle, delay } => {
                    if payload.text.contains(needle.as_str()) {
                        return SendPlan::DelayThenDeliver(*delay);
                    }
                    DeliveryResult::Success
                }
            };
            if result.is_success() {
                state.delivered.push(payload.clone());
            }
            SendPlan::Done(result)
        })
    }
}

#[async_trait]
impl MessagingPlatform for InMemoryPlatform {
    async fn resolve(&self, channel: &ChannelRef) -> Result<(), PlatformError> {
        self.with_channels(|chs| {
            if chs.contains_key(channel) {
                Ok(())
            } else {
                Err(PlatformError::UnknownChannel(channel.clone()))
            }
        })
    }

    async fn subscribe(
        &self,
        channel: &ChannelRef,
        since: DateTime<Utc>,
    ) -> Result<Subscription, PlatformError> {
        self.with_channels(|chs| {
            let state = chs
                .get_mut(channel)
                .ok_or_else(|| PlatformError::UnknownChannel(channel.clone()))?;
            let (tx, rx) = mpsc::unbounded_channel();
            for message in state.history.iter().filter(|m| m.source_timestamp >= since) {
                // rx is alive; cannot fail
                let _ = tx.send(Ok(message.clone()));
            }
            state.subscribers.push(tx);
            Ok(Subscription::new(rx))
        })
    }

    async fn send_message(&self, channel: &ChannelRef, payload: &Payload) -> DeliveryResult {
        match self.plan_send(channel, payload) {
            SendPlan::Done(result) => result,
            SendPlan::DelayThenDeliver(delay) => {
                tokio::time::sleep(delay).await;
                self.with_channels(|chs| {
                    if let Some(state) = chs.get_mut(channel) {
                        state.delivered.push(payload.clone());
                    }
                });
                DeliveryResult::Success
            }
        }
    }
}
