//! MessagingPlatform port - 外部のメッセージングプラットフォーム
//!
//! チャネルの発見・認証・メディア保存はこの外側の責務です。
//! エンジンが必要とするのは resolve / subscribe / send の 3 つだけ。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::{ChannelRef, DeliveryResult, Message, Payload, PlatformError};

/// Live message stream for one channel.
///
/// `recv()` returns `None` when the stream terminated (channel gone, connection
/// closed) and `Some(Err(..))` when the platform reports a stream error.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Result<Message, PlatformError>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<Message, PlatformError>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Result<Message, PlatformError>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    /// Check that a channel reference exists and is reachable.
    async fn resolve(&self, channel: &ChannelRef) -> Result<(), PlatformError>;

    /// Subscribe to a channel. Retained messages with a source timestamp at
    /// or after `since` are replayed first, then live ones follow.
    async fn subscribe(
        &self,
        channel: &ChannelRef,
        since: DateTime<Utc>,
    ) -> Result<Subscription, PlatformError>;

    async fn send_message(&self, channel: &ChannelRef, payload: &Payload) -> DeliveryResult;
}
