//! Client-side broker boundary.
//!
//! The broker owns transport, storage and delivery guarantees. Courier only
//! needs to pull one message at a time, acknowledge it, and publish.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{Message, MessageId, Properties};

use crate::error::Result;

/// A subscription handle delivering messages with manual acknowledgement.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Wait for the next message. Suspends without busy-polling while the
    /// subscription is empty or the prefetch window is full.
    async fn receive(&self) -> Result<Message>;

    /// Mark `message` as handled so the broker never redelivers it.
    async fn acknowledge(&self, message: &Message) -> Result<()>;

    /// Release the subscription. Unacknowledged messages become available to
    /// other consumers.
    async fn unsubscribe(&self) -> Result<()>;
}

/// Publishes raw payloads with a property bag.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, topic: &str, payload: Bytes, properties: Properties) -> Result<MessageId>;
}
