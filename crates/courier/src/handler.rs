use std::future::Future;

use async_trait::async_trait;
use courier_core::Message;

use crate::context::HandlerContext;

/// Business logic invoked for every received message.
///
/// Errors are retried by the consumer's process pipeline; once it is
/// exhausted the message goes to the dead-letter topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name under which processing metrics are recorded, e.g. `weather_created`.
    fn event_type(&self) -> &str;

    async fn handle(&self, message: &Message, cx: &HandlerContext) -> anyhow::Result<()>;
}

/// A [`MessageHandler`] backed by an async closure.
pub struct HandlerFn<F> {
    event_type: String,
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```ignore
/// let handler = handler_fn("order_placed", |message, cx| async move {
///     tracing::info!(attempt = cx.attempt(), id = %message.id, "Placing order");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(event_type: impl Into<String>, f: F) -> HandlerFn<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn {
        event_type: event_type.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, message: &Message, cx: &HandlerContext) -> anyhow::Result<()> {
        (self.f)(message.clone(), cx.clone()).await
    }
}
