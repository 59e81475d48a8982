//! Resilient, traced consumer loop.
//!
//! # Lifecycle of one message
//!
//! ```text
//! Idle -> Receiving -> ContextLinked -> Processing -> Acknowledging -> Idle
//!                                          |              ^
//!                                          +-> DeadLettering
//! ```
//!
//! - **Receiving** runs `receive()` under the receive pipeline. Only transient
//!   broker errors are retried. Exhaustion is logged and the loop keeps going;
//!   a closed subscription stops the loop.
//! - **ContextLinked** decodes the upstream trace context from the message
//!   properties and opens a consumer span under it. A missing or malformed
//!   context yields a root span instead.
//! - **Processing** runs the handler under the process pipeline.
//! - **DeadLettering** republishes the untouched payload to `<topic>-DLQ`
//!   once the process pipeline is exhausted.
//! - **Acknowledging** always acknowledges the original message, whatever the
//!   outcome, so a poison message is never redelivered.
//!
//! Cancellation is observed between messages, while waiting for the next one
//! and during retry backoff. It never interrupts a running handler.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{BrokerError, MessageConsumer};
use courier_core::propagation;
use courier_core::{
    Backoff, Message, MessageId, ProcessingOutcome, Properties, ResiliencePipeline,
    ResiliencePolicy, RetryError, TraceContext,
};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attributes::{
    COURIER_OUTCOME, DEFAULT_MESSAGING_SYSTEM, MESSAGING_CONSUMER_GROUP_NAME,
    MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID, MESSAGING_OPERATION_TYPE,
    MESSAGING_REDELIVERY_COUNT, MESSAGING_SYSTEM,
};
use crate::context::HandlerContext;
use crate::error::{CourierError, Result};
use crate::handler::MessageHandler;
use crate::metrics::MetricsRecorder;
use crate::producer::Producer;

pub const DLQ_ORIGINAL_TOPIC_KEY: &str = "dlq-original-topic";
pub const DLQ_ORIGINAL_ID_KEY: &str = "dlq-original-id";
pub const DLQ_ERROR_KEY: &str = "dlq-error";
pub const DLQ_ATTEMPTS_KEY: &str = "dlq-attempts";

const RECEIVE_PIPELINE: &str = "receive";
const PROCESS_PIPELINE: &str = "process";
const ACKNOWLEDGE_PIPELINE: &str = "acknowledge";

/// Typed consumer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub topic: String,
    pub subscription: String,
    /// Applied to `receive()`, `acknowledge()` and dead-letter publishes.
    #[serde(default = "default_receive_policy")]
    pub receive_policy: ResiliencePolicy,
    /// Applied to the handler.
    #[serde(default = "default_process_policy")]
    pub process_policy: ResiliencePolicy,
}

fn default_receive_policy() -> ResiliencePolicy {
    ResiliencePolicy::new(5, Duration::from_millis(500), Backoff::Exponential)
        .with_max_delay(Duration::from_secs(10))
}

fn default_process_policy() -> ResiliencePolicy {
    ResiliencePolicy::default()
}

impl ConsumerSettings {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            receive_policy: default_receive_policy(),
            process_policy: default_process_policy(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(CourierError::invalid_config("topic cannot be empty"));
        }
        if self.subscription.is_empty() {
            return Err(CourierError::invalid_config("subscription cannot be empty"));
        }
        self.receive_policy
            .validate()
            .map_err(|e| CourierError::invalid_config(format!("receive policy: {e}")))?;
        self.process_policy
            .validate()
            .map_err(|e| CourierError::invalid_config(format!("process policy: {e}")))?;
        Ok(())
    }
}

/// Builder for configuring and constructing a [`Consumer`].
pub struct ConsumerBuilder {
    settings: ConsumerSettings,
    consumer: Option<Arc<dyn MessageConsumer>>,
    handler: Option<Arc<dyn MessageHandler>>,
    producer: Option<Producer>,
    metrics: Option<MetricsRecorder>,
    tracer: Option<BoxedTracer>,
    messaging_system: String,
    shutdown: Option<CancellationToken>,
}

impl ConsumerBuilder {
    pub fn new(settings: ConsumerSettings) -> Self {
        Self {
            settings,
            consumer: None,
            handler: None,
            producer: None,
            metrics: None,
            tracer: None,
            messaging_system: DEFAULT_MESSAGING_SYSTEM.to_string(),
            shutdown: None,
        }
    }

    /// The broker-side subscription to read from.
    pub fn consumer(mut self, consumer: impl MessageConsumer + 'static) -> Self {
        self.consumer = Some(Arc::new(consumer));
        self
    }

    pub fn handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Producer used for dead-letter publishes.
    pub fn producer(mut self, producer: Producer) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tracer for consumer spans. Defaults to the global tracer provider.
    pub fn tracer<T>(mut self, tracer: T) -> Self
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        self.tracer = Some(BoxedTracer::new(Box::new(tracer)));
        self
    }

    pub fn messaging_system(mut self, system: impl Into<String>) -> Self {
        self.messaging_system = system.into();
        self
    }

    pub fn receive_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.settings.receive_policy = policy;
        self
    }

    pub fn process_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.settings.process_policy = policy;
        self
    }

    /// Share a cancellation token, e.g. one per process.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        if self.consumer.is_none() {
            return Err(CourierError::invalid_config("a message consumer is required"));
        }
        if self.handler.is_none() {
            return Err(CourierError::invalid_config("a message handler is required"));
        }
        if self.producer.is_none() {
            return Err(CourierError::invalid_config(
                "a producer is required for dead-letter publishes",
            ));
        }
        if let Some(handler) = &self.handler
            && handler.event_type().is_empty()
        {
            return Err(CourierError::invalid_config("handler event type cannot be empty"));
        }
        Ok(())
    }

    pub fn build(self) -> Result<Consumer> {
        self.validate()?;

        let (Some(consumer), Some(handler), Some(producer)) =
            (self.consumer, self.handler, self.producer)
        else {
            return Err(CourierError::invalid_config("incomplete consumer configuration"));
        };

        Ok(Consumer {
            receive: ResiliencePipeline::new(
                RECEIVE_PIPELINE,
                self.settings.receive_policy.clone(),
            ),
            acknowledge: ResiliencePipeline::new(
                ACKNOWLEDGE_PIPELINE,
                self.settings.receive_policy.clone(),
            ),
            process: ResiliencePipeline::new(
                PROCESS_PIPELINE,
                self.settings.process_policy.clone(),
            ),
            // Dead-letter sends share the broker retry budget.
            producer: producer.with_policy(self.settings.receive_policy.clone()),
            settings: self.settings,
            consumer,
            handler,
            metrics: self.metrics,
            tracer: self.tracer.unwrap_or_else(|| global::tracer("courier")),
            messaging_system: self.messaging_system,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

pub struct Consumer {
    settings: ConsumerSettings,
    consumer: Arc<dyn MessageConsumer>,
    handler: Arc<dyn MessageHandler>,
    producer: Producer,
    metrics: Option<MetricsRecorder>,
    tracer: BoxedTracer,
    messaging_system: String,
    receive: ResiliencePipeline,
    process: ResiliencePipeline,
    acknowledge: ResiliencePipeline,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn builder(topic: impl Into<String>, subscription: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder::new(ConsumerSettings::new(topic, subscription))
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> ConsumerHandle {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(self.run());
        ConsumerHandle { shutdown, handle }
    }

    /// Run the consumer loop until the shutdown token is cancelled, then
    /// unsubscribe.
    #[tracing::instrument(
        name = "consumer",
        skip(self),
        fields(topic = %self.settings.topic, subscription = %self.settings.subscription)
    )]
    pub async fn run(self) -> Result<()> {
        info!(
            event_type = self.handler.event_type(),
            receive_attempts = self.settings.receive_policy.max_attempts,
            process_attempts = self.settings.process_policy.max_attempts,
            "Consumer started"
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.receive.execute_if(
                    |_| self.consumer.receive(),
                    BrokerError::is_transient,
                    &self.shutdown,
                ) => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(RetryError::Cancelled) => break,
                Err(RetryError::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    if matches!(last_error, BrokerError::Closed) {
                        warn!("Subscription closed, stopping consumer");
                        break;
                    }
                    error!(attempts, error = %last_error, "Receive exhausted, continuing");
                    self.idle().await;
                    continue;
                }
            };

            self.process_message(message).await;
        }

        info!("Consumer shutting down");
        self.consumer.unsubscribe().await?;
        Ok(())
    }

    /// Pause before the next receive round so a broker that stays down is not
    /// hammered.
    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.settings.receive_policy.delay()) => {}
        }
    }

    async fn process_message(&self, message: Message) -> ProcessingOutcome {
        let started = Instant::now();
        let event_type = self.handler.event_type();

        let parent = match propagation::decode(&message.properties) {
            Ok(parent) => Some(parent),
            Err(e) => {
                debug!(message_id = %message.id, error = %e, "No usable trace context, starting root span");
                None
            }
        };

        let cx = self.start_span(&message, parent.as_ref());

        let max_attempts = self.process.policy().max_attempts;
        let handler = &self.handler;
        let message_ref = &message;
        let cx_ref = &cx;
        let parent_ref = &parent;
        let result = self
            .process
            .execute(
                |attempt| {
                    let handler_cx = HandlerContext::new(cx_ref.clone(), attempt, max_attempts)
                        .with_parent(parent_ref.clone());
                    async move { handler.handle(message_ref, &handler_cx).await }
                },
                &self.shutdown,
            )
            .await;

        let outcome = match result {
            Ok(()) => ProcessingOutcome::Success {
                elapsed: started.elapsed(),
            },
            Err(RetryError::Cancelled) => ProcessingOutcome::Released {
                elapsed: started.elapsed(),
            },
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                let last_error = format!("{last_error:#}");
                cx.span().set_status(Status::error(last_error.clone()));
                let dead_lettered = self
                    .dead_letter(&message, &last_error, attempts, &cx, parent.as_ref())
                    .await;
                ProcessingOutcome::Exhausted {
                    attempts,
                    last_error,
                    dead_lettered,
                    elapsed: started.elapsed(),
                }
            }
        };

        if outcome.requires_ack() {
            self.ack(&message).await;
            if let Some(metrics) = &self.metrics {
                metrics.record(event_type, outcome.elapsed());
                if !outcome.is_success() {
                    metrics.record_failure(event_type);
                }
            }
        } else {
            info!(message_id = %message.id, "Shutdown during retry, message released for redelivery");
        }

        let span = cx.span();
        span.set_attribute(KeyValue::new(COURIER_OUTCOME, outcome.as_str()));
        span.end();

        info!(
            message_id = %message.id,
            topic = %message.topic,
            outcome = %outcome,
            elapsed_ms = outcome.elapsed().as_millis() as u64,
            "Message processed"
        );
        outcome
    }

    fn start_span(&self, message: &Message, parent: Option<&TraceContext>) -> Context {
        let parent_cx = parent.map(TraceContext::to_context).unwrap_or_default();

        let span = self
            .tracer
            .span_builder(format!("{} process", message.topic))
            .with_kind(SpanKind::Consumer)
            .with_attributes([
                KeyValue::new(MESSAGING_SYSTEM, self.messaging_system.clone()),
                KeyValue::new(MESSAGING_DESTINATION_NAME, message.topic.clone()),
                KeyValue::new(MESSAGING_MESSAGE_ID, message.id.to_string()),
                KeyValue::new(
                    MESSAGING_CONSUMER_GROUP_NAME,
                    self.settings.subscription.clone(),
                ),
                KeyValue::new(MESSAGING_OPERATION_TYPE, "process"),
                KeyValue::new(MESSAGING_REDELIVERY_COUNT, i64::from(message.redelivery_count)),
            ])
            .start_with_context(&self.tracer, &parent_cx);

        parent_cx.with_span(span)
    }

    /// Publish the original payload to the dead-letter topic. Failures are
    /// logged and reported as `false`; they never block the acknowledgement.
    async fn dead_letter(
        &self,
        message: &Message,
        last_error: &str,
        attempts: u32,
        cx: &Context,
        parent: Option<&TraceContext>,
    ) -> bool {
        let dlq_topic = message.dead_letter_topic();
        let properties = dead_letter_properties(message, last_error, attempts);
        let trace = TraceContext::from_context(cx)
            .map(|own| own.inherit_vendor_state(parent));

        match self
            .producer
            .publish_with_properties(&dlq_topic, message.payload.clone(), properties, trace.as_ref())
            .await
        {
            Ok(dlq_id) => {
                warn!(
                    message_id = %message.id,
                    dlq_topic = %dlq_topic,
                    dlq_message_id = %dlq_id,
                    attempts,
                    error = last_error,
                    "Processing exhausted, message dead-lettered"
                );
                true
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    dlq_topic = %dlq_topic,
                    attempts,
                    error = last_error,
                    dlq_error = %e,
                    "Processing exhausted and dead-letter publish failed"
                );
                false
            }
        }
    }

    async fn ack(&self, message: &Message) {
        // Acknowledgement must complete even during shutdown.
        let never = CancellationToken::new();
        let result = self
            .acknowledge
            .execute_if(
                |_| self.consumer.acknowledge(message),
                BrokerError::is_transient,
                &never,
            )
            .await;

        if let Err(e) = result {
            error!(message_id = %message.id, error = %e, "Failed to acknowledge message");
        }
    }
}

fn dead_letter_properties(message: &Message, last_error: &str, attempts: u32) -> Properties {
    let mut properties = message.properties.clone();
    properties.insert(DLQ_ORIGINAL_TOPIC_KEY.to_string(), message.topic.clone());
    properties.insert(DLQ_ORIGINAL_ID_KEY.to_string(), message.id.to_string());
    properties.insert(DLQ_ERROR_KEY.to_string(), last_error.to_string());
    properties.insert(DLQ_ATTEMPTS_KEY.to_string(), attempts.to_string());
    properties
}

/// Handle to a spawned [`Consumer`].
pub struct ConsumerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request shutdown and wait for the loop to unsubscribe.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}

/// Identity of a message as seen by the dead-letter topic.
pub fn original_message_id(dead_lettered: &Message) -> Option<MessageId> {
    dead_lettered
        .property(DLQ_ORIGINAL_ID_KEY)
        .map(MessageId::from)
}
