#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier::broker::{
    BrokerError, MemoryBroker, MemoryConsumer, MessageConsumer, MessageSender,
    SubscriptionOptions,
};
use courier::core::{Backoff, DLQ_SUFFIX, Message, MessageId, Properties, ResiliencePolicy};
use courier::{
    Consumer, ConsumerBuilder, ConsumerHandle, MessageHandler, MetricsRecorder, Producer,
    handler_fn,
};
use opentelemetry::global;
use opentelemetry::trace::{SpanKind, TracerProvider as _};
use opentelemetry_sdk::trace::{
    InMemorySpanExporter, InMemorySpanExporterBuilder, SdkTracerProvider, SpanData,
};

pub const TOPIC: &str = "weather-create";
pub const SUBSCRIPTION: &str = "courier-test";
pub const EVENT_TYPE: &str = "test_event";

pub struct TestHarness {
    pub broker: MemoryBroker,
    pub exporter: InMemorySpanExporter,
    pub provider: SdkTracerProvider,
    pub metrics: MetricsRecorder,
}

impl TestHarness {
    pub fn new() -> Self {
        let exporter = InMemorySpanExporterBuilder::new().build();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();

        Self {
            broker: MemoryBroker::new(),
            exporter,
            provider,
            metrics: MetricsRecorder::new(
                global::meter("courier-test"),
                "courier",
                Duration::from_secs(60),
            ),
        }
    }

    /// Producer with its own span, as an upstream service would use.
    pub fn producer(&self) -> Producer {
        Producer::new(Arc::new(self.broker.clone())).with_tracer(self.provider.tracer("upstream"))
    }

    pub fn subscribe(&self) -> MemoryConsumer {
        self.broker
            .subscribe(SubscriptionOptions::new(TOPIC, SUBSCRIPTION))
            .expect("subscribe")
    }

    /// Consumer wired to the harness broker with short, deterministic
    /// policies: process 3 attempts at 100ms linear, receive 3 attempts at
    /// 100ms constant.
    pub fn builder(&self, handler: impl MessageHandler + 'static) -> ConsumerBuilder {
        Consumer::builder(TOPIC, SUBSCRIPTION)
            .consumer(self.subscribe())
            .handler(handler)
            .producer(
                Producer::new(Arc::new(self.broker.clone()))
                    .with_tracer(self.provider.tracer("dead-letter")),
            )
            .metrics(self.metrics.clone())
            .tracer(self.provider.tracer("consumer"))
            .process_policy(ResiliencePolicy::new(
                3,
                Duration::from_millis(100),
                Backoff::Linear,
            ))
            .receive_policy(ResiliencePolicy::new(
                3,
                Duration::from_millis(100),
                Backoff::None,
            ))
    }

    pub fn spawn(&self, handler: impl MessageHandler + 'static) -> ConsumerHandle {
        self.builder(handler).build().expect("build consumer").spawn()
    }

    pub async fn publish_raw(&self, payload: &'static [u8], properties: Properties) -> MessageId {
        self.broker
            .send(TOPIC, Bytes::from_static(payload), properties)
            .await
            .expect("publish")
    }

    pub fn acknowledged(&self) -> usize {
        self.broker.acknowledged_count(TOPIC, SUBSCRIPTION)
    }

    pub fn unacknowledged(&self) -> usize {
        self.broker.unacknowledged_count(TOPIC, SUBSCRIPTION)
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.broker.messages(&format!("{TOPIC}{DLQ_SUFFIX}"))
    }

    pub fn spans(&self, kind: SpanKind) -> Vec<SpanData> {
        self.exporter
            .get_finished_spans()
            .expect("finished spans")
            .into_iter()
            .filter(|span| span.span_kind == kind)
            .collect()
    }
}

/// Handler failing its first `failures` calls. `calls` counts every call.
pub fn flaky_handler(calls: Arc<AtomicU32>, failures: u32) -> impl MessageHandler {
    handler_fn(EVENT_TYPE, move |_message, _cx| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call <= failures {
                anyhow::bail!("handler failure #{call}");
            }
            Ok(())
        }
    })
}

/// Poll `condition` until it holds, advancing the (paused) clock.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(300), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Fails the first `failures` receives with `Disconnected`.
pub struct FlakyConsumer {
    inner: MemoryConsumer,
    failures: AtomicU32,
    pub receive_calls: Arc<AtomicU32>,
}

impl FlakyConsumer {
    pub fn new(inner: MemoryConsumer, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
            receive_calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl MessageConsumer for FlakyConsumer {
    async fn receive(&self) -> courier::broker::Result<Message> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Disconnected);
        }
        self.inner.receive().await
    }

    async fn acknowledge(&self, message: &Message) -> courier::broker::Result<()> {
        self.inner.acknowledge(message).await
    }

    async fn unsubscribe(&self) -> courier::broker::Result<()> {
        self.inner.unsubscribe().await
    }
}

/// Delegates to the broker but rejects the first `failures` dead-letter
/// publishes with a transient error.
pub struct DeadLetterRejectingSender {
    pub broker: MemoryBroker,
    pub failures: u32,
    pub rejected: Arc<AtomicU32>,
}

impl DeadLetterRejectingSender {
    pub fn always(broker: &MemoryBroker) -> Self {
        Self::times(broker, u32::MAX)
    }

    pub fn times(broker: &MemoryBroker, failures: u32) -> Self {
        Self {
            broker: broker.clone(),
            failures,
            rejected: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl MessageSender for DeadLetterRejectingSender {
    async fn send(
        &self,
        topic: &str,
        payload: Bytes,
        properties: Properties,
    ) -> courier::broker::Result<MessageId> {
        if topic.ends_with(DLQ_SUFFIX) && self.rejected.load(Ordering::SeqCst) < self.failures {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(BrokerError::Other("dead-letter topic unavailable".to_string()));
        }
        self.broker.send(topic, payload, properties).await
    }
}

/// A subscription that has been closed from the broker side.
#[derive(Default)]
pub struct ClosedConsumer {
    pub receive_calls: Arc<AtomicU32>,
}

#[async_trait]
impl MessageConsumer for ClosedConsumer {
    async fn receive(&self) -> courier::broker::Result<Message> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::Closed)
    }

    async fn acknowledge(&self, _message: &Message) -> courier::broker::Result<()> {
        Err(BrokerError::Closed)
    }

    async fn unsubscribe(&self) -> courier::broker::Result<()> {
        Ok(())
    }
}

/// Receives normally but reports every acknowledgement as a duplicate.
pub struct DuplicateAckConsumer {
    inner: MemoryConsumer,
    pub ack_calls: Arc<AtomicU32>,
}

impl DuplicateAckConsumer {
    pub fn new(inner: MemoryConsumer) -> Self {
        Self {
            inner,
            ack_calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl MessageConsumer for DuplicateAckConsumer {
    async fn receive(&self) -> courier::broker::Result<Message> {
        self.inner.receive().await
    }

    async fn acknowledge(&self, message: &Message) -> courier::broker::Result<()> {
        self.ack_calls.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::AlreadyAcknowledged(message.id.clone()))
    }

    async fn unsubscribe(&self) -> courier::broker::Result<()> {
        self.inner.unsubscribe().await
    }
}
