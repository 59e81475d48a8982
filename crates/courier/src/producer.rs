//! Trace-aware publishing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_broker::{BrokerError, MessageSender};
use courier_core::propagation::{self, TRACE_ID_KEY, TRACE_STATE_KEY};
use courier_core::{
    Backoff, MessageId, Properties, ResiliencePipeline, ResiliencePolicy, TraceContext,
};
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attributes::{
    DEFAULT_MESSAGING_SYSTEM, MESSAGING_DESTINATION_NAME, MESSAGING_MESSAGE_ID,
    MESSAGING_OPERATION_TYPE, MESSAGING_SYSTEM,
};
use crate::error::Result;

const PUBLISH_PIPELINE: &str = "publish";

fn default_publish_policy() -> ResiliencePolicy {
    ResiliencePolicy::new(3, Duration::from_millis(200), Backoff::Exponential)
}

/// Publishes messages with the caller's trace context injected into their
/// properties.
///
/// Sends that fail with a transient broker error are retried under the
/// publish policy; the message properties are identical on every attempt.
#[derive(Clone)]
pub struct Producer {
    sender: Arc<dyn MessageSender>,
    tracer: Option<Arc<BoxedTracer>>,
    system: String,
    pipeline: ResiliencePipeline,
}

impl Producer {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            sender,
            tracer: None,
            system: DEFAULT_MESSAGING_SYSTEM.to_string(),
            pipeline: ResiliencePipeline::new(PUBLISH_PIPELINE, default_publish_policy()),
        }
    }

    /// Retry policy for broker sends.
    pub fn with_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.pipeline = ResiliencePipeline::new(PUBLISH_PIPELINE, policy);
        self
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        self.pipeline.policy()
    }

    /// Open a producer span around every publish.
    pub fn with_tracer<T>(mut self, tracer: T) -> Self
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        self.tracer = Some(Arc::new(BoxedTracer::new(Box::new(tracer))));
        self
    }

    pub fn with_messaging_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        trace: Option<&TraceContext>,
    ) -> Result<MessageId> {
        self.publish_with_properties(topic, payload, Properties::new(), trace)
            .await
    }

    /// Publish `body` as JSON.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        body: &T,
        trace: Option<&TraceContext>,
    ) -> Result<MessageId> {
        let payload = serde_json::to_vec(body)?;
        self.publish(topic, payload, trace).await
    }

    /// Publish with extra caller properties. When a trace context is present
    /// its keys replace any caller-supplied `trace-id`/`trace-state`.
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        properties: Properties,
        trace: Option<&TraceContext>,
    ) -> Result<MessageId> {
        let payload = payload.into();

        let Some(tracer) = &self.tracer else {
            return self.send(topic, payload, properties, trace).await;
        };

        let parent_cx = trace.map(TraceContext::to_context).unwrap_or_default();
        let span = tracer
            .span_builder(format!("{topic} publish"))
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new(MESSAGING_SYSTEM, self.system.clone()),
                KeyValue::new(MESSAGING_DESTINATION_NAME, topic.to_string()),
                KeyValue::new(MESSAGING_OPERATION_TYPE, "publish"),
            ])
            .start_with_context(tracer.as_ref(), &parent_cx);
        let cx = parent_cx.with_span(span);

        // A non-recording tracer yields an invalid span; keep the caller's
        // context in that case so the chain is not broken.
        let injected = match TraceContext::from_context(&cx) {
            Some(own) => Some(own.inherit_vendor_state(trace)),
            None => trace.cloned(),
        };
        let result = self
            .send(topic, payload, properties, injected.as_ref())
            .await;

        finish_span(&cx, &result);
        result
    }

    async fn send(
        &self,
        topic: &str,
        payload: Bytes,
        mut properties: Properties,
        trace: Option<&TraceContext>,
    ) -> Result<MessageId> {
        if let Some(trace) = trace {
            properties.remove(TRACE_ID_KEY);
            properties.remove(TRACE_STATE_KEY);
            propagation::inject(trace, &mut properties);
        }

        // Publishes are not tied to any shutdown; a started send runs to
        // completion or exhaustion.
        let never = CancellationToken::new();
        let id = self
            .pipeline
            .execute_if(
                |_| self.sender.send(topic, payload.clone(), properties.clone()),
                BrokerError::is_transient,
                &never,
            )
            .await?;
        debug!(topic, message_id = %id, traced = trace.is_some(), "Message published");
        Ok(id)
    }
}

fn finish_span(cx: &Context, result: &Result<MessageId>) {
    let span = cx.span();
    match result {
        Ok(id) => span.set_attribute(KeyValue::new(MESSAGING_MESSAGE_ID, id.to_string())),
        Err(e) => span.set_status(Status::error(e.to_string())),
    }
    span.end();
}
