use courier_core::TraceContext;
use opentelemetry::Context;
use opentelemetry::trace::TraceContextExt;

/// Per-attempt context handed to a [`MessageHandler`](crate::MessageHandler).
///
/// Trace context is passed explicitly rather than read from ambient
/// current-span state: the OpenTelemetry [`Context`] carries the consumer
/// span, and [`trace_context`](Self::trace_context) is what downstream
/// publishes should inject.
#[derive(Clone)]
pub struct HandlerContext {
    otel: Context,
    attempt: u32,
    max_attempts: u32,
    trace: Option<TraceContext>,
    parent: Option<TraceContext>,
}

impl HandlerContext {
    pub fn new(otel: Context, attempt: u32, max_attempts: u32) -> Self {
        let trace = TraceContext::from_context(&otel);
        Self {
            otel,
            attempt,
            max_attempts,
            trace,
            parent: None,
        }
    }

    pub(crate) fn with_parent(mut self, parent: Option<TraceContext>) -> Self {
        self.trace = self
            .trace
            .map(|trace| trace.inherit_vendor_state(parent.as_ref()));
        self.parent = parent;
        self
    }

    /// Context whose active span is the consumer span.
    pub fn otel_context(&self) -> &Context {
        &self.otel
    }

    /// 1-based attempt number within the process pipeline.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// The consumer span's identity, `None` when tracing is disabled.
    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    /// The upstream context decoded from the message, if any.
    pub fn parent(&self) -> Option<&TraceContext> {
        self.parent.as_ref()
    }

    /// Record a named event on the consumer span.
    pub fn add_event(&self, name: impl Into<std::borrow::Cow<'static, str>>) {
        self.otel.span().add_event(name, Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{SpanId, TraceId};

    use super::*;

    #[test]
    fn test_context_without_span() {
        let cx = HandlerContext::new(Context::new(), 1, 3);
        assert!(cx.trace_context().is_none());
        assert!(cx.parent().is_none());
        assert!(!cx.is_final_attempt());
    }

    #[test]
    fn test_context_from_remote_parent() {
        let parent = TraceContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            true,
        );
        let cx = HandlerContext::new(parent.to_context(), 3, 3).with_parent(Some(parent.clone()));

        assert_eq!(cx.trace_context(), Some(&parent));
        assert_eq!(cx.parent(), Some(&parent));
        assert!(cx.is_final_attempt());
    }

    #[test]
    fn test_unparseable_vendor_state_reaches_handler() {
        let parent = TraceContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            true,
        )
        .with_vendor_state("Vendor=Opaque");
        let cx = HandlerContext::new(parent.to_context(), 1, 3).with_parent(Some(parent.clone()));

        let trace = cx.trace_context().unwrap();
        assert_eq!(trace.span_id(), parent.span_id());
        assert_eq!(trace.vendor_state(), Some("Vendor=Opaque"));
    }
}
