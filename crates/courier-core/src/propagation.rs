//! Trace context propagation through message properties.
//!
//! A parent span is carried as two string properties:
//!
//! - `trace-id`: `{version}-{trace id}-{span id}-{flags}` in lowercase hex,
//!   the same single-line shape as a W3C `traceparent` header
//! - `trace-state`: opaque vendor state, omitted when empty
//!
//! The same pair works for HTTP headers and gRPC metadata: [`MessagePropagator`]
//! implements the OpenTelemetry `TextMapPropagator` trait over these keys so it
//! can be installed as the global propagator.

use opentelemetry::Context;
use opentelemetry::propagation::text_map_propagator::FieldIter;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use tracing::debug;

use crate::error::TraceContextError;
use crate::models::Properties;

pub const TRACE_ID_KEY: &str = "trace-id";
pub const TRACE_STATE_KEY: &str = "trace-state";

const VERSION: u8 = 0x00;
const INVALID_VERSION: u8 = 0xff;

/// Identity of a span that another unit of work should be parented to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
    vendor_state: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            sampled,
            vendor_state: None,
        }
    }

    /// Attach vendor state. Empty strings are treated as absent.
    pub fn with_vendor_state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        self.vendor_state = (!state.is_empty()).then_some(state);
        self
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn vendor_state(&self) -> Option<&str> {
        self.vendor_state.as_deref()
    }

    /// Take `upstream`'s vendor state when this context has none.
    ///
    /// Vendor state that OpenTelemetry cannot parse does not survive a trip
    /// through a span; this restores the raw string on the way out.
    pub fn inherit_vendor_state(mut self, upstream: Option<&TraceContext>) -> Self {
        if self.vendor_state.is_none() {
            self.vendor_state = upstream.and_then(|u| u.vendor_state.clone());
        }
        self
    }

    /// Capture the identity of a live span. Returns `None` for invalid
    /// (e.g. no-op tracer) span contexts.
    pub fn from_span_context(span_context: &SpanContext) -> Option<Self> {
        if !span_context.is_valid() {
            return None;
        }

        Some(
            Self::new(
                span_context.trace_id(),
                span_context.span_id(),
                span_context.is_sampled(),
            )
            .with_vendor_state(span_context.trace_state().header()),
        )
    }

    /// Capture the active span of an OpenTelemetry context.
    pub fn from_context(cx: &Context) -> Option<Self> {
        Self::from_span_context(cx.span().span_context())
    }

    /// Remote span context suitable for parenting a new span.
    pub fn to_span_context(&self) -> SpanContext {
        let flags = if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        let state = match self.vendor_state.as_deref().map(str::parse::<TraceState>) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                debug!(error = %e, "Vendor trace state is not valid tracestate, not attached to span");
                TraceState::default()
            }
            None => TraceState::default(),
        };

        SpanContext::new(self.trace_id, self.span_id, flags, true, state)
    }

    /// A fresh OpenTelemetry context whose parent is this trace context.
    pub fn to_context(&self) -> Context {
        Context::new().with_remote_span_context(self.to_span_context())
    }

    /// The `trace-id` property value.
    pub fn header_value(&self) -> String {
        let flags = if self.sampled { 0x01 } else { 0x00 };
        format!(
            "{:02x}-{}-{}-{:02x}",
            VERSION, self.trace_id, self.span_id, flags
        )
    }
}

/// Write `cx` into any text-map carrier.
pub fn inject(cx: &TraceContext, carrier: &mut dyn Injector) {
    carrier.set(TRACE_ID_KEY, cx.header_value());
    if let Some(state) = cx.vendor_state() {
        carrier.set(TRACE_STATE_KEY, state.to_string());
    }
}

/// Encode `cx` as a standalone property bag.
pub fn encode(cx: &TraceContext) -> Properties {
    let mut properties = Properties::with_capacity(2);
    inject(cx, &mut properties);
    properties
}

/// Decode a parent trace context from a carrier.
///
/// Never panics. Any error means "no parent" to the caller.
pub fn decode(carrier: &dyn Extractor) -> Result<TraceContext, TraceContextError> {
    let header = carrier
        .get(TRACE_ID_KEY)
        .ok_or(TraceContextError::Missing(TRACE_ID_KEY))?;

    let (trace_id, span_id, flags) = parse_header(header)?;

    let cx = TraceContext::new(trace_id, span_id, flags & 0x01 == 0x01);
    Ok(match carrier.get(TRACE_STATE_KEY) {
        Some(state) => cx.with_vendor_state(state.trim()),
        None => cx,
    })
}

fn parse_header(header: &str) -> Result<(TraceId, SpanId, u8), TraceContextError> {
    let parts: Vec<&str> = header.trim().split('-').collect();
    if parts.len() < 4 {
        return Err(TraceContextError::Malformed(format!(
            "expected 4 fields, found {}",
            parts.len()
        )));
    }

    let version = parse_hex_byte(parts[0], "version")?;
    if version == INVALID_VERSION {
        return Err(TraceContextError::UnsupportedVersion(version));
    }
    // Later versions may append fields; version 00 may not.
    if version == VERSION && parts.len() != 4 {
        return Err(TraceContextError::Malformed(format!(
            "version 00 requires 4 fields, found {}",
            parts.len()
        )));
    }

    if !is_hex(parts[1], 32) {
        return Err(TraceContextError::InvalidField {
            field: "trace id",
            expected: 32,
        });
    }
    let trace_id = TraceId::from_hex(parts[1]).map_err(|_| TraceContextError::InvalidField {
        field: "trace id",
        expected: 32,
    })?;
    if trace_id == TraceId::INVALID {
        return Err(TraceContextError::ZeroId("trace id"));
    }

    if !is_hex(parts[2], 16) {
        return Err(TraceContextError::InvalidField {
            field: "span id",
            expected: 16,
        });
    }
    let span_id = SpanId::from_hex(parts[2]).map_err(|_| TraceContextError::InvalidField {
        field: "span id",
        expected: 16,
    })?;
    if span_id == SpanId::INVALID {
        return Err(TraceContextError::ZeroId("span id"));
    }

    let flags = parse_hex_byte(parts[3], "flags")?;

    Ok((trace_id, span_id, flags))
}

fn parse_hex_byte(field: &str, name: &'static str) -> Result<u8, TraceContextError> {
    if !is_hex(field, 2) {
        return Err(TraceContextError::InvalidField {
            field: name,
            expected: 2,
        });
    }
    u8::from_str_radix(field, 16).map_err(|_| TraceContextError::InvalidField {
        field: name,
        expected: 2,
    })
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `TextMapPropagator` speaking the `trace-id` / `trace-state` format.
#[derive(Debug)]
pub struct MessagePropagator {
    fields: [String; 2],
}

impl MessagePropagator {
    pub fn new() -> Self {
        Self {
            fields: [TRACE_ID_KEY.to_string(), TRACE_STATE_KEY.to_string()],
        }
    }
}

impl Default for MessagePropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl TextMapPropagator for MessagePropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        if let Some(trace) = TraceContext::from_context(cx) {
            inject(&trace, injector);
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match decode(extractor) {
            Ok(trace) => cx.with_remote_span_context(trace.to_span_context()),
            Err(_) => cx.clone(),
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}
