//! # Courier
//!
//! Client-side harness around an at-least-once pub/sub broker:
//!
//! - [`Consumer`] pulls messages, links each one to its upstream trace,
//!   runs a [`MessageHandler`] under a bounded retry policy, dead-letters
//!   poison messages and always acknowledges.
//! - [`Producer`] injects the caller's trace context into outgoing messages.
//! - [`MetricsRecorder`] keeps windowed per-event rates and latencies.

pub mod attributes;
pub mod consumer;
pub mod context;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod producer;

pub use consumer::{
    Consumer, ConsumerBuilder, ConsumerHandle, ConsumerSettings, DLQ_ATTEMPTS_KEY, DLQ_ERROR_KEY,
    DLQ_ORIGINAL_ID_KEY, DLQ_ORIGINAL_TOPIC_KEY,
};
pub use context::HandlerContext;
pub use error::{CourierError, Result};
pub use handler::{HandlerFn, MessageHandler, handler_fn};
pub use metrics::{MetricEvent, MetricsRecorder};
pub use producer::Producer;

pub use courier_broker as broker;
pub use courier_core as core;

/// A prelude module for convenient imports
pub mod prelude {
    pub use courier_core::{Message, ProcessingOutcome, ResiliencePolicy, TraceContext};

    pub use crate::{
        Consumer, HandlerContext, MessageHandler, MetricsRecorder, Producer, handler_fn,
    };
}
