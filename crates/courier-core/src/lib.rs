//! # Courier Core
//!
//! Message model, trace-context codec and resilience pipeline shared by the
//! Courier consumer, producer and broker crates.

pub mod error;
pub mod models;
pub mod propagation;
pub mod retry;

pub use error::{Error, Result, RetryError, TraceContextError};
pub use models::{
    DLQ_SUFFIX, Message, MessageId, ProcessingOutcome, Properties, dead_letter_topic,
};
pub use propagation::{MessagePropagator, TRACE_ID_KEY, TRACE_STATE_KEY, TraceContext};
pub use retry::{Backoff, ResiliencePipeline, ResiliencePolicy};
