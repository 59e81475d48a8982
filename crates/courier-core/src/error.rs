//! Error types for Courier Core

use std::fmt::{Debug, Display};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid resilience policy: {0}")]
    InvalidPolicy(String),

    #[error("Trace context error: {0}")]
    TraceContext(#[from] TraceContextError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a property bag could not be turned into a parent trace context.
///
/// Decoding failures are never fatal: callers fall back to an unparented span.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceContextError {
    #[error("Trace context property `{0}` is missing")]
    Missing(&'static str),

    #[error("Malformed trace context: {0}")]
    Malformed(String),

    #[error("Trace context field `{field}` must be {expected} hex characters")]
    InvalidField { field: &'static str, expected: usize },

    #[error("Unsupported trace context version {0:02x}")]
    UnsupportedVersion(u8),

    #[error("Trace context field `{0}` must not be all zeros")]
    ZeroId(&'static str),
}

/// Terminal failure of a [`ResiliencePipeline`](crate::ResiliencePipeline) run.
#[derive(Error, Debug)]
pub enum RetryError<E: Debug + Display> {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E: Debug + Display> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// The error returned by the final attempt, if the pipeline ran to exhaustion.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last_error, .. } => Some(last_error),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Exhausted { last_error, .. } => Some(last_error),
        }
    }
}
