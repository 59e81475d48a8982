//! Error types for Courier

use courier_broker::BrokerError;
use courier_core::RetryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Invalid consumer configuration: {0}")]
    InvalidConfig(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CourierError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<RetryError<BrokerError>> for CourierError {
    fn from(err: RetryError<BrokerError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Exhausted { last_error, .. } => Self::Broker(last_error),
        }
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
