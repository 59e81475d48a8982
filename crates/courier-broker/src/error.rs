use courier_core::MessageId;
use thiserror::Error;

use crate::subscription::SubscriptionMode;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable")]
    Disconnected,

    #[error("Subscription `{subscription}` on `{topic}` already has an exclusive consumer")]
    ConsumerBusy { topic: String, subscription: String },

    #[error("Subscription `{subscription}` already exists with mode {existing}")]
    ModeMismatch {
        subscription: String,
        existing: SubscriptionMode,
    },

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Message already acknowledged: {0}")]
    AlreadyAcknowledged(MessageId),

    #[error("Consumer closed")]
    Closed,

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Disconnected | BrokerError::Other(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
