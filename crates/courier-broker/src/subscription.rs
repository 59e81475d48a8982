use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

const DEFAULT_PREFETCH: usize = 100;

/// Whether one or many consumers may read from a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// A single active consumer; others are rejected until it unsubscribes
    Exclusive,
    /// Messages are load-balanced across all active consumers
    #[default]
    Shared,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionMode::Exclusive => f.write_str("exclusive"),
            SubscriptionMode::Shared => f.write_str("shared"),
        }
    }
}

/// Where a newly created subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub topic: String,
    pub subscription: String,
    #[serde(default)]
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub initial_position: InitialPosition,
    /// Maximum number of delivered but unacknowledged messages per consumer
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

impl SubscriptionOptions {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            mode: SubscriptionMode::default(),
            initial_position: InitialPosition::default(),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    pub fn mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn initial_position(mut self, position: InitialPosition) -> Self {
        self.initial_position = position;
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(BrokerError::InvalidSubscription(
                "topic cannot be empty".to_string(),
            ));
        }
        if self.subscription.is_empty() {
            return Err(BrokerError::InvalidSubscription(
                "subscription name cannot be empty".to_string(),
            ));
        }
        if self.prefetch == 0 {
            return Err(BrokerError::InvalidSubscription(
                "prefetch must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_prefetch() -> usize {
    DEFAULT_PREFETCH
}
