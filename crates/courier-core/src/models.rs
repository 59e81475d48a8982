use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// String key/value bag carried alongside a message payload.
///
/// `HashMap<String, String>` already implements the OpenTelemetry
/// `Injector`/`Extractor` carrier traits, so properties can be handed to any
/// text-map propagator directly.
pub type Properties = HashMap<String, String>;

/// Suffix appended to a source topic to form its dead-letter topic.
pub const DLQ_SUFFIX: &str = "-DLQ";

/// Dead-letter topic for `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}{DLQ_SUFFIX}")
}

/// Broker-assigned message identifier. Opaque to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: Bytes,
    #[serde(default)]
    pub properties: Properties,
    /// How many times the broker has handed this message out before.
    #[serde(default)]
    pub redelivery_count: u32,
    pub publish_time: DateTime<Utc>,
}

impl Message {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn dead_letter_topic(&self) -> String {
        dead_letter_topic(&self.topic)
    }
}

/// Terminal result of handling one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success {
        elapsed: Duration,
    },
    /// The process pipeline ran out of attempts. `dead_lettered` is false when
    /// the dead-letter publish itself failed.
    Exhausted {
        attempts: u32,
        last_error: String,
        dead_lettered: bool,
        elapsed: Duration,
    },
    /// Shutdown interrupted the retry backoff. The message was left
    /// unacknowledged so the broker can hand it to another consumer.
    Released {
        elapsed: Duration,
    },
}

impl ProcessingOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            ProcessingOutcome::Success { elapsed }
            | ProcessingOutcome::Exhausted { elapsed, .. }
            | ProcessingOutcome::Released { elapsed } => *elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success { .. })
    }

    /// Whether the original message must be acknowledged.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, ProcessingOutcome::Released { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success { .. } => "success",
            ProcessingOutcome::Exhausted {
                dead_lettered: true,
                ..
            } => "dead_lettered",
            ProcessingOutcome::Exhausted { .. } => "dead_letter_failed",
            ProcessingOutcome::Released { .. } => "released",
        }
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
