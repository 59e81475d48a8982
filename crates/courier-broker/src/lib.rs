//! Broker boundary for Courier.
//!
//! Provides the `MessageConsumer` / `MessageSender` traits the consumer loop
//! and producer are written against, plus `MemoryBroker`, an in-process
//! implementation with exclusive/shared subscriptions, prefetch windows and
//! manual acknowledgement.

mod error;
mod memory;
mod subscription;
mod traits;

pub use error::{BrokerError, Result};
pub use memory::{DEFAULT_ACK_HISTORY, MemoryBroker, MemoryConsumer};
pub use subscription::{InitialPosition, SubscriptionMode, SubscriptionOptions};
pub use traits::{MessageConsumer, MessageSender};
