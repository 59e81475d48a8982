//! Messaging span attribute keys.

pub const MESSAGING_SYSTEM: &str = "messaging.system";
pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";
pub const MESSAGING_MESSAGE_ID: &str = "messaging.message.id";
pub const MESSAGING_CONSUMER_GROUP_NAME: &str = "messaging.consumer.group.name";
pub const MESSAGING_OPERATION_TYPE: &str = "messaging.operation.type";
pub const MESSAGING_REDELIVERY_COUNT: &str = "messaging.message.redelivery_count";
pub const COURIER_OUTCOME: &str = "courier.outcome";

/// Default value of `messaging.system` for spans Courier opens.
pub const DEFAULT_MESSAGING_SYSTEM: &str = "courier";
