// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Notification Routing Constants
//!
//! Exchange, queue and routing-key names for the notification channels, plus
//! the standard topology declared at startup.

use crate::topology::{AmqpTopology, TopologyBinding};

/// Primary topic exchange business services publish into.
pub const EXCHANGE_NOTIFICATIONS: &str = "notifications";
/// Topic exchange whose queues delay failed messages before redelivery.
pub const EXCHANGE_RETRY: &str = "notifications.retry";
/// Topic exchange for messages that exhausted their retry attempts.
pub const EXCHANGE_DLX: &str = "notifications.dlx";

pub const QUEUE_EMAIL: &str = "notifications.email";
pub const QUEUE_SMS: &str = "notifications.sms";
pub const QUEUE_TELEGRAM: &str = "notifications.telegram";

pub const ROUTING_EMAIL_SEND: &str = "email.send";
pub const ROUTING_SMS_SEND: &str = "sms.send";
pub const ROUTING_TELEGRAM_SEND: &str = "telegram.send";

/// The standard notification topology: email, SMS and Telegram queues with
/// their retry and dead-letter wiring.
pub fn default_topology() -> AmqpTopology {
    AmqpTopology::new(EXCHANGE_NOTIFICATIONS, EXCHANGE_RETRY, EXCHANGE_DLX)
        .binding(TopologyBinding::new(QUEUE_EMAIL, ROUTING_EMAIL_SEND))
        .binding(TopologyBinding::new(QUEUE_SMS, ROUTING_SMS_SEND))
        .binding(TopologyBinding::new(QUEUE_TELEGRAM, ROUTING_TELEGRAM_SEND))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_names_derive_from_queue_names() {
        let binding = TopologyBinding::new(QUEUE_TELEGRAM, ROUTING_TELEGRAM_SEND);
        assert_eq!(binding.dlq_queue, "notifications.telegram.dlq");
        assert_eq!(binding.retry_routing_key(), "telegram.send.retry");
    }
}
