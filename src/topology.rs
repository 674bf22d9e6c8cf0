// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Broker Topology Management
//!
//! Declares the exchange/queue graph the delivery core relies on: a primary
//! topic exchange, a retry exchange and a dead-letter exchange, plus the
//! main/retry/DLQ queue triple for every logical queue. Main queues
//! dead-letter into the retry exchange; retry queues hold messages for a TTL
//! and dead-letter back into the primary exchange under the original routing
//! key. Every declaration is idempotent, so the whole graph is safe to
//! re-declare after a reconnect.

use crate::errors::AmqpError;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, ExchangeKind,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, error};

/// Queue argument naming the exchange rejected/expired messages go to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key dead-lettered messages carry
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for the per-message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// How long a message sits in a retry queue before the broker routes it back
/// to the main queue.
pub const DEFAULT_RETRY_TTL: Duration = Duration::from_secs(5);

/// One logical queue with its routing key and derived retry/DLQ names.
///
/// Used only at startup and reconnect to (re)declare broker objects; not
/// retained as runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyBinding {
    pub queue: String,
    pub routing_key: String,
    pub dlq_queue: String,
}

impl TopologyBinding {
    pub fn new(queue: &str, routing_key: &str) -> TopologyBinding {
        TopologyBinding {
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            dlq_queue: format!("{queue}.dlq"),
        }
    }

    pub fn retry_queue(&self) -> String {
        format!("{}.retry", self.queue)
    }

    pub fn retry_routing_key(&self) -> String {
        format!("{}.retry", self.routing_key)
    }

    pub fn dlq_routing_key(&self) -> String {
        format!("{}.dlq", self.routing_key)
    }
}

/// Declarative description of the retry/dead-letter binding graph.
///
/// Holds no broker state; [`AmqpTopology::declare`] installs it and can be
/// run against any channel, as often as needed.
pub struct AmqpTopology {
    primary_exchange: String,
    retry_exchange: String,
    dead_letter_exchange: String,
    retry_ttl: Duration,
    bindings: Vec<TopologyBinding>,
}

impl AmqpTopology {
    pub fn new(primary_exchange: &str, retry_exchange: &str, dead_letter_exchange: &str) -> Self {
        AmqpTopology {
            primary_exchange: primary_exchange.to_owned(),
            retry_exchange: retry_exchange.to_owned(),
            dead_letter_exchange: dead_letter_exchange.to_owned(),
            retry_ttl: DEFAULT_RETRY_TTL,
            bindings: vec![],
        }
    }

    /// Overrides the retry delay applied by the retry queues.
    pub fn retry_ttl(mut self, ttl: Duration) -> Self {
        self.retry_ttl = ttl;
        self
    }

    /// Adds a logical queue to the graph.
    pub fn binding(mut self, binding: TopologyBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Declares the whole graph on the given channel, in order: the three
    /// exchanges, then the queue triple for every binding.
    ///
    /// Topology is a hard dependency; the first declaration error aborts and
    /// is returned to the caller, there is no retry here.
    pub async fn declare(&self, channel: &Channel) -> Result<(), AmqpError> {
        self.declare_exchange(channel, &self.primary_exchange).await?;
        self.declare_exchange(channel, &self.retry_exchange).await?;
        self.declare_exchange(channel, &self.dead_letter_exchange)
            .await?;

        for binding in &self.bindings {
            self.declare_binding(channel, binding).await?;
            debug!(
                queue = binding.queue,
                routing_key = binding.routing_key,
                "queue declared"
            );
        }

        Ok(())
    }

    async fn declare_exchange(&self, channel: &Channel, name: &str) -> Result<(), AmqpError> {
        match channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "failure to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_binding(
        &self,
        channel: &Channel,
        binding: &TopologyBinding,
    ) -> Result<(), AmqpError> {
        self.declare_queue(channel, &binding.queue, self.main_queue_args(binding))
            .await?;
        self.bind_queue(
            channel,
            &binding.queue,
            &self.primary_exchange,
            &binding.routing_key,
        )
        .await?;

        self.declare_queue(
            channel,
            &binding.retry_queue(),
            self.retry_queue_args(binding),
        )
        .await?;
        self.bind_queue(
            channel,
            &binding.retry_queue(),
            &self.retry_exchange,
            &binding.retry_routing_key(),
        )
        .await?;

        self.declare_queue(channel, &binding.dlq_queue, FieldTable::default())
            .await?;
        self.bind_queue(
            channel,
            &binding.dlq_queue,
            &self.dead_letter_exchange,
            &binding.dlq_routing_key(),
        )
        .await
    }

    /// Main queue arguments: rejected/expired messages flow to the retry
    /// exchange under the `.retry` routing key.
    fn main_queue_args(&self, binding: &TopologyBinding) -> FieldTable {
        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.retry_exchange.clone())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(binding.retry_routing_key())),
        );
        FieldTable::from(args)
    }

    /// Retry queue arguments: hold for the TTL, then dead-letter back to the
    /// primary exchange under the original routing key.
    fn retry_queue_args(&self, binding: &TopologyBinding) -> FieldTable {
        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(self.retry_ttl.as_millis() as i32)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.primary_exchange.clone())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(binding.routing_key.clone())),
        );
        FieldTable::from(args)
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue, exchange, "failure to bind queue to exchange"
                );
                Err(AmqpError::BindingQueueError(
                    queue.to_owned(),
                    exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_str(table: &FieldTable, key: &str) -> Option<String> {
        match table.inner().get(&ShortString::from(key)) {
            Some(AMQPValue::LongString(v)) => {
                Some(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            _ => None,
        }
    }

    #[test]
    fn binding_derives_retry_and_dlq_names() {
        let binding = TopologyBinding::new("notifications.telegram", "telegram.send");
        assert_eq!(binding.retry_queue(), "notifications.telegram.retry");
        assert_eq!(binding.dlq_queue, "notifications.telegram.dlq");
        assert_eq!(binding.retry_routing_key(), "telegram.send.retry");
        assert_eq!(binding.dlq_routing_key(), "telegram.send.dlq");
    }

    #[test]
    fn main_queue_dead_letters_into_retry_exchange() {
        let topology = AmqpTopology::new("notifications", "notifications.retry", "notifications.dlx");
        let binding = TopologyBinding::new("notifications.email", "email.send");

        let args = topology.main_queue_args(&binding);
        assert_eq!(
            table_str(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE).as_deref(),
            Some("notifications.retry")
        );
        assert_eq!(
            table_str(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("email.send.retry")
        );
    }

    #[test]
    fn retry_queue_routes_back_to_primary_after_ttl() {
        let topology = AmqpTopology::new("notifications", "notifications.retry", "notifications.dlx")
            .retry_ttl(Duration::from_secs(7));
        let binding = TopologyBinding::new("notifications.email", "email.send");

        let args = topology.retry_queue_args(&binding);
        assert_eq!(
            table_str(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE).as_deref(),
            Some("notifications")
        );
        assert_eq!(
            table_str(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("email.send")
        );
        assert_eq!(
            args.inner().get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(7000))
        );
    }
}
