// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Consumer Worker Pool
//!
//! Runs N independent worker loops per logical queue. Each worker owns a
//! private channel with bounded prefetch, pulls deliveries one at a time,
//! invokes the injected handler and acks on success; handler failures route
//! through the retry/DLQ escalation policy. A worker that loses its channel
//! tears down and re-establishes its own consumption loop with exponential
//! backoff, independent of its siblings. Only outer cancellation terminates
//! a worker.

use crate::{
    errors::AmqpError,
    handler::ConsumerHandler,
    notifications,
    otel,
    pool::{next_backoff, AmqpPool},
    publisher::{AmqpPublisher, Envelope, JSON_CONTENT_TYPE},
    retry::{retry_count, with_retry_count, Escalation},
};
use futures_util::{future::join_all, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Per-queue consumption settings. Immutable once a consumer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub queue: String,
    /// Routing key the queue is bound under; drives the `.retry`/`.dlq`
    /// routing keys used during escalation
    pub routing_key: String,
    pub workers: usize,
    /// Per-channel cap on unacknowledged deliveries
    pub prefetch: u16,
    pub consumer_tag: String,
    /// Base delay for a worker's reconnect backoff
    pub retry_backoff: Duration,
    /// Total processing attempts before a message is dead-lettered
    pub retry_max: i64,
    pub retry_exchange: String,
    pub dead_letter_exchange: String,
}

impl ConsumeOptions {
    pub fn new(queue: &str, routing_key: &str) -> ConsumeOptions {
        ConsumeOptions {
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            workers: 1,
            prefetch: 0,
            consumer_tag: String::new(),
            retry_backoff: Duration::ZERO,
            retry_max: 3,
            retry_exchange: notifications::EXCHANGE_RETRY.to_owned(),
            dead_letter_exchange: notifications::EXCHANGE_DLX.to_owned(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn retry_max(mut self, retry_max: i64) -> Self {
        self.retry_max = retry_max;
        self
    }

    pub fn exchanges(mut self, retry_exchange: &str, dead_letter_exchange: &str) -> Self {
        self.retry_exchange = retry_exchange.to_owned();
        self.dead_letter_exchange = dead_letter_exchange.to_owned();
        self
    }

    /// Fills in sane values for anything left unset.
    fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.prefetch == 0 {
            self.prefetch = self.workers as u16;
        }
        if self.retry_backoff.is_zero() {
            self.retry_backoff = Duration::from_secs(1);
        }
        if self.retry_max < 1 {
            self.retry_max = 1;
        }
        self
    }

    /// Exchange and routing key the escalated message is republished under.
    fn escalation_target(&self, escalation: &Escalation) -> (String, String) {
        match escalation {
            Escalation::Retry { .. } => (
                self.retry_exchange.clone(),
                format!("{}.retry", self.routing_key),
            ),
            Escalation::DeadLetter { .. } => (
                self.dead_letter_exchange.clone(),
                format!("{}.dlq", self.routing_key),
            ),
        }
    }

    /// Broker-side consumer tag for one worker. Empty base tag lets the
    /// broker generate one.
    fn worker_tag(&self, worker_id: usize) -> String {
        if self.consumer_tag.is_empty() {
            String::new()
        } else {
            format!("{}-{}", self.consumer_tag, worker_id)
        }
    }
}

/// Worker-pool consumer bound to the shared channel pool.
pub struct AmqpConsumer {
    pool: Arc<AmqpPool>,
    publisher: Arc<AmqpPublisher>,
}

impl AmqpConsumer {
    pub fn new(pool: Arc<AmqpPool>) -> AmqpConsumer {
        AmqpConsumer {
            publisher: AmqpPublisher::new(pool.clone()),
            pool,
        }
    }

    /// Binds `handler` to `options.queue` and blocks until `cancel` fires.
    ///
    /// Spawns `options.workers` independent loops. Handler failures never
    /// terminate a worker; transient broker faults are absorbed by each
    /// worker's own backoff-and-reconnect cycle.
    pub async fn consume(
        &self,
        cancel: CancellationToken,
        options: ConsumeOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if options.queue.is_empty() {
            return Err(AmqpError::ConsumerError("queue name is empty".to_owned()));
        }

        let options = Arc::new(options.normalized());

        let mut workers = Vec::with_capacity(options.workers);
        for worker_id in 0..options.workers {
            workers.push(tokio::spawn(run_worker(
                self.pool.clone(),
                self.publisher.clone(),
                cancel.clone(),
                options.clone(),
                handler.clone(),
                worker_id,
            )));
        }

        for joined in join_all(workers).await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "consumer worker panicked");
            }
        }

        Ok(())
    }
}

/// One worker's whole life: connect, consume, back off, repeat; exit on
/// cancellation.
async fn run_worker(
    pool: Arc<AmqpPool>,
    publisher: Arc<AmqpPublisher>,
    cancel: CancellationToken,
    options: Arc<ConsumeOptions>,
    handler: Arc<dyn ConsumerHandler>,
    worker_id: usize,
) {
    let mut backoff = options.retry_backoff;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let channel = match pool.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    worker = worker_id,
                    error = err.to_string(),
                    "channel open failed"
                );
                if backoff_sleep(&cancel, &mut backoff).await {
                    return;
                }
                continue;
            }
        };

        if let Err(err) = channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
        {
            error!(worker = worker_id, error = err.to_string(), "qos failed");
            let _ = channel.close(200, "qos failed").await;
            if backoff_sleep(&cancel, &mut backoff).await {
                return;
            }
            continue;
        }

        let mut consumer = match channel
            .basic_consume(
                &options.queue,
                &options.worker_tag(worker_id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    worker = worker_id,
                    error = err.to_string(),
                    "consume failed"
                );
                let _ = channel.close(200, "consume failed").await;
                if backoff_sleep(&cancel, &mut backoff).await {
                    return;
                }
                continue;
            }
        };

        debug!(
            worker = worker_id,
            queue = options.queue,
            prefetch = options.prefetch,
            "consumer started"
        );
        backoff = options.retry_backoff;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = channel.close(200, "consumer cancelled").await;
                    return;
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) =
                            handle_delivery(&publisher, &cancel, &options, handler.as_ref(), delivery)
                                .await
                        {
                            error!(
                                worker = worker_id,
                                error = err.to_string(),
                                "error handling delivery"
                            );
                        }
                    }
                    Some(Err(err)) => {
                        error!(
                            worker = worker_id,
                            error = err.to_string(),
                            "delivery stream error"
                        );
                        break;
                    }
                    None => {
                        warn!(worker = worker_id, "channel closed by broker");
                        break;
                    }
                }
            }
        }

        let _ = channel.close(200, "reconnecting").await;
        if backoff_sleep(&cancel, &mut backoff).await {
            return;
        }
    }
}

/// Sleeps the current backoff and doubles it. Returns true when cancellation
/// interrupted the sleep.
async fn backoff_sleep(cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    let current = *backoff;
    *backoff = next_backoff(current);

    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(current) => false,
    }
}

/// Runs the handler for one delivery and settles it: ack on success,
/// escalate on failure. Exactly one of ack/nack is issued per delivery.
async fn handle_delivery(
    publisher: &AmqpPublisher,
    cancel: &CancellationToken,
    options: &ConsumeOptions,
    handler: &dyn ConsumerHandler,
    delivery: Delivery,
) -> Result<(), AmqpError> {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &options.queue);

    match handler.handle(&ctx, &delivery).await {
        Ok(()) => match delivery.ack(BasicAckOptions::default()).await {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
        },
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = options.queue,
                "handler failed, escalating"
            );
            escalate(publisher, cancel, options, &mut span, &delivery).await
        }
    }
}

/// Applies the escalation policy to a failed delivery.
///
/// The original delivery is acked only after the replacement publish was
/// accepted by the broker; a failed publish nacks with requeue so the broker
/// redelivers instead of losing the message.
async fn escalate(
    publisher: &AmqpPublisher,
    cancel: &CancellationToken,
    options: &ConsumeOptions,
    span: &mut impl Span,
    delivery: &Delivery,
) -> Result<(), AmqpError> {
    let headers = delivery.properties.headers().as_ref();
    let escalation = Escalation::decide(retry_count(headers), options.retry_max);
    let (exchange, routing_key) = options.escalation_target(&escalation);

    let envelope = Envelope {
        body: delivery.data.clone(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_owned())
            .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        headers: with_retry_count(headers, escalation.attempts()),
    };

    match publisher
        .publish(cancel, &exchange, &routing_key, &envelope)
        .await
    {
        Ok(()) => match delivery.ack(BasicAckOptions::default()).await {
            Ok(()) => {
                debug!(
                    exchange,
                    routing_key,
                    attempts = escalation.attempts(),
                    "delivery escalated"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack escalated msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
        },
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange, routing_key, "escalation publish failed, requeueing"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("escalation publish failed"),
            });
            match delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(error = err.to_string(), "error whiling nack msg");
                    Err(AmqpError::NackMessageError)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockConsumerHandler;
    use lapin::{acker::Acker, types::ShortString, BasicProperties};
    use opentelemetry::Context;

    fn options() -> ConsumeOptions {
        ConsumeOptions::new("notifications.telegram", "telegram.send")
    }

    fn delivery_with(properties: BasicProperties, data: Vec<u8>) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: ShortString::from("notifications"),
            routing_key: ShortString::from("telegram.send"),
            redelivered: false,
            properties,
            data,
            acker: Acker::default(),
        }
    }

    #[test]
    fn normalization_fills_defaults() {
        let normalized = options().workers(0).normalized();
        assert_eq!(normalized.workers, 1);
        assert_eq!(normalized.prefetch, 1);
        assert_eq!(normalized.retry_backoff, Duration::from_secs(1));

        let normalized = options().workers(4).normalized();
        assert_eq!(normalized.prefetch, 4);
    }

    #[test]
    fn explicit_settings_survive_normalization() {
        let normalized = options()
            .workers(2)
            .prefetch(10)
            .retry_backoff(Duration::from_secs(30))
            .normalized();
        assert_eq!(normalized.workers, 2);
        assert_eq!(normalized.prefetch, 10);
        assert_eq!(normalized.retry_backoff, Duration::from_secs(30));
    }

    #[test]
    fn escalation_targets_follow_the_routing_key() {
        let opts = options();

        let (exchange, key) = opts.escalation_target(&Escalation::Retry { attempts: 1 });
        assert_eq!(exchange, notifications::EXCHANGE_RETRY);
        assert_eq!(key, "telegram.send.retry");

        let (exchange, key) = opts.escalation_target(&Escalation::DeadLetter { attempts: 3 });
        assert_eq!(exchange, notifications::EXCHANGE_DLX);
        assert_eq!(key, "telegram.send.dlq");
    }

    #[test]
    fn worker_tags_are_unique_per_worker() {
        let opts = options().consumer_tag("telegram");
        assert_eq!(opts.worker_tag(0), "telegram-0");
        assert_eq!(opts.worker_tag(3), "telegram-3");
        assert_eq!(options().worker_tag(0), "");
    }

    /// A message that keeps failing walks retry-count 1, 2 and then lands on
    /// the dead-letter key with count 3.
    #[test]
    fn repeated_failures_escalate_to_dead_letter() {
        let opts = options().retry_max(3);
        let mut headers: Option<lapin::types::FieldTable> = None;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let escalation = Escalation::decide(retry_count(headers.as_ref()), opts.retry_max);
            let (exchange, key) = opts.escalation_target(&escalation);
            seen.push((exchange, key, escalation.attempts()));
            headers = Some(with_retry_count(headers.as_ref(), escalation.attempts()));
        }

        assert_eq!(
            seen,
            vec![
                (
                    notifications::EXCHANGE_RETRY.to_owned(),
                    "telegram.send.retry".to_owned(),
                    1
                ),
                (
                    notifications::EXCHANGE_RETRY.to_owned(),
                    "telegram.send.retry".to_owned(),
                    2
                ),
                (
                    notifications::EXCHANGE_DLX.to_owned(),
                    "telegram.send.dlq".to_owned(),
                    3
                ),
            ]
        );
    }

    #[tokio::test]
    async fn handler_receives_the_delivery_body() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .withf(|_, delivery| delivery.data == b"ping".to_vec())
            .once()
            .returning(|_, _| Ok(()));

        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);
        let delivery = delivery_with(BasicProperties::default(), b"ping".to_vec());

        handler
            .handle(&Context::current(), &delivery)
            .await
            .expect("handler should accept the delivery");
    }
}
