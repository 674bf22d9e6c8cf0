// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Serializes a message plus headers and correlation metadata into a
//! persistent AMQP envelope and submits it through a pool channel. Publishes
//! race the caller's cancellation signal; a failed publish triggers repair of
//! the channel it went out on, isolating the fault from the rest of the pool.

use crate::{errors::AmqpError, otel::AmqpTracePropagator, pool::AmqpPool};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

/// Content type tagged onto notification payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Messages are published persistent so they survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// One outbound message: opaque body plus the metadata that travels with it.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Caller-supplied correlation id; a fresh uuid is generated when absent
    pub correlation_id: Option<String>,
    /// Preserved across republishes; a fresh uuid is generated when absent
    pub message_id: Option<String>,
    pub headers: FieldTable,
}

impl Envelope {
    /// A JSON envelope with the standard content type.
    pub fn json(body: Vec<u8>) -> Envelope {
        Envelope {
            body,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            ..Envelope::default()
        }
    }
}

/// Publisher over the shared channel pool.
pub struct AmqpPublisher {
    pool: Arc<AmqpPool>,
}

impl AmqpPublisher {
    pub fn new(pool: Arc<AmqpPool>) -> Arc<AmqpPublisher> {
        Arc::new(AmqpPublisher { pool })
    }

    /// Publishes the envelope to `exchange` under `routing_key`.
    ///
    /// Returns once the broker has accepted the publish, or as soon as
    /// `cancel` fires. Cancellation mid-flight abandons the wait while the
    /// broker call may still complete; that is an accepted at-least-once
    /// boundary. A token that is already cancelled returns immediately
    /// without touching the pool.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        if cancel.is_cancelled() {
            return Err(AmqpError::Cancelled);
        }

        let Some(channel) = self.pool.channel().await else {
            return Err(AmqpError::NotConnected);
        };

        let properties = build_properties(envelope, &Context::current());

        let submit = async {
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &envelope.body,
                    properties,
                )
                .await?
                .await?;
            Ok::<(), lapin::Error>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AmqpError::Cancelled),
            result = submit => match result {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange, routing_key, "error publishing message"
                    );
                    self.pool.repair(&channel).await;
                    Err(AmqpError::PublishingError)
                }
            },
        }
    }

    /// [`publish`](Self::publish) with a deadline instead of a token.
    pub async fn publish_with_timeout(
        &self,
        timeout: Duration,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, self.publish(&cancel, exchange, routing_key, envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AmqpError::PublishTimeout),
        }
    }

    /// Hand-off point for business services: builds the standard JSON
    /// envelope and publishes it.
    pub async fn enqueue_message(
        &self,
        cancel: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: FieldTable,
        correlation_id: Option<String>,
    ) -> Result<(), AmqpError> {
        let envelope = Envelope {
            body,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            correlation_id,
            message_id: None,
            headers,
        };
        self.publish(cancel, exchange, routing_key, &envelope).await
    }
}

/// Builds the wire properties for an envelope: persistent delivery mode,
/// content type, correlation and message ids, epoch timestamp, and the
/// header map with the current trace context injected.
fn build_properties(envelope: &Envelope, ctx: &Context) -> BasicProperties {
    let mut headers = envelope.headers.inner().clone();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpTracePropagator::new(&mut headers))
    });

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let correlation_id = envelope
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let message_id = envelope
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_content_type(ShortString::from(envelope.content_type.clone()))
        .with_correlation_id(ShortString::from(correlation_id))
        .with_message_id(ShortString::from(message_id))
        .with_timestamp(timestamp)
        .with_headers(FieldTable::from(headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{retry_count, with_retry_count};

    #[test]
    fn properties_are_persistent_and_tagged() {
        let envelope = Envelope::json(b"{\"to\":\"ops\"}".to_vec());
        let props = build_properties(&envelope, &Context::current());

        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type(),
            &Some(ShortString::from(JSON_CONTENT_TYPE))
        );
        assert!(props.timestamp().is_some());
        // Generated when the caller supplies none.
        assert!(props.correlation_id().is_some());
        assert!(props.message_id().is_some());
    }

    #[test]
    fn caller_supplied_ids_are_preserved() {
        let envelope = Envelope {
            correlation_id: Some("req-42".to_owned()),
            message_id: Some("msg-7".to_owned()),
            ..Envelope::json(vec![])
        };
        let props = build_properties(&envelope, &Context::current());

        assert_eq!(props.correlation_id(), &Some(ShortString::from("req-42")));
        assert_eq!(props.message_id(), &Some(ShortString::from("msg-7")));
    }

    #[test]
    fn retry_header_travels_in_properties() {
        let envelope = Envelope {
            headers: with_retry_count(None, 2),
            ..Envelope::json(vec![])
        };
        let props = build_properties(&envelope, &Context::current());

        assert_eq!(retry_count(props.headers().as_ref()), 2);
    }
}
