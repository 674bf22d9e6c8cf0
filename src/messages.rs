// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Notification Payloads
//!
//! The JSON bodies business services enqueue and queue handlers decode. The
//! delivery core itself treats bodies as opaque bytes; these types live at
//! the boundary where handlers and enqueuers agree on an encoding.

use crate::{errors::AmqpError, publisher::Envelope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

/// A Telegram notification queued for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelegramNotification {
    pub notification_id: Uuid,
    /// Correlation id threaded from the originating request
    pub request_id: String,
    pub to: String,
    pub payload: String,
    #[serde(default)]
    pub parse_mode: String,
    /// Unix timestamp, seconds
    pub created_at: u64,
}

/// An email notification queued for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailNotification {
    pub notification_id: Uuid,
    pub request_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub created_at: u64,
}

/// Serializes a payload into the standard JSON envelope, carrying the
/// request id as the message's correlation id.
pub fn to_envelope<T: Serialize>(payload: &T, request_id: &str) -> Result<Envelope, AmqpError> {
    let body = serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::ParsePayloadError
    })?;

    let mut envelope = Envelope::json(body);
    envelope.correlation_id = Some(request_id.to_owned());
    Ok(envelope)
}

/// Decodes a delivery body produced by [`to_envelope`].
pub fn from_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, AmqpError> {
    serde_json::from_slice(body).map_err(|err| {
        error!(error = err.to_string(), "failure to parse payload");
        AmqpError::ParsePayloadError
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::JSON_CONTENT_TYPE;

    #[test]
    fn telegram_payload_travels_through_the_envelope() {
        let notification = TelegramNotification {
            notification_id: Uuid::new_v4(),
            request_id: "req-1".to_owned(),
            to: "@ops".to_owned(),
            payload: "deploy finished".to_owned(),
            parse_mode: String::new(),
            created_at: 1_700_000_000,
        };

        let envelope = to_envelope(&notification, &notification.request_id)
            .expect("payload should encode");
        assert_eq!(envelope.content_type, JSON_CONTENT_TYPE);
        assert_eq!(envelope.correlation_id.as_deref(), Some("req-1"));

        let decoded: TelegramNotification =
            from_body(&envelope.body).expect("payload should decode");
        assert_eq!(decoded, notification);
    }

    #[test]
    fn garbage_bodies_are_a_parse_error() {
        let result: Result<EmailNotification, AmqpError> = from_body(b"not json");
        assert_eq!(result.unwrap_err(), AmqpError::ParsePayloadError);
    }
}
