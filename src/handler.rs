// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Consumer Handler Contract
//!
//! The seam between the delivery core and the business layer. A handler
//! receives one delivery, decodes it and processes it; the worker that
//! invoked it owns the acknowledgment. Handlers must tolerate duplicate
//! invocations for the same logical message, because delivery is
//! at-least-once.

use async_trait::async_trait;
use lapin::message::Delivery;
use opentelemetry::Context;

#[cfg(test)]
use mockall::automock;

/// Error type returned by handlers; any failure routes the delivery through
/// the retry/DLQ escalation policy.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one decoded message.
///
/// Implementations must not ack or nack the delivery themselves and must not
/// retain it past the call.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}
