// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Delivery Core
//!
//! This module provides the error taxonomy for the reliable-delivery layer.
//! The `AmqpError` enum covers connection and channel management, topology
//! declaration, publishing, consumption and acknowledgment failures.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transient broker faults (connection drop, channel close) are recovered
/// internally by the pool and the consumer workers; the variants here are what
/// surfaces to callers when an operation cannot complete.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The pool currently holds no live connection
    #[error("not connected")]
    NotConnected,

    /// Invalid or missing configuration value
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindingQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error encoding or decoding a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The caller's cancellation signal fired before the publish was accepted
    #[error("publish cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before the publish was accepted
    #[error("publish deadline elapsed")]
    PublishTimeout,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}
