// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! Reliable AMQP delivery core for the notification service: a self-healing
//! connection/channel pool, a bounded worker-pool consumer with explicit
//! acknowledgment, and retry-then-dead-letter escalation built on
//! broker-native delayed redelivery.

mod otel;

pub mod config;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod messages;
pub mod notifications;
pub mod pool;
pub mod publisher;
pub mod retry;
pub mod topology;
