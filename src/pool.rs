// Copyright (c) 2025, The Notify Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Pool
//!
//! This module owns the single physical connection to the broker and a
//! fixed-size set of channels multiplexed over it. Publish paths draw
//! channels round-robin from the pool; consumer workers open private channels
//! straight off the connection. A background watcher listens for the
//! connection's error notification and rebuilds the whole pool with
//! exponential backoff, so every channel becomes valid again without callers
//! having to coordinate the reconnect themselves.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Weak,
};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// First reconnect delay after a connection loss.
pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Upper bound for the doubling reconnect delay.
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Doubles the given backoff, capped at [`MAX_BACKOFF`].
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

struct PoolState {
    connection: Option<Connection>,
    channels: Vec<Channel>,
    /// Incremented on every (re)connect; error events from a replaced
    /// connection carry a stale generation and are ignored.
    generation: u64,
}

/// Owner of the process-wide broker connection and its publish channels.
///
/// There is at most one live connection per pool; the pool is the sole
/// serializer of reconnect attempts. All shared state sits behind one mutex,
/// so channel selection never observes a half-rebuilt pool. Construct it once
/// during process wiring and hand the `Arc` to every publisher and consumer.
pub struct AmqpPool {
    config: AmqpConfig,
    state: Mutex<PoolState>,
    cursor: AtomicUsize,
    closed: AtomicBool,
    closed_tx: mpsc::UnboundedSender<u64>,
}

impl AmqpPool {
    /// Dials the broker, opens `config.pool_size` channels eagerly and starts
    /// the background close-watcher.
    ///
    /// The initial connect is fatal on failure; later connection losses are
    /// recovered by the watcher with exponential backoff.
    pub async fn connect(config: AmqpConfig) -> Result<Arc<AmqpPool>, AmqpError> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(AmqpPool {
            config,
            state: Mutex::new(PoolState {
                connection: None,
                channels: Vec::new(),
                generation: 0,
            }),
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        pool.rebuild().await?;
        debug!("amqp connection established, pool ready");

        spawn_watcher(Arc::downgrade(&pool), closed_rx);

        Ok(pool)
    }

    /// Selects a publish channel round-robin via the atomic cursor.
    ///
    /// Returns `None` while the pool is disconnected; callers are expected to
    /// treat that as a transient `NotConnected` condition, not a fatal one.
    pub async fn channel(&self) -> Option<Channel> {
        let state = self.state.lock().await;
        if state.connection.is_none() || state.channels.is_empty() {
            return None;
        }

        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(state.channels[i % state.channels.len()].clone())
    }

    /// Opens a private channel straight off the connection, outside the
    /// round-robin array. Consumer workers use these so a consume-side
    /// channel is never shared.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let state = self.state.lock().await;
        let Some(connection) = state.connection.as_ref() else {
            return Err(AmqpError::NotConnected);
        };

        match connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                error!(error = err.to_string(), "failure to create a channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes a faulty pool channel and replaces it with a fresh one from the
    /// same connection, leaving the rest of the pool untouched.
    pub async fn repair(&self, bad: &Channel) {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connection.as_ref() else {
            return;
        };

        let _ = bad.close(200, "replacing faulty channel").await;

        let replacement = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = err.to_string(), "failure to reopen pool channel");
                return;
            }
        };

        match state.channels.iter().position(|ch| ch.id() == bad.id()) {
            Some(i) => state.channels[i] = replacement,
            // The pool was rebuilt underneath us; the replacement is orphaned.
            None => {
                let _ = replacement.close(200, "pool rebuilt").await;
            }
        }
    }

    /// Reports whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state
            .connection
            .as_ref()
            .map(|conn| conn.status().connected())
            .unwrap_or(false)
    }

    /// Gracefully closes the connection. The watcher stops reconnecting.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        state.generation += 1;
        state.channels.clear();
        if let Some(connection) = state.connection.take() {
            let _ = connection.close(200, "shutting down").await;
        }
    }

    /// Tears down whatever is left of the previous connection and dials a new
    /// one, repopulating the channel array. Safe to call repeatedly.
    async fn rebuild(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        state.channels.clear();
        if let Some(old) = state.connection.take() {
            let _ = old.close(200, "rebuilding pool").await;
        }

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.app_name.clone()));

        let connection = match Connection::connect(&self.config.uri(), options).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError);
            }
        };

        let mut channels = Vec::with_capacity(self.config.pool_size);
        for _ in 0..self.config.pool_size {
            match connection.create_channel().await {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    error!(error = err.to_string(), "failure to create a channel");
                    let _ = connection.close(200, "pool setup failed").await;
                    return Err(AmqpError::ChannelError);
                }
            }
        }

        state.generation += 1;
        let generation = state.generation;
        let closed_tx = self.closed_tx.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection closed");
            let _ = closed_tx.send(generation);
        });

        state.connection = Some(connection);
        state.channels = channels;
        self.cursor.store(0, Ordering::Relaxed);

        Ok(())
    }
}

/// Listens for connection-loss notifications and rebuilds the pool with
/// exponential backoff until it succeeds. Holds only a weak reference so the
/// task dies with the pool.
fn spawn_watcher(pool: Weak<AmqpPool>, mut closed_rx: mpsc::UnboundedReceiver<u64>) {
    tokio::spawn(async move {
        while let Some(generation) = closed_rx.recv().await {
            let Some(pool) = pool.upgrade() else {
                return;
            };

            if pool.closed.load(Ordering::SeqCst) {
                return;
            }

            {
                let mut state = pool.state.lock().await;
                if generation != state.generation {
                    // A replaced connection reported its death late.
                    continue;
                }
                state.connection = None;
                state.channels.clear();
            }

            warn!("amqp connection lost, reconnecting");

            let mut backoff = INITIAL_BACKOFF;
            loop {
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);

                if pool.closed.load(Ordering::SeqCst) {
                    return;
                }

                match pool.rebuild().await {
                    Ok(()) => {
                        debug!(
                            channels = pool.config.pool_size,
                            "amqp reconnected, pool rebuilt"
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), "amqp reconnect failed, retrying");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
            ]
        );
        assert_eq!(next_backoff(backoff), MAX_BACKOFF);
    }
}
