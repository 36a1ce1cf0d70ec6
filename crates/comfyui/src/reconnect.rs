//! Fixed-delay reconnection for dropped progress channels.
//!
//! When a connection drops unexpectedly, the connection task calls
//! [`reconnect_loop`], which retries with the same client id and server
//! URL until it succeeds, the attempt budget is spent, or the
//! [`CancellationToken`] fires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::events::ChannelEvent;

/// Tunable parameters for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts allowed between two successful connections.
    pub max_attempts: u32,
    /// Wait before each attempt.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// How [`reconnect_loop`] ended.
pub enum ReconnectOutcome {
    Reconnected(ComfyUIConnection),
    Cancelled,
    /// `max_attempts` consecutive attempts failed.
    Exhausted,
}

/// Whether another attempt is allowed after `attempts` failed ones.
pub fn should_reconnect(attempts: u32, config: &ReconnectConfig) -> bool {
    attempts < config.max_attempts
}

/// Reconnect `client` with a fixed delay between attempts.
///
/// `attempts` is the connection's shared counter: it is incremented
/// before each attempt and reset to zero once a connection succeeds.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    attempts: &AtomicU32,
    event_tx: &broadcast::Sender<ChannelEvent>,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    loop {
        if cancel.is_cancelled() {
            return ReconnectOutcome::Cancelled;
        }

        let done = attempts.load(Ordering::SeqCst);
        if !should_reconnect(done, config) {
            tracing::warn!(
                client_id = client.client_id(),
                attempts = done,
                "Reconnect attempts exhausted",
            );
            return ReconnectOutcome::Exhausted;
        }

        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            client_id = client.client_id(),
            attempt,
            delay_ms = config.delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );
        let _ = event_tx.send(ChannelEvent::Reconnecting {
            client_id: client.client_id().to_string(),
            attempt,
        });

        tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            _ = tokio::time::sleep(config.delay) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            result = client.connect() => result,
        };

        match result {
            Ok(conn) => {
                tracing::info!(client_id = client.client_id(), attempt, "Reconnected to ComfyUI");
                attempts.store(0, Ordering::SeqCst);
                return ReconnectOutcome::Reconnected(conn);
            }
            Err(e) => {
                tracing::warn!(
                    client_id = client.client_id(),
                    error = %e,
                    "Reconnect attempt {attempt} failed",
                );
            }
        }
    }
}
