//! Progress channel manager.
//!
//! [`ChannelManager`] owns the WebSocket connections of one orchestrator,
//! keyed by client id. Each connection runs in its own task
//! (process -> reconnect loop) with a child [`CancellationToken`]; all
//! connections feed one shared [`ProgressTracker`] where callers register
//! per-prompt handlers.
//!
//! Lifecycle events are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`ChannelManager::subscribe`] to receive them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::client::{ChannelError, ComfyUIClient, ComfyUIConnection, DEFAULT_CONNECT_TIMEOUT};
use crate::events::ChannelEvent;
use crate::processor::{process_messages, SessionEnd};
use crate::progress::{CompletionHandler, ErrorHandler, ProgressHandler, ProgressTracker};
use crate::reconnect::{reconnect_loop, ReconnectConfig, ReconnectOutcome};

/// Broadcast channel capacity for lifecycle events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long `disconnect`/`shutdown` wait for a connection task to exit.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings shared by every client id.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
        }
    }
}

type ConnectionMap = Arc<RwLock<HashMap<String, ManagedConnection>>>;

/// Bookkeeping for one client id.
struct ManagedConnection {
    server_url: String,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
    task_handle: tokio::task::JoinHandle<()>,
    /// Child of the manager's master token.
    cancel: CancellationToken,
}

/// Manages progress channel connections and their handler registry.
pub struct ChannelManager {
    connections: ConnectionMap,
    tracker: Arc<Mutex<ProgressTracker>>,
    event_tx: broadcast::Sender<ChannelEvent>,
    config: ChannelConfig,
    /// Master cancellation token, cancelled on shutdown or drop.
    cancel: CancellationToken,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            tracker: Arc::new(Mutex::new(ProgressTracker::new())),
            event_tx,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    /// Open (or reuse) a progress channel and return its client id.
    ///
    /// A client id that is already connected is returned as-is without
    /// opening a second socket. When `client_id` is `None` a UUID v4 is
    /// generated. A record for the same id that is currently reconnecting
    /// is replaced.
    pub async fn connect(
        &self,
        server_url: &str,
        client_id: Option<&str>,
    ) -> Result<String, ChannelError> {
        let client_id = client_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(managed) = self.connections.read().await.get(&client_id) {
            if managed.connected.load(Ordering::SeqCst) {
                tracing::debug!(client_id = %client_id, "Reusing connected progress channel");
                return Ok(client_id);
            }
        }

        let client = ComfyUIClient::new(client_id.clone(), server_url)
            .with_connect_timeout(self.config.connect_timeout);
        let conn = client.connect().await?;

        let connected = Arc::new(AtomicBool::new(true));
        let reconnect_attempts = Arc::new(AtomicU32::new(0));
        let conn_cancel = self.cancel.child_token();

        let task = ConnectionTask {
            client,
            tracker: Arc::clone(&self.tracker),
            event_tx: self.event_tx.clone(),
            connections: Arc::clone(&self.connections),
            connected: Arc::clone(&connected),
            reconnect_attempts: Arc::clone(&reconnect_attempts),
            reconnect: self.config.reconnect.clone(),
            cancel: conn_cancel.clone(),
        };
        let task_handle = tokio::spawn(task.run(conn));

        let managed = ManagedConnection {
            server_url: server_url.to_string(),
            connected,
            reconnect_attempts,
            task_handle,
            cancel: conn_cancel,
        };

        let replaced = self
            .connections
            .write()
            .await
            .insert(client_id.clone(), managed);
        if let Some(old) = replaced {
            tracing::debug!(client_id = %client_id, "Replacing stale progress channel");
            old.cancel.cancel();
        }

        let _ = self.event_tx.send(ChannelEvent::Connected {
            client_id: client_id.clone(),
        });
        Ok(client_id)
    }

    /// Close a channel and drop its record. Unknown ids are a no-op.
    pub async fn disconnect(&self, client_id: &str) {
        let removed = self.connections.write().await.remove(client_id);
        let Some(managed) = removed else {
            tracing::debug!(client_id, "Disconnect for unknown client id ignored");
            return;
        };

        tracing::info!(client_id, server_url = %managed.server_url, "Closing progress channel");
        stop_connection(client_id, managed).await;
    }

    /// Whether `client_id` currently has an open socket.
    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(client_id)
            .is_some_and(|m| m.connected.load(Ordering::SeqCst))
    }

    /// Number of connection records, including ones mid-reconnect.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Failed reconnect attempts since the last successful connection.
    pub async fn reconnect_attempts(&self, client_id: &str) -> Option<u32> {
        self.connections
            .read()
            .await
            .get(client_id)
            .map(|m| m.reconnect_attempts.load(Ordering::SeqCst))
    }

    pub fn on_progress(&self, prompt_id: &str, handler: ProgressHandler) {
        self.tracker().on_progress(prompt_id, handler);
    }

    /// Register the completion handler. A completion that arrived before
    /// registration fires it immediately.
    pub fn on_completion(&self, prompt_id: &str, handler: CompletionHandler) {
        let early = self.tracker().on_completion(prompt_id, handler);
        if let Some(dispatch) = early {
            dispatch.fire();
        }
    }

    /// Register the error handler. An error that arrived before
    /// registration fires it immediately.
    pub fn on_error(&self, prompt_id: &str, handler: ErrorHandler) {
        let early = self.tracker().on_error(prompt_id, handler);
        if let Some(dispatch) = early {
            dispatch.fire();
        }
    }

    /// Drop all handlers registered for `prompt_id`.
    pub fn clear_handlers(&self, prompt_id: &str) {
        self.tracker().clear(prompt_id);
    }

    /// Whether any handler is registered for `prompt_id`.
    pub fn is_tracking(&self, prompt_id: &str) -> bool {
        self.tracker().is_tracking(prompt_id)
    }

    /// Close every channel, waiting up to 5 seconds per task.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down progress channel manager");
        self.cancel.cancel();

        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (client_id, managed) in drained {
            stop_connection(&client_id, managed).await;
        }

        tracing::info!("Progress channel manager shut down");
    }

    fn tracker(&self) -> MutexGuard<'_, ProgressTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn stop_connection(client_id: &str, managed: ManagedConnection) {
    managed.cancel.cancel();
    if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, managed.task_handle)
        .await
        .is_err()
    {
        tracing::warn!(client_id, "Connection task did not stop in time");
    }
}

/// State moved into a spawned connection task.
struct ConnectionTask {
    client: ComfyUIClient,
    tracker: Arc<Mutex<ProgressTracker>>,
    event_tx: broadcast::Sender<ChannelEvent>,
    connections: ConnectionMap,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
}

impl ConnectionTask {
    /// Core connection loop: process messages -> reconnect.
    ///
    /// Runs until cancelled or until reconnect attempts are exhausted.
    async fn run(self, conn: ComfyUIConnection) {
        let client_id = self.client.client_id().to_string();
        let mut ws_stream = conn.ws_stream;

        loop {
            self.connected.store(true, Ordering::SeqCst);
            let end = process_messages(&mut ws_stream, &client_id, &self.tracker, &self.cancel).await;
            self.connected.store(false, Ordering::SeqCst);

            let _ = self.event_tx.send(ChannelEvent::Disconnected {
                client_id: client_id.clone(),
            });

            if end == SessionEnd::Cancelled || self.cancel.is_cancelled() {
                tracing::debug!(client_id = %client_id, "Connection task stopped");
                return;
            }

            tracing::info!(client_id = %client_id, "Connection lost, entering reconnect loop");
            match reconnect_loop(
                &self.client,
                &self.reconnect,
                &self.reconnect_attempts,
                &self.event_tx,
                &self.cancel,
            )
            .await
            {
                ReconnectOutcome::Reconnected(conn) => {
                    ws_stream = conn.ws_stream;
                    let _ = self.event_tx.send(ChannelEvent::Connected {
                        client_id: client_id.clone(),
                    });
                }
                ReconnectOutcome::Cancelled => return,
                ReconnectOutcome::Exhausted => {
                    self.drop_own_record(&client_id).await;
                    let _ = self
                        .event_tx
                        .send(ChannelEvent::ReconnectExhausted { client_id });
                    return;
                }
            }
        }
    }

    /// Remove this task's record, unless it was already replaced.
    async fn drop_own_record(&self, client_id: &str) {
        let mut conns = self.connections.write().await;
        let owned = conns
            .get(client_id)
            .is_some_and(|m| Arc::ptr_eq(&m.connected, &self.connected));
        if owned {
            conns.remove(client_id);
        }
    }
}
