//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for one logical
//! client id. Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`] over WebSocket.

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default window for the WebSocket handshake to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The raw WebSocket stream type used for ComfyUI connections.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for one client id on a ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    client_id: String,
    server_url: String,
    connect_timeout: Duration,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// Base HTTP URL of the instance (e.g. `http://host:8188`).
    pub server_url: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

/// Build the push-channel URL for a server base URL.
///
/// Maps `http` to `ws` and `https` to `wss`; `ws`/`wss` URLs are used
/// unchanged. Trailing slashes on the base are dropped.
pub fn ws_url(server_url: &str, client_id: &str) -> Result<String, ChannelError> {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ChannelError::InvalidUrl(server_url.to_string()));
    };
    Ok(format!("{ws_base}/ws?clientId={client_id}"))
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `client_id`  - id the engine routes this client's frames by.
    /// * `server_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(client_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// Fails with [`ChannelError::ConnectTimeout`] if the handshake does
    /// not complete within the connect timeout; the pending attempt is
    /// dropped.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ChannelError> {
        let url = ws_url(&self.server_url, &self.client_id)?;

        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| ChannelError::ConnectTimeout {
                url: url.clone(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| {
                ChannelError::Connection(format!(
                    "Failed to connect to ComfyUI at {}: {e}",
                    self.server_url
                ))
            })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI WebSocket at {}",
            self.server_url,
        );

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            server_url: self.server_url.clone(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the WebSocket connection.
    #[error("WebSocket connection error: {0}")]
    Connection(String),

    /// The handshake did not complete in time.
    #[error("WebSocket connect timeout after {timeout_ms}ms ({url})")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    /// The server URL has no http/https/ws/wss scheme.
    #[error("Invalid WebSocket server URL: {0}")]
    InvalidUrl(String),
}
