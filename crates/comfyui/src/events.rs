//! Lifecycle events emitted by the progress channel manager.
//!
//! Subscribe via [`ChannelManager::subscribe`](crate::manager::ChannelManager::subscribe)
//! to observe connects, drops, and reconnection attempts.

use serde::Serialize;

/// A connection-level event for one client id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// The WebSocket connection reached the connected state.
    Connected { client_id: String },

    /// The WebSocket connection closed (explicitly or unexpectedly).
    Disconnected { client_id: String },

    /// A reconnection attempt is scheduled.
    Reconnecting { client_id: String, attempt: u32 },

    /// Reconnection attempts are exhausted; the connection record was dropped.
    ReconnectExhausted { client_id: String },
}
