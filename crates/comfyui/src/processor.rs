//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, and feeds them to the shared
//! [`ProgressTracker`], firing whatever handlers it hands back.

use std::sync::{Mutex, PoisonError};

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::WsStream;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::progress::ProgressTracker;

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The cancellation token fired; the socket was closed by us.
    Cancelled,
    /// The server closed the socket, the stream ended, or a receive failed.
    Dropped,
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// the stream is exhausted, or `cancel` fires (in which case a Close
/// frame is sent first).
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    client_id: &str,
    tracker: &Mutex<ProgressTracker>,
    cancel: &CancellationToken,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            next = ws_stream.next() => Some(next),
        };
        let Some(msg_result) = next else {
            if let Err(e) = ws_stream.close(None).await {
                tracing::debug!(client_id, error = %e, "Error closing WebSocket");
            }
            return SessionEnd::Cancelled;
        };

        match msg_result {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(&text, client_id, tracker);
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!(client_id, "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(client_id, ?frame, "ComfyUI WebSocket closed");
                return SessionEnd::Dropped;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::error!(client_id, error = %e, "WebSocket receive error");
                return SessionEnd::Dropped;
            }
            None => {
                tracing::info!(client_id, "WebSocket stream exhausted");
                return SessionEnd::Dropped;
            }
        }
    }
}

/// Parse one text frame and fire the handlers it resolves.
///
/// The tracker lock is released before any handler runs.
pub fn handle_text_message(text: &str, client_id: &str, tracker: &Mutex<ProgressTracker>) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(
                client_id,
                error = %e,
                raw_message = %text,
                "Ignoring unrecognised ComfyUI message",
            );
            return;
        }
    };

    log_message(client_id, &msg);

    let dispatches = tracker
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handle_message(&msg);

    for dispatch in dispatches {
        dispatch.fire();
    }
}

fn log_message(client_id: &str, msg: &ComfyUIMessage) {
    match msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                client_id,
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(client_id, prompt_id = ?data.prompt_id, "Execution started");
        }
        ComfyUIMessage::ExecutionCached(data)
        | ComfyUIMessage::Executing(data)
        | ComfyUIMessage::Progress(data) => {
            tracing::trace!(client_id, prompt_id = ?data.prompt_id, "Execution update");
        }
        ComfyUIMessage::ProgressState(_)
        | ComfyUIMessage::Executed(_)
        | ComfyUIMessage::ExecutionError(_) => {}
    }
}
