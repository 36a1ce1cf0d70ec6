//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum.

use std::collections::HashMap;

use serde::Deserialize;

/// All known ComfyUI WebSocket message types.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// Aggregate per-node progress for a running prompt.
    #[serde(rename = "progress_state")]
    ProgressState(ProgressStateData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(PromptRef),

    /// A specific node is currently executing.
    #[serde(rename = "executing")]
    Executing(PromptRef),

    /// Step-level progress from a single node. Superseded by
    /// `progress_state` for overall progress.
    #[serde(rename = "progress")]
    Progress(PromptRef),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `progress_state` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressStateData {
    pub prompt_id: String,
    /// Per-node progress keyed by node id.
    #[serde(default)]
    pub nodes: HashMap<String, NodeProgress>,
}

/// Progress of one node inside a `progress_state` message.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeProgress {
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub max: f64,
    /// `pending`, `running`, or `finished`.
    #[serde(default)]
    pub state: Option<String>,
}

/// Payload of the informational execution messages; only the prompt
/// id is read, the remaining fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

impl ExecutedData {
    /// Whether this output references images or gifs, which marks the
    /// prompt's completion. The files themselves must be fetched over REST.
    pub fn has_media(&self) -> bool {
        ["images", "gifs"].iter().any(|key| {
            self.output
                .get(key)
                .and_then(|v| v.as_array())
                .is_some_and(|items| !items.is_empty())
        })
    }
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

impl ErrorData {
    /// `"{exception_type}: {exception_message}"`.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.exception_type, self.exception_message)
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
