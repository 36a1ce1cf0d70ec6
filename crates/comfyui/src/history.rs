//! Typed view of `GET /history/{prompt_id}` records.
//!
//! The engine writes a history record once a prompt has run. A record
//! carries the per-node outputs (file references, never bytes) and a
//! status block:
//!
//! ```json
//! {
//!   "outputs": { "9": { "images": [{ "filename": "x_00001_.png", "subfolder": "", "type": "output" }] } },
//!   "status": { "status_str": "success", "completed": true, "messages": [["execution_start", {}]] }
//! }
//! ```

use std::collections::BTreeMap;

use easel_core::job::GENERIC_EXECUTION_ERROR;
use serde::Deserialize;

/// Engine message types that describe a failed run.
const FAILURE_MESSAGE_TYPES: &[&str] = &["execution_error", "execution_interrupted"];

/// One history record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Node outputs keyed by node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Files produced by one output node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
}

/// Reference to a file the engine stored; fetch it via `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub kind: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Execution status block of a history record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[type, data]` pairs logged by the engine during execution.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl HistoryStatus {
    /// Concatenated failure messages reported by the engine.
    ///
    /// Uses each failure message's `exception_message`, falling back to
    /// the message type when the payload has no text.
    pub fn error_text(&self) -> String {
        let messages: Vec<String> = self
            .messages
            .iter()
            .filter(|(kind, _)| FAILURE_MESSAGE_TYPES.contains(&kind.as_str()))
            .map(|(kind, data)| {
                data.get("exception_message")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(kind.as_str())
                    .to_string()
            })
            .collect();

        if messages.is_empty() {
            GENERIC_EXECUTION_ERROR.to_string()
        } else {
            messages.join("; ")
        }
    }
}

impl HistoryEntry {
    /// All image and gif references, in node-id order.
    pub fn output_files(&self) -> Vec<OutputFile> {
        self.outputs
            .values()
            .flat_map(|output| output.images.iter().chain(output.gifs.iter()))
            .cloned()
            .collect()
    }
}

/// Interpretation of a (possibly missing) history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    /// Not yet recorded by the engine.
    Pending,
    /// Recorded but not complete.
    Running,
    /// Complete with an engine-reported error.
    Failed(String),
    /// Complete and successful; the referenced files still need fetching.
    Succeeded(Vec<OutputFile>),
}

impl HistoryState {
    pub fn from_entry(entry: Option<&HistoryEntry>) -> Self {
        let Some(entry) = entry else {
            return HistoryState::Pending;
        };
        let Some(status) = entry.status.as_ref().filter(|s| s.completed) else {
            return HistoryState::Running;
        };
        if status.status_str == "error" {
            return HistoryState::Failed(status.error_text());
        }
        HistoryState::Succeeded(entry.output_files())
    }
}
