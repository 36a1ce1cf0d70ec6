//! Job status, result, and artifact types.
//!
//! A [`JobResult`] is what callers of the orchestrator receive: the
//! engine-assigned prompt id, a terminal (or in-flight) status, the
//! fetched artifacts, and an error message for failed runs.

use serde::Serialize;

use crate::types::PromptId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Error text used when the engine reports success but no artifacts could
/// be collected.
pub const NO_IMAGES_ERROR: &str = "Execution completed but produced no images";

/// Error text used when the engine reports failure without any messages.
pub const GENERIC_EXECUTION_ERROR: &str = "Execution failed";

/// Fallback MIME type for unknown extensions.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` end observation of a job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A file produced by the engine, fetched as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub filename: String,
    pub subfolder: String,
    /// Engine folder type (`output`, `temp`, `input`).
    pub kind: String,
    pub mime_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Infer a MIME type from a filename extension (case-insensitive).
pub fn mime_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MIME_TYPE,
    }
}

// ---------------------------------------------------------------------------
// JobResult
// ---------------------------------------------------------------------------

/// Observed state of a submitted job.
///
/// `images` is empty unless the job completed and its artifacts were
/// fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub prompt_id: PromptId,
    pub status: JobStatus,
    pub images: Vec<Artifact>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn processing(prompt_id: impl Into<PromptId>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            status: JobStatus::Processing,
            images: Vec::new(),
            error: None,
        }
    }

    /// A completed result. An empty artifact list is remapped to `Failed`
    /// with [`NO_IMAGES_ERROR`] so a silently-broken run is never reported
    /// as success.
    pub fn completed(prompt_id: impl Into<PromptId>, images: Vec<Artifact>) -> Self {
        let prompt_id = prompt_id.into();
        if images.is_empty() {
            return Self::failed(prompt_id, NO_IMAGES_ERROR);
        }
        Self {
            prompt_id,
            status: JobStatus::Completed,
            images,
            error: None,
        }
    }

    /// A completion observed only as a push-channel signal, without
    /// artifacts. Used when the follow-up artifact fetch fails.
    pub fn completed_without_artifacts(prompt_id: impl Into<PromptId>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            status: JobStatus::Completed,
            images: Vec::new(),
            error: None,
        }
    }

    pub fn failed(prompt_id: impl Into<PromptId>, error: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            status: JobStatus::Failed,
            images: Vec::new(),
            error: Some(error.into()),
        }
    }
}
