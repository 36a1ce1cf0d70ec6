//! Unified error type for orchestrated engine calls.
//!
//! The retry coordinator classifies failures from their rendered text, so
//! every variant's `Display` output carries the signal words the
//! classifier looks for (status codes, "timeout", "WebSocket", ...).

use easel_core::error_classification::{self, ErrorCategory, FallbackStrategy};

use crate::api::ComfyUIApiError;
use crate::client::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// REST call failed (transport, status, or node errors).
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// Progress channel could not be opened.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The health probe before a retry attempt failed.
    #[error("Engine health check failed for {0}")]
    Unhealthy(String),

    /// The progress channel dropped the job's handlers before it resolved.
    #[error("WebSocket channel closed before prompt {0} resolved")]
    ChannelClosed(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        error_classification::categorize(&self.to_string())
    }

    pub fn fallback_strategy(&self) -> Option<FallbackStrategy> {
        error_classification::fallback_strategy(&self.to_string())
    }
}
