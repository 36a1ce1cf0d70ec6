//! The engine seam the orchestrator drives.
//!
//! [`ComfyUIApi`] is the production implementation; tests substitute
//! scripted fakes.

use async_trait::async_trait;
use easel_core::job::JobResult;
use easel_core::types::PromptId;
use easel_core::workflow_graph::JobGraph;

use crate::api::{ComfyUIApiError, ComfyUIApi};
use crate::retry::HealthProbe;

/// Submission and status calls against one engine instance.
#[async_trait]
pub trait EngineBackend: HealthProbe {
    /// Base HTTP URL of the engine, used for health probes and the
    /// progress channel.
    fn base_url(&self) -> &str;

    /// Queue `graph` and return the engine's prompt id.
    async fn submit(
        &self,
        graph: &JobGraph,
        client_id: Option<&str>,
    ) -> Result<PromptId, ComfyUIApiError>;

    /// Current state of a submitted prompt, with artifacts once complete.
    async fn poll_status(&self, prompt_id: &str) -> Result<JobResult, ComfyUIApiError>;
}

#[async_trait]
impl EngineBackend for ComfyUIApi {
    fn base_url(&self) -> &str {
        self.api_url()
    }

    async fn submit(
        &self,
        graph: &JobGraph,
        client_id: Option<&str>,
    ) -> Result<PromptId, ComfyUIApiError> {
        let response = self.submit_workflow(graph, client_id).await?;
        Ok(response.prompt_id)
    }

    async fn poll_status(&self, prompt_id: &str) -> Result<JobResult, ComfyUIApiError> {
        ComfyUIApi::poll_status(self, prompt_id).await
    }
}
