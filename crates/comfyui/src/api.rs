//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! artifact download, health probe, node introspection, image upload)
//! using [`reqwest`]. Every call carries a per-request timeout; expiry
//! aborts the in-flight request.

use std::time::Duration;

use easel_core::job::{mime_type_for, Artifact, JobResult};
use easel_core::workflow_graph::JobGraph;
use serde::{Deserialize, Serialize};

use crate::history::{HistoryEntry, HistoryState};

/// Default timeout for submission, history, and download calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the `/system_stats` health probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    request_timeout: Duration,
    health_timeout: Duration,
}

/// Body of a `POST /prompt` request.
#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a JobGraph,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; an empty object when the graph is valid.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

impl SubmitResponse {
    fn has_node_errors(&self) -> bool {
        match &self.node_errors {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }
}

/// Response of `POST /upload/image`.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("Network error: {0}")]
    Request(#[from] reqwest::Error),

    /// The request did not finish within its timeout and was aborted.
    #[error("Request timeout after {timeout_ms}ms calling {endpoint}")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The engine accepted the request but rejected one or more nodes.
    #[error("Prompt has node errors: {0}")]
    NodeErrors(String),

    /// A success response whose body could not be interpreted.
    #[error("Invalid response from ComfyUI: {0}")]
    InvalidResponse(String),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across multiple instances).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, request_timeout: Duration, health_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.health_timeout = health_timeout;
        self
    }

    /// Base HTTP API URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt`. Fails on a non-2xx status and on any
    /// node-level validation errors in the response, which are surfaced
    /// verbatim. Pass the progress channel's `client_id` so that push
    /// frames for this prompt are routed to it.
    pub async fn submit_workflow(
        &self,
        graph: &JobGraph,
        client_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = SubmitRequest {
            prompt: graph,
            client_id,
        };

        let response = self
            .send(
                "/prompt",
                self.client.post(format!("{}/prompt", self.api_url)).json(&body),
                self.request_timeout,
            )
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if submitted.has_node_errors() {
            return Err(ComfyUIApiError::NodeErrors(submitted.node_errors.to_string()));
        }

        tracing::info!(
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            nodes = graph.len(),
            "Workflow submitted to ComfyUI",
        );

        Ok(submitted)
    }

    /// Retrieve the history record for a specific prompt.
    ///
    /// Sends `GET /history/{prompt_id}`. Returns `None` while the engine
    /// has not recorded the prompt yet (404 or an empty history object).
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let endpoint = format!("/history/{prompt_id}");
        let response = self
            .send(
                &endpoint,
                self.client.get(format!("{}{endpoint}", self.api_url)),
                self.request_timeout,
            )
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let mut history: serde_json::Map<String, serde_json::Value> =
            Self::parse_response(response).await?;

        match history.remove(prompt_id) {
            Some(entry) => serde_json::from_value(entry)
                .map(Some)
                .map_err(|e| ComfyUIApiError::InvalidResponse(format!("history entry: {e}"))),
            None => Ok(None),
        }
    }

    /// Observe a prompt's state through its history record.
    ///
    /// Engine-reported failures come back as a `Failed` result rather than
    /// an error. On success every referenced image/gif is downloaded; a
    /// download that fails is logged and skipped, and a run that yields no
    /// artifacts at all is reported as failed.
    pub async fn poll_status(&self, prompt_id: &str) -> Result<JobResult, ComfyUIApiError> {
        let entry = self.get_history(prompt_id).await?;

        match HistoryState::from_entry(entry.as_ref()) {
            HistoryState::Pending | HistoryState::Running => {
                tracing::debug!(prompt_id = %prompt_id, "Prompt still processing");
                Ok(JobResult::processing(prompt_id))
            }
            HistoryState::Failed(error) => {
                tracing::warn!(prompt_id = %prompt_id, error = %error, "Prompt failed on engine");
                Ok(JobResult::failed(prompt_id, error))
            }
            HistoryState::Succeeded(files) => {
                let mut images = Vec::with_capacity(files.len());
                for file in &files {
                    match self
                        .download_artifact(&file.filename, &file.subfolder, &file.kind)
                        .await
                    {
                        Ok(artifact) => images.push(artifact),
                        Err(e) => {
                            tracing::warn!(
                                prompt_id = %prompt_id,
                                filename = %file.filename,
                                error = %e,
                                "Failed to download artifact",
                            );
                        }
                    }
                }

                if images.is_empty() {
                    tracing::warn!(
                        prompt_id = %prompt_id,
                        referenced = files.len(),
                        "Prompt reported success without retrievable images",
                    );
                }
                Ok(JobResult::completed(prompt_id, images))
            }
        }
    }

    /// Download one output file via `GET /view`.
    pub async fn download_artifact(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Artifact, ComfyUIApiError> {
        let request = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)]);
        let response = self.send("/view", request, self.request_timeout).await?;
        let response = Self::ensure_success(response).await?;
        let data = response.bytes().await?.to_vec();

        tracing::debug!(filename, bytes = data.len(), "Downloaded artifact");

        Ok(Artifact {
            filename: filename.to_string(),
            subfolder: subfolder.to_string(),
            kind: kind.to_string(),
            mime_type: mime_type_for(filename).to_string(),
            data,
        })
    }

    /// Probe `GET {base_url}/system_stats`. Any failure or non-2xx status
    /// is logged and reported as unhealthy, never returned as an error.
    pub async fn health_check_url(&self, base_url: &str) -> bool {
        let url = format!("{}/system_stats", base_url.trim_end_matches('/'));
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    url = %url,
                    status = response.status().as_u16(),
                    "ComfyUI health check returned non-success status",
                );
                false
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "ComfyUI health check failed");
                false
            }
        }
    }

    /// Health probe against this client's own instance.
    pub async fn health_check(&self) -> bool {
        self.health_check_url(&self.api_url).await
    }

    /// Node/model introspection via `GET /object_info[/{node_class}]`.
    pub async fn object_info(
        &self,
        node_class: Option<&str>,
    ) -> Result<serde_json::Value, ComfyUIApiError> {
        let endpoint = match node_class {
            Some(class) => format!("/object_info/{class}"),
            None => "/object_info".to_string(),
        };
        let response = self
            .send(
                &endpoint,
                self.client.get(format!("{}{endpoint}", self.api_url)),
                self.request_timeout,
            )
            .await?;
        Self::parse_response(response).await
    }

    /// Whether the engine has a node class installed.
    pub async fn has_node_class(&self, node_class: &str) -> Result<bool, ComfyUIApiError> {
        let info = self.object_info(Some(node_class)).await?;
        Ok(info.get(node_class).is_some())
    }

    /// Upload an input image via multipart `POST /upload/image`.
    ///
    /// Returns the stored name as a `LoadImage` node expects it
    /// (`subfolder/name` when the engine placed it in a subfolder).
    pub async fn upload_image(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> Result<String, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type_for(filename))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", overwrite.to_string());

        let response = self
            .send(
                "/upload/image",
                self.client
                    .post(format!("{}/upload/image", self.api_url))
                    .multipart(form),
                self.request_timeout,
            )
            .await?;
        let uploaded: UploadResponse = Self::parse_response(response).await?;

        tracing::info!(name = %uploaded.name, subfolder = %uploaded.subfolder, "Uploaded image");

        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    // ---- private helpers ----

    /// Send a request with a timeout, mapping expiry to
    /// [`ComfyUIApiError::Timeout`].
    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        request.timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                ComfyUIApiError::Timeout {
                    endpoint: endpoint.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                ComfyUIApiError::Request(e)
            }
        })
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
