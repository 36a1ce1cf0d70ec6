//! Job orchestration: submit a graph and observe it to a terminal result.
//!
//! [`Orchestrator::execute_workflow`] wraps each run in the retry
//! coordinator. Within one attempt the job is observed over the progress
//! channel when one is configured and the caller wants progress; any
//! failure there, or the deadline passing, falls back to polling the
//! engine's history. A prompt submitted by an earlier attempt is reused,
//! never submitted twice.
//!
//! Every call observes its job over its own channel client id, so one
//! job closing its channel never silences another job in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use easel_core::job::JobResult;
use easel_core::types::PromptId;
use easel_core::workflow_graph::JobGraph;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::api::{ComfyUIApi, DEFAULT_HEALTH_TIMEOUT};
use crate::backend::EngineBackend;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::manager::ChannelManager;
use crate::progress::{CompletionSignal, ProgressHandler};
use crate::retry::{HealthProbe, RetryConfig, RetryCoordinator};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for one attempt, shared by the push and poll paths.
    pub job_timeout: Duration,
    /// Default interval between history polls.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(2_000),
        }
    }
}

/// What the progress channel reported for a prompt.
enum ChannelOutcome {
    Completed(CompletionSignal),
    Failed(String),
}

type OutcomeSender = Arc<Mutex<Option<oneshot::Sender<ChannelOutcome>>>>;

/// State carried across the retry attempts of one `execute_workflow` call.
struct JobContext<'a> {
    graph: &'a JobGraph,
    poll_interval: Duration,
    on_progress: Option<&'a ProgressHandler>,
    /// Channel client id the prompt is submitted under; stable across
    /// attempts so a reused prompt keeps routing to it.
    client_id: String,
    submitted: Mutex<Option<PromptId>>,
}

pub struct Orchestrator {
    backend: Arc<dyn EngineBackend>,
    channel: Option<Arc<ChannelManager>>,
    retry: RetryCoordinator,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new<B>(backend: Arc<B>, config: OrchestratorConfig, retry: RetryConfig) -> Self
    where
        B: EngineBackend + 'static,
    {
        let probe: Arc<dyn HealthProbe> = backend.clone();
        Self {
            backend,
            channel: None,
            retry: RetryCoordinator::new(probe, retry),
            config,
        }
    }

    /// Observe jobs over `channel` when the caller asks for progress.
    pub fn with_channel(mut self, channel: Arc<ChannelManager>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Build the REST client, channel manager, and retry policy from
    /// environment-derived configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        let api = Arc::new(
            ComfyUIApi::new(&config.base_url)
                .with_timeouts(config.request_timeout, DEFAULT_HEALTH_TIMEOUT),
        );
        let orchestrator = Self::new(
            api,
            OrchestratorConfig {
                job_timeout: config.job_timeout,
                poll_interval: config.poll_interval,
            },
            config.retry_config(),
        );

        if config.use_websocket {
            orchestrator.with_channel(Arc::new(ChannelManager::new(config.channel_config())))
        } else {
            orchestrator
        }
    }

    pub fn channel(&self) -> Option<&Arc<ChannelManager>> {
        self.channel.as_ref()
    }

    /// Submit `graph` and wait for a terminal [`JobResult`].
    ///
    /// `poll_interval` defaults to the configured interval. Engine-side
    /// failures come back as `failed` results; transport faults that
    /// survive every retry come back as errors.
    pub async fn execute_workflow(
        &self,
        graph: &JobGraph,
        poll_interval: Option<Duration>,
        on_progress: Option<ProgressHandler>,
    ) -> Result<JobResult, EngineError> {
        let job = &JobContext {
            graph,
            poll_interval: poll_interval.unwrap_or(self.config.poll_interval),
            on_progress: on_progress.as_ref(),
            client_id: uuid::Uuid::new_v4().to_string(),
            submitted: Mutex::new(None),
        };

        self.retry
            .execute_with_retry(
                move || self.run_attempt(job),
                self.backend.base_url(),
                None,
            )
            .await
    }

    /// Close any open progress channels.
    pub async fn shutdown(&self) {
        if let Some(channel) = &self.channel {
            channel.shutdown().await;
        }
    }

    async fn run_attempt(&self, job: &JobContext<'_>) -> Result<JobResult, EngineError> {
        let deadline = Instant::now() + self.config.job_timeout;

        if let (Some(channel), Some(on_progress)) = (&self.channel, job.on_progress) {
            match self
                .observe_over_channel(channel, job, on_progress.clone(), deadline)
                .await
            {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Progress channel failed, falling back to polling");
                }
            }
        }

        self.poll_until_done(job, deadline).await
    }

    /// Push path. `Ok(None)` means the deadline passed, or completion was
    /// signalled before history recorded it; either way polling takes over.
    /// The job's channel is closed before returning.
    async fn observe_over_channel(
        &self,
        channel: &ChannelManager,
        job: &JobContext<'_>,
        on_progress: ProgressHandler,
        deadline: Instant,
    ) -> Result<Option<JobResult>, EngineError> {
        let base_url = self.backend.base_url();
        if !self.backend.is_healthy(base_url).await {
            return Err(EngineError::Unhealthy(base_url.to_string()));
        }

        let client_id = channel.connect(base_url, Some(&job.client_id)).await?;
        let observed = self
            .await_channel_outcome(channel, job, &client_id, on_progress, deadline)
            .await;
        channel.disconnect(&client_id).await;
        observed
    }

    async fn await_channel_outcome(
        &self,
        channel: &ChannelManager,
        job: &JobContext<'_>,
        client_id: &str,
        on_progress: ProgressHandler,
        deadline: Instant,
    ) -> Result<Option<JobResult>, EngineError> {
        let prompt_id = self.submit_once(job, Some(client_id)).await?;

        let (tx, rx) = oneshot::channel();
        let tx: OutcomeSender = Arc::new(Mutex::new(Some(tx)));
        let on_done = Arc::clone(&tx);
        let on_failed = tx;

        channel.on_progress(&prompt_id, on_progress);
        channel.on_completion(
            &prompt_id,
            Box::new(move |signal| resolve(&on_done, ChannelOutcome::Completed(signal))),
        );
        channel.on_error(
            &prompt_id,
            Box::new(move |message| resolve(&on_failed, ChannelOutcome::Failed(message))),
        );

        let outcome = tokio::select! {
            outcome = rx => outcome,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    prompt_id = %prompt_id,
                    timeout_ms = self.config.job_timeout.as_millis() as u64,
                    "Progress channel deadline passed, falling back to polling",
                );
                channel.clear_handlers(&prompt_id);
                return Ok(None);
            }
        };
        channel.clear_handlers(&prompt_id);

        match outcome {
            Ok(ChannelOutcome::Completed(signal)) => {
                tracing::info!(prompt_id = %prompt_id, node = %signal.node, "Completion signalled");
                match self.backend.poll_status(&prompt_id).await {
                    Ok(result) if result.status.is_terminal() => Ok(Some(result)),
                    Ok(_) => {
                        tracing::debug!(prompt_id = %prompt_id, "History not yet recorded after completion");
                        Ok(None)
                    }
                    Err(e) => {
                        tracing::warn!(
                            prompt_id = %prompt_id,
                            error = %e,
                            "Artifact fetch after completion failed",
                        );
                        Ok(Some(JobResult::completed_without_artifacts(prompt_id)))
                    }
                }
            }
            Ok(ChannelOutcome::Failed(message)) => {
                tracing::warn!(prompt_id = %prompt_id, error = %message, "Execution failed");
                Ok(Some(JobResult::failed(prompt_id, message)))
            }
            Err(_) => Err(EngineError::ChannelClosed(prompt_id)),
        }
    }

    /// Poll path: poll history until terminal or until `deadline`.
    /// Always polls at least once.
    async fn poll_until_done(
        &self,
        job: &JobContext<'_>,
        deadline: Instant,
    ) -> Result<JobResult, EngineError> {
        let prompt_id = self.submit_once(job, None).await?;

        loop {
            let result = self.backend.poll_status(&prompt_id).await?;
            if result.status.is_terminal() {
                tracing::info!(
                    prompt_id = %prompt_id,
                    status = result.status.as_str(),
                    images = result.images.len(),
                    "Job finished",
                );
                return Ok(result);
            }

            let now = Instant::now();
            if now >= deadline {
                let timeout_ms = self.config.job_timeout.as_millis() as u64;
                tracing::warn!(prompt_id = %prompt_id, timeout_ms, "Job timed out while polling");
                return Ok(JobResult::failed(
                    prompt_id.clone(),
                    format!("Timeout waiting for prompt {prompt_id} after {timeout_ms}ms"),
                ));
            }

            tokio::time::sleep(job.poll_interval.min(deadline - now)).await;
        }
    }

    async fn submit_once(
        &self,
        job: &JobContext<'_>,
        client_id: Option<&str>,
    ) -> Result<PromptId, EngineError> {
        let existing = lock(&job.submitted).clone();
        if let Some(prompt_id) = existing {
            tracing::debug!(prompt_id = %prompt_id, "Reusing submitted prompt");
            return Ok(prompt_id);
        }

        let prompt_id = self.backend.submit(job.graph, client_id).await?;
        tracing::info!(prompt_id = %prompt_id, nodes = job.graph.len(), "Workflow submitted");
        *lock(&job.submitted) = Some(prompt_id.clone());
        Ok(prompt_id)
    }
}

fn resolve(sender: &OutcomeSender, outcome: ChannelOutcome) {
    if let Some(tx) = lock(sender).take() {
        let _ = tx.send(outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
