//! Classified retry loop for engine operations.
//!
//! [`RetryCoordinator::execute_with_retry`] runs an operation up to
//! `max_retries` times. Before every attempt after the first it probes
//! the engine's health; an unhealthy engine consumes the attempt. Each
//! failure is classified with [`easel_core::error_classification`] and
//! only transient or recoverable failures are retried, with capped
//! exponential backoff between attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use easel_core::error_classification::{self, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

use crate::api::ComfyUIApi;
use crate::error::EngineError;

/// Cheap liveness check run before each retry.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Never errors; any failure reads as unhealthy.
    async fn is_healthy(&self, base_url: &str) -> bool;
}

#[async_trait]
impl HealthProbe for ComfyUIApi {
    async fn is_healthy(&self, base_url: &str) -> bool {
        self.health_check_url(base_url).await
    }
}

/// Called with the failed attempt number and its error before sleeping.
pub type RetryCallback<'a> = &'a (dyn Fn(u32, &EngineError) + Send + Sync);

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. Values below 1 act as 1.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

pub struct RetryCoordinator {
    probe: Arc<dyn HealthProbe>,
    config: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(probe: Arc<dyn HealthProbe>, config: RetryConfig) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` with health probing, classification, and backoff.
    ///
    /// Returns the first success, or the error of the last attempt made.
    /// Permanent and fatal failures are returned immediately.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        server_url: &str,
        on_retry: Option<RetryCallback<'_>>,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let result = if attempt > 1 && !self.probe.is_healthy(server_url).await {
                tracing::warn!(server_url, attempt, "Engine unhealthy before retry");
                Err(EngineError::Unhealthy(server_url.to_string()))
            } else {
                operation().await
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(server_url, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let category = error.category();
            if !category.is_retryable() || attempt >= max_attempts {
                tracing::error!(
                    server_url,
                    attempt,
                    max_attempts,
                    category = %category,
                    error = %error,
                    "Operation failed, not retrying",
                );
                return Err(error);
            }

            let delay = error_classification::backoff_delay(
                attempt,
                self.config.base_delay,
                self.config.max_delay,
            );
            tracing::warn!(
                server_url,
                attempt,
                max_attempts,
                category = %category,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying",
            );
            if let Some(callback) = on_retry {
                callback(attempt, &error);
            }

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
