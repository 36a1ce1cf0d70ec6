use std::sync::Arc;

use anyhow::Context;
use easel_comfyui::config::EngineConfig;
use easel_comfyui::orchestrator::Orchestrator;
use easel_comfyui::progress::ProgressHandler;
use easel_core::job::JobStatus;
use easel_worker::{build_graph, write_artifacts, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel_worker=info,easel_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = EngineConfig::from_env().context("Invalid engine configuration")?;
    let worker = WorkerConfig::from_env().context("Invalid worker configuration")?;
    let graph = build_graph(&worker.source)?;

    tracing::info!(
        engine = %engine.base_url,
        nodes = graph.len(),
        websocket = engine.use_websocket,
        "Worker starting",
    );

    let orchestrator = Orchestrator::from_config(&engine);
    let on_progress: ProgressHandler = Arc::new(|percent: u8| tracing::info!(percent, "Progress"));

    let outcome = orchestrator
        .execute_workflow(&graph, None, Some(on_progress))
        .await;
    orchestrator.shutdown().await;
    let result = outcome.context("Job did not complete")?;

    match result.status {
        JobStatus::Completed => {
            let paths = write_artifacts(&worker.output_dir, &result)?;
            tracing::info!(
                prompt_id = %result.prompt_id,
                artifacts = paths.len(),
                "Job completed",
            );
            Ok(())
        }
        status => {
            let error = result.error.unwrap_or_default();
            tracing::error!(prompt_id = %result.prompt_id, status = status.as_str(), error = %error, "Job failed");
            anyhow::bail!("Job {} failed: {error}", result.prompt_id)
        }
    }
}
