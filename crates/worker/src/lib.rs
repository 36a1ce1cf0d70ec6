//! One-shot generation job: pick a graph, run it, write its artifacts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use easel_core::error::CoreError;
use easel_core::job::JobResult;
use easel_core::workflow_graph::{slots, GraphBuilder, JobGraph, SamplerParams};

const DEFAULT_CHECKPOINT: &str = "sd_xl_base_1.0.safetensors";
const DEFAULT_OUTPUT_DIR: &str = "output";

/// Where the job graph comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphSource {
    /// An API-format workflow exported from the engine UI.
    File(PathBuf),
    /// A text-to-image graph built from a prompt.
    Prompt {
        prompt: String,
        negative_prompt: String,
        checkpoint: String,
    },
}

/// Worker settings loaded from environment variables.
///
/// | Env Var           | Default                      |
/// |-------------------|------------------------------|
/// | `WORKFLOW_PATH`   | unset (takes precedence)     |
/// | `PROMPT`          | required without a workflow  |
/// | `NEGATIVE_PROMPT` | empty                        |
/// | `CHECKPOINT`      | `sd_xl_base_1.0.safetensors` |
/// | `OUTPUT_DIR`      | `output`                     |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub source: GraphSource,
    pub output_dir: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let source = if let Some(path) = non_empty("WORKFLOW_PATH") {
            GraphSource::File(PathBuf::from(path))
        } else if let Some(prompt) = non_empty("PROMPT") {
            GraphSource::Prompt {
                prompt,
                negative_prompt: non_empty("NEGATIVE_PROMPT").unwrap_or_default(),
                checkpoint: non_empty("CHECKPOINT").unwrap_or_else(|| DEFAULT_CHECKPOINT.into()),
            }
        } else {
            return Err(CoreError::Validation(
                "Either WORKFLOW_PATH or PROMPT must be set".into(),
            ));
        };

        Ok(Self {
            source,
            output_dir: non_empty("OUTPUT_DIR")
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.into())
                .into(),
        })
    }
}

/// Load or build the job graph for `source`.
pub fn build_graph(source: &GraphSource) -> anyhow::Result<JobGraph> {
    match source {
        GraphSource::File(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read workflow {}", path.display()))?;
            let json: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Workflow {} is not valid JSON", path.display()))?;
            let graph = JobGraph::from_json(&json)?;

            for dangling in graph.dangling_references() {
                tracing::warn!(
                    node = %dangling.node,
                    input = %dangling.input,
                    target = %dangling.target,
                    "Workflow input references a missing node",
                );
            }
            Ok(graph)
        }
        GraphSource::Prompt {
            prompt,
            negative_prompt,
            checkpoint,
        } => Ok(text_to_image(prompt, negative_prompt, checkpoint)),
    }
}

/// checkpoint -> encode x2 -> empty latent -> sampler -> decode -> save.
pub fn text_to_image(prompt: &str, negative_prompt: &str, checkpoint: &str) -> JobGraph {
    let mut b = GraphBuilder::new();
    let ckpt = b.checkpoint_loader(checkpoint);
    let positive = b.clip_text_encode(ckpt.slot(slots::CHECKPOINT_CLIP), prompt);
    let negative = b.clip_text_encode(ckpt.slot(slots::CHECKPOINT_CLIP), negative_prompt);
    let latent = b.empty_latent_image(1024, 1024, 1);
    let sampler = b.ksampler(SamplerParams {
        model: ckpt.slot(slots::CHECKPOINT_MODEL),
        positive: positive.output(),
        negative: negative.output(),
        latent_image: latent.output(),
        seed: 0,
        steps: 25,
        cfg: 7.0,
        sampler_name: "euler".into(),
        scheduler: "normal".into(),
        denoise: 1.0,
    });
    let decoded = b.vae_decode(sampler.output(), ckpt.slot(slots::CHECKPOINT_VAE));
    b.save_image(decoded.output(), "easel");
    b.build()
}

/// Write every artifact of `result` into `dir`, returning the paths.
///
/// Only the final path component of each engine filename is used.
pub fn write_artifacts(dir: &Path, result: &JobResult) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let mut written = Vec::with_capacity(result.images.len());
    for artifact in &result.images {
        let name = Path::new(&artifact.filename)
            .file_name()
            .with_context(|| format!("Artifact has no file name: {:?}", artifact.filename))?;
        let path = dir.join(name);
        std::fs::write(&path, &artifact.data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            bytes = artifact.data.len(),
            mime_type = %artifact.mime_type,
            "Artifact written",
        );
        written.push(path);
    }
    Ok(written)
}
