//! Job graph model and builder.
//!
//! A [`JobGraph`] is the small DAG of typed compute nodes submitted to the
//! engine for one generation request. It serializes to the engine's "API
//! format":
//!
//! ```json
//! {
//!   "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sdxl.safetensors" } },
//!   "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "a cat", "clip": ["1", 1] } }
//! }
//! ```
//!
//! References to another node's output are encoded as `[node_id, slot]`.
//! The builder performs no validation; malformed graphs are rejected by
//! the engine at submission time.

use std::collections::BTreeMap;

use serde::ser::{Serialize, Serializer};

use crate::error::CoreError;
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

pub const CHECKPOINT_LOADER_CLASS: &str = "CheckpointLoaderSimple";
pub const LORA_LOADER_CLASS: &str = "LoraLoader";
pub const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
pub const EMPTY_LATENT_IMAGE_CLASS: &str = "EmptyLatentImage";
pub const LOAD_IMAGE_CLASS: &str = "LoadImage";
pub const VAE_ENCODE_CLASS: &str = "VAEEncode";
pub const VAE_DECODE_CLASS: &str = "VAEDecode";
pub const KSAMPLER_CLASS: &str = "KSampler";
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

// ---------------------------------------------------------------------------
// Output slots
// ---------------------------------------------------------------------------

/// Output slot indices of the built-in node classes.
pub mod slots {
    pub const CHECKPOINT_MODEL: u32 = 0;
    pub const CHECKPOINT_CLIP: u32 = 1;
    pub const CHECKPOINT_VAE: u32 = 2;

    pub const LORA_MODEL: u32 = 0;
    pub const LORA_CLIP: u32 = 1;

    pub const LOAD_IMAGE_IMAGE: u32 = 0;
    pub const LOAD_IMAGE_MASK: u32 = 1;

    /// Single-output nodes (encoders, sampler, decoder, latent).
    pub const DEFAULT: u32 = 0;
}

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A single node input: either a literal or a link to another node's output.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput {
    Value(serde_json::Value),
    Link { node: NodeId, slot: u32 },
}

impl NodeInput {
    /// Wrap a literal value.
    pub fn value(v: impl Into<serde_json::Value>) -> Self {
        NodeInput::Value(v.into())
    }
}

impl Serialize for NodeInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NodeInput::Value(v) => v.serialize(serializer),
            NodeInput::Link { node, slot } => (node, slot).serialize(serializer),
        }
    }
}

/// Handle to a node added through [`GraphBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef(pub NodeId);

impl NodeRef {
    /// Reference one of this node's output slots.
    pub fn slot(&self, slot: u32) -> NodeInput {
        NodeInput::Link {
            node: self.0.clone(),
            slot,
        }
    }

    /// Reference the first output slot.
    pub fn output(&self) -> NodeInput {
        self.slot(slots::DEFAULT)
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// A node of the job graph.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NodeSpec {
    pub class_type: String,
    pub inputs: BTreeMap<String, NodeInput>,
}

/// The complete job specification handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct JobGraph {
    nodes: BTreeMap<NodeId, NodeSpec>,
}

/// A link whose target node does not exist in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub node: NodeId,
    pub input: String,
    pub target: NodeId,
}

impl JobGraph {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeSpec)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parse an API-format workflow document.
    ///
    /// Two-element arrays whose first element is a node id (string or
    /// integer) and whose second is an integer are read as links; every
    /// other input is kept as a literal.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

        if obj.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        let mut nodes = BTreeMap::new();
        for (node_id, node_value) in obj {
            let class_type = node_value
                .get("class_type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    CoreError::Validation(format!(
                        "Node '{node_id}' is missing required 'class_type' field"
                    ))
                })?
                .to_string();

            let mut inputs = BTreeMap::new();
            if let Some(input_obj) = node_value.get("inputs").and_then(|v| v.as_object()) {
                for (name, value) in input_obj {
                    inputs.insert(name.clone(), parse_input(value));
                }
            }

            nodes.insert(node_id.clone(), NodeSpec { class_type, inputs });
        }

        Ok(Self { nodes })
    }

    /// Links that point at node ids missing from the graph.
    ///
    /// Diagnostic only: submission does not reject such graphs, the engine
    /// reports them as node errors.
    pub fn dangling_references(&self) -> Vec<DanglingReference> {
        let mut dangling = Vec::new();
        for (id, spec) in &self.nodes {
            for (name, input) in &spec.inputs {
                if let NodeInput::Link { node, .. } = input {
                    if !self.nodes.contains_key(node) {
                        dangling.push(DanglingReference {
                            node: id.clone(),
                            input: name.clone(),
                            target: node.clone(),
                        });
                    }
                }
            }
        }
        dangling
    }
}

fn parse_input(value: &serde_json::Value) -> NodeInput {
    if let Some([source, slot]) = value.as_array().map(Vec::as_slice) {
        let node = source
            .as_str()
            .map(str::to_string)
            .or_else(|| source.as_u64().map(|n| n.to_string()));
        let slot = slot.as_u64().and_then(|s| u32::try_from(s).ok());
        if let (Some(node), Some(slot)) = (node, slot) {
            return NodeInput::Link { node, slot };
        }
    }
    NodeInput::Value(value.clone())
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Sampler settings for [`GraphBuilder::ksampler`].
#[derive(Debug, Clone)]
pub struct SamplerParams {
    pub model: NodeInput,
    pub positive: NodeInput,
    pub negative: NodeInput,
    pub latent_image: NodeInput,
    pub seed: u64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub denoise: f64,
}

/// Accumulates nodes with auto-incrementing ids.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    next_id: u32,
    nodes: BTreeMap<NodeId, NodeSpec>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node of any class and return its handle.
    pub fn add_node<'a, I>(&mut self, class_type: &str, inputs: I) -> NodeRef
    where
        I: IntoIterator<Item = (&'a str, NodeInput)>,
    {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let inputs = inputs
            .into_iter()
            .map(|(name, input)| (name.to_string(), input))
            .collect();
        self.nodes.insert(
            id.clone(),
            NodeSpec {
                class_type: class_type.to_string(),
                inputs,
            },
        );
        NodeRef(id)
    }

    /// Outputs: MODEL, CLIP, VAE (see [`slots`]).
    pub fn checkpoint_loader(&mut self, ckpt_name: &str) -> NodeRef {
        self.add_node(
            CHECKPOINT_LOADER_CLASS,
            [("ckpt_name", NodeInput::value(ckpt_name))],
        )
    }

    /// Outputs: MODEL, CLIP.
    pub fn lora_loader(
        &mut self,
        model: NodeInput,
        clip: NodeInput,
        lora_name: &str,
        strength_model: f64,
        strength_clip: f64,
    ) -> NodeRef {
        self.add_node(
            LORA_LOADER_CLASS,
            [
                ("model", model),
                ("clip", clip),
                ("lora_name", NodeInput::value(lora_name)),
                ("strength_model", NodeInput::value(strength_model)),
                ("strength_clip", NodeInput::value(strength_clip)),
            ],
        )
    }

    pub fn clip_text_encode(&mut self, clip: NodeInput, text: &str) -> NodeRef {
        self.add_node(
            CLIP_TEXT_ENCODE_CLASS,
            [("clip", clip), ("text", NodeInput::value(text))],
        )
    }

    pub fn empty_latent_image(&mut self, width: u32, height: u32, batch_size: u32) -> NodeRef {
        self.add_node(
            EMPTY_LATENT_IMAGE_CLASS,
            [
                ("width", NodeInput::value(width)),
                ("height", NodeInput::value(height)),
                ("batch_size", NodeInput::value(batch_size)),
            ],
        )
    }

    /// Load an image previously uploaded to the engine's input folder.
    pub fn load_image(&mut self, image: &str) -> NodeRef {
        self.add_node(LOAD_IMAGE_CLASS, [("image", NodeInput::value(image))])
    }

    pub fn vae_encode(&mut self, pixels: NodeInput, vae: NodeInput) -> NodeRef {
        self.add_node(VAE_ENCODE_CLASS, [("pixels", pixels), ("vae", vae)])
    }

    pub fn ksampler(&mut self, params: SamplerParams) -> NodeRef {
        self.add_node(
            KSAMPLER_CLASS,
            [
                ("model", params.model),
                ("positive", params.positive),
                ("negative", params.negative),
                ("latent_image", params.latent_image),
                ("seed", NodeInput::value(params.seed)),
                ("steps", NodeInput::value(params.steps)),
                ("cfg", NodeInput::value(params.cfg)),
                ("sampler_name", NodeInput::value(params.sampler_name)),
                ("scheduler", NodeInput::value(params.scheduler)),
                ("denoise", NodeInput::value(params.denoise)),
            ],
        )
    }

    pub fn vae_decode(&mut self, samples: NodeInput, vae: NodeInput) -> NodeRef {
        self.add_node(VAE_DECODE_CLASS, [("samples", samples), ("vae", vae)])
    }

    pub fn save_image(&mut self, images: NodeInput, filename_prefix: &str) -> NodeRef {
        self.add_node(
            SAVE_IMAGE_CLASS,
            [
                ("images", images),
                ("filename_prefix", NodeInput::value(filename_prefix)),
            ],
        )
    }

    pub fn build(self) -> JobGraph {
        JobGraph { nodes: self.nodes }
    }
}
