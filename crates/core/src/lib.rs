//! Domain logic for the Easel generation client.
//!
//! Everything in this crate is pure (no I/O): job graph construction,
//! job status and artifact types, and the failure taxonomy used by the
//! retry layer in `easel-comfyui`.

pub mod error;
pub mod error_classification;
pub mod job;
pub mod types;
pub mod workflow_graph;
