//! ComfyUI REST and WebSocket orchestration client.
//!
//! Submits job graphs to a ComfyUI-compatible engine, observes them over
//! the WebSocket progress channel or by polling history, downloads the
//! resulting artifacts, and wraps each run in a classified retry loop.

pub mod api;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod manager;
pub mod messages;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod reconnect;
pub mod retry;
