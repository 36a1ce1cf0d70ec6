//! Shared fixtures: a scripted engine backend and a local WebSocket
//! server standing in for the engine's progress channel.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use easel_comfyui::api::ComfyUIApiError;
use easel_comfyui::backend::EngineBackend;
use easel_comfyui::retry::HealthProbe;
use easel_core::job::{mime_type_for, Artifact, JobResult};
use easel_core::types::PromptId;
use easel_core::workflow_graph::{GraphBuilder, JobGraph, NodeInput};
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Prompt id of the first submission; later ones count up.
pub const PROMPT_ID: &str = "prompt-1";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// One sampler node feeding one saver node.
pub fn sampler_and_saver() -> JobGraph {
    let mut b = GraphBuilder::new();
    let sampler = b.add_node(
        "KSampler",
        [("seed", NodeInput::value(42)), ("steps", NodeInput::value(20))],
    );
    b.save_image(sampler.output(), "easel");
    b.build()
}

pub fn png(name: &str) -> Artifact {
    Artifact {
        filename: name.into(),
        subfolder: String::new(),
        kind: "output".into(),
        mime_type: mime_type_for(name).into(),
        data: vec![0x89, b'P', b'N', b'G'],
    }
}

pub fn completed_with_one_image() -> JobResult {
    JobResult::completed(PROMPT_ID, vec![png("easel_00001_.png")])
}

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// Scripted engine: submissions get ids `prompt-1`, `prompt-2`, ...;
/// `poll_status` walks through `statuses`, repeating the last one once
/// the script runs out, under whichever prompt id was asked for.
pub struct FakeBackend {
    base_url: String,
    pub healthy: AtomicBool,
    /// `client_id` passed to each submission.
    pub submits: Mutex<Vec<Option<String>>>,
    pub polls: AtomicU32,
    statuses: Mutex<VecDeque<JobResult>>,
    /// Leading poll calls that fail with a 503.
    failing_polls: AtomicU32,
    /// Leading submit calls that fail with a 503.
    failing_submits: AtomicU32,
    /// Notified after every successful submission.
    pub submitted: Notify,
    /// Pause between accepting a submission and returning its id.
    submit_delay: Duration,
}

impl FakeBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            healthy: AtomicBool::new(true),
            submits: Mutex::new(Vec::new()),
            polls: AtomicU32::new(0),
            statuses: Mutex::new(VecDeque::new()),
            failing_polls: AtomicU32::new(0),
            failing_submits: AtomicU32::new(0),
            submitted: Notify::new(),
            submit_delay: Duration::ZERO,
        }
    }

    pub fn with_statuses(self, statuses: Vec<JobResult>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_failing_polls(self, count: u32) -> Self {
        self.failing_polls.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_failing_submits(self, count: u32) -> Self {
        self.failing_submits.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

fn unavailable() -> ComfyUIApiError {
    ComfyUIApiError::ApiError {
        status: 503,
        body: "Service Unavailable".into(),
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl HealthProbe for FakeBackend {
    async fn is_healthy(&self, _base_url: &str) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineBackend for FakeBackend {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn submit(
        &self,
        _graph: &JobGraph,
        client_id: Option<&str>,
    ) -> Result<PromptId, ComfyUIApiError> {
        if take_failure(&self.failing_submits) {
            return Err(unavailable());
        }
        let count = {
            let mut submits = self.submits.lock().unwrap();
            submits.push(client_id.map(str::to_string));
            submits.len()
        };
        self.submitted.notify_one();
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        Ok(format!("prompt-{count}"))
    }

    async fn poll_status(&self, prompt_id: &str) -> Result<JobResult, ComfyUIApiError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_polls) {
            return Err(unavailable());
        }
        let mut statuses = self.statuses.lock().unwrap();
        let next = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        let mut result = next.unwrap_or_else(|| JobResult::processing(prompt_id));
        result.prompt_id = prompt_id.to_string();
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Local progress channel server
// ---------------------------------------------------------------------------

enum ServerCommand {
    Frame(String),
    CloseConnection,
    StopAccepting,
}

enum ServerEvent {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Command(Option<ServerCommand>),
}

/// A WebSocket server accepting any number of connections. Frames are
/// written to the most recently accepted connection. Client frames are
/// never read.
#[derive(Clone)]
pub struct ChannelServer {
    pub base_url: String,
    pub accepted: Arc<AtomicU32>,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ChannelServer {
    /// Write a text frame to the current connection.
    pub fn send(&self, frame: String) {
        self.commands.send(ServerCommand::Frame(frame)).unwrap();
    }

    /// Close the current connection with a Close frame.
    pub fn close_connection(&self) {
        self.commands.send(ServerCommand::CloseConnection).unwrap();
    }

    /// Drop the listener; later connection attempts are refused.
    pub fn stop_accepting(&self) {
        self.commands.send(ServerCommand::StopAccepting).unwrap();
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

pub async fn spawn_channel_server() -> ChannelServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (commands, mut command_rx) = mpsc::unbounded_channel::<ServerCommand>();
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        let mut listener = Some(listener);
        let mut current: Option<WebSocketStream<TcpStream>> = None;
        loop {
            let event = tokio::select! {
                conn = accept(listener.as_ref()) => ServerEvent::Accepted(conn),
                command = command_rx.recv() => ServerEvent::Command(command),
            };
            match event {
                ServerEvent::Accepted(Ok((stream, _))) => {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { continue };
                    counter.fetch_add(1, Ordering::SeqCst);
                    current = Some(ws);
                }
                ServerEvent::Accepted(Err(_)) | ServerEvent::Command(None) => return,
                ServerEvent::Command(Some(ServerCommand::Frame(frame))) => {
                    if let Some(ws) = current.as_mut() {
                        let _ = ws.send(Message::Text(frame)).await;
                    }
                }
                ServerEvent::Command(Some(ServerCommand::CloseConnection)) => {
                    if let Some(mut ws) = current.take() {
                        let _ = ws.close(None).await;
                    }
                }
                ServerEvent::Command(Some(ServerCommand::StopAccepting)) => listener = None,
            }
        }
    });

    ChannelServer {
        base_url: format!("http://{addr}"),
        accepted,
        commands,
    }
}

pub fn progress_state_frame(prompt_id: &str, value: u32, max: u32) -> String {
    format!(
        r#"{{"type":"progress_state","data":{{"prompt_id":"{prompt_id}","nodes":{{"1":{{"value":{value},"max":{max},"state":"running"}}}}}}}}"#
    )
}

pub fn executed_frame(prompt_id: &str) -> String {
    format!(
        r#"{{"type":"executed","data":{{"node":"2","prompt_id":"{prompt_id}","output":{{"images":[{{"filename":"easel_00001_.png","subfolder":"","type":"output"}}]}}}}}}"#
    )
}

pub fn execution_error_frame(prompt_id: &str) -> String {
    format!(
        r#"{{"type":"execution_error","data":{{"prompt_id":"{prompt_id}","node_id":"1","exception_message":"CUDA out of memory","exception_type":"torch.OutOfMemoryError"}}}}"#
    )
}
