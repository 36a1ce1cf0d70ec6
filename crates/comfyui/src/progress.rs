//! Per-prompt progress tracking and handler dispatch.
//!
//! [`ProgressTracker`] owns one record per prompt id a caller registered
//! interest in. Each record holds the throttle state and at most one
//! handler of each kind (progress, completion, error); registering again
//! replaces the previous handler. Records are dropped as soon as the
//! completion or error handler fires.
//!
//! A terminal frame for a prompt nobody tracks yet (a cached run can
//! finish before its submitter registers) is held in a small buffer and
//! delivered when the matching handler is registered.
//!
//! Handling a message never invokes handlers directly: it returns
//! [`Dispatch`] values the caller fires after releasing any lock around
//! the tracker, so a handler may safely register new handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use easel_core::types::PromptId;

use crate::messages::{ComfyUIMessage, NodeProgress};

/// Minimum interval between two emissions of an unchanged percentage.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(1_000);

/// Terminal frames held for prompts with no registered handlers yet.
pub const UNCLAIMED_CAPACITY: usize = 64;

/// Called with the overall percentage (0-100).
pub type ProgressHandler = Arc<dyn Fn(u8) + Send + Sync>;

/// Called once with the completion signal.
pub type CompletionHandler = Box<dyn FnOnce(CompletionSignal) + Send>;

/// Called once with `"{exception_type}: {exception_message}"`.
pub type ErrorHandler = Box<dyn FnOnce(String) + Send>;

/// Completion observed on the push channel.
///
/// Carries the node's raw output (file references only); artifact bytes
/// must be fetched over REST.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    pub prompt_id: PromptId,
    pub node: String,
    pub output: serde_json::Value,
}

/// A handler invocation produced by [`ProgressTracker::handle_message`].
pub enum Dispatch {
    Progress(ProgressHandler, u8),
    Completed(CompletionHandler, CompletionSignal),
    Failed(ErrorHandler, String),
}

impl Dispatch {
    pub fn fire(self) {
        match self {
            Dispatch::Progress(handler, percent) => handler(percent),
            Dispatch::Completed(handler, signal) => handler(signal),
            Dispatch::Failed(handler, message) => handler(message),
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Progress(_, percent) => f.debug_tuple("Progress").field(percent).finish(),
            Dispatch::Completed(_, signal) => f.debug_tuple("Completed").field(signal).finish(),
            Dispatch::Failed(_, message) => f.debug_tuple("Failed").field(message).finish(),
        }
    }
}

/// Terminal outcome seen before any handler was registered.
#[derive(Debug)]
enum Unclaimed {
    Completed(CompletionSignal),
    Failed(String),
}

#[derive(Default)]
struct ProgressRecord {
    last_percent: Option<u8>,
    last_emitted_at: Option<Instant>,
    on_progress: Option<ProgressHandler>,
    on_completion: Option<CompletionHandler>,
    on_error: Option<ErrorHandler>,
}

/// Overall percentage across nodes: `round(sum(value) / sum(max) * 100)`,
/// clamped to `[0, 100]`. Zero total work reports 0.
pub fn overall_percent<'a>(nodes: impl IntoIterator<Item = &'a NodeProgress>) -> u8 {
    let (value, max) = nodes
        .into_iter()
        .fold((0.0_f64, 0.0_f64), |(v, m), node| (v + node.value, m + node.max));
    if max <= 0.0 || !value.is_finite() || !max.is_finite() {
        return 0;
    }
    (value / max * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Handler registry and throttle state, keyed by prompt id.
pub struct ProgressTracker {
    records: HashMap<PromptId, ProgressRecord>,
    /// Oldest first; bounded by [`UNCLAIMED_CAPACITY`].
    unclaimed: VecDeque<(PromptId, Unclaimed)>,
    throttle: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_throttle(PROGRESS_THROTTLE)
    }

    pub fn with_throttle(throttle: Duration) -> Self {
        Self {
            records: HashMap::new(),
            unclaimed: VecDeque::new(),
            throttle,
        }
    }

    pub fn on_progress(&mut self, prompt_id: &str, handler: ProgressHandler) {
        self.record(prompt_id).on_progress = Some(handler);
    }

    /// Register the completion handler. If the prompt already completed
    /// while untracked, the record is consumed and the returned dispatch
    /// must be fired by the caller.
    pub fn on_completion(
        &mut self,
        prompt_id: &str,
        handler: CompletionHandler,
    ) -> Option<Dispatch> {
        let claimed = self.claim(prompt_id, |u| matches!(u, Unclaimed::Completed(_)));
        if let Some(Unclaimed::Completed(signal)) = claimed {
            self.records.remove(prompt_id);
            return Some(Dispatch::Completed(handler, signal));
        }
        self.record(prompt_id).on_completion = Some(handler);
        None
    }

    /// Register the error handler; see [`ProgressTracker::on_completion`].
    pub fn on_error(&mut self, prompt_id: &str, handler: ErrorHandler) -> Option<Dispatch> {
        let claimed = self.claim(prompt_id, |u| matches!(u, Unclaimed::Failed(_)));
        if let Some(Unclaimed::Failed(message)) = claimed {
            self.records.remove(prompt_id);
            return Some(Dispatch::Failed(handler, message));
        }
        self.record(prompt_id).on_error = Some(handler);
        None
    }

    /// Drop every handler and buffered frame for a prompt.
    pub fn clear(&mut self, prompt_id: &str) {
        self.records.remove(prompt_id);
        self.unclaimed.retain(|(id, _)| id != prompt_id);
    }

    pub fn is_tracking(&self, prompt_id: &str) -> bool {
        self.records.contains_key(prompt_id)
    }

    /// Number of prompts with registered handlers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Interpret one message at the current instant.
    pub fn handle_message(&mut self, msg: &ComfyUIMessage) -> Vec<Dispatch> {
        self.handle_message_at(msg, Instant::now())
    }

    /// Interpret one message as if received at `now`.
    pub fn handle_message_at(&mut self, msg: &ComfyUIMessage, now: Instant) -> Vec<Dispatch> {
        match msg {
            ComfyUIMessage::ProgressState(data) => {
                let percent = overall_percent(data.nodes.values());
                self.progress(&data.prompt_id, percent, now)
                    .into_iter()
                    .collect()
            }
            ComfyUIMessage::Executed(data) if data.has_media() => {
                tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, "Completion signal");
                let signal = CompletionSignal {
                    prompt_id: data.prompt_id.clone(),
                    node: data.node.clone(),
                    output: data.output.clone(),
                };
                let Some(record) = self.records.remove(&data.prompt_id) else {
                    self.hold(&data.prompt_id, Unclaimed::Completed(signal));
                    return Vec::new();
                };
                record
                    .on_completion
                    .map(|handler| Dispatch::Completed(handler, signal))
                    .into_iter()
                    .collect()
            }
            ComfyUIMessage::ExecutionError(data) => {
                let message = data.describe();
                tracing::warn!(
                    prompt_id = %data.prompt_id,
                    node_id = ?data.node_id,
                    error = %message,
                    "Execution error",
                );
                let Some(record) = self.records.remove(&data.prompt_id) else {
                    self.hold(&data.prompt_id, Unclaimed::Failed(message));
                    return Vec::new();
                };
                record
                    .on_error
                    .map(|handler| Dispatch::Failed(handler, message))
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn record(&mut self, prompt_id: &str) -> &mut ProgressRecord {
        self.records.entry(prompt_id.to_string()).or_default()
    }

    fn hold(&mut self, prompt_id: &str, outcome: Unclaimed) {
        if self.unclaimed.len() >= UNCLAIMED_CAPACITY {
            self.unclaimed.pop_front();
        }
        self.unclaimed.push_back((prompt_id.to_string(), outcome));
    }

    fn claim(
        &mut self,
        prompt_id: &str,
        wanted: impl Fn(&Unclaimed) -> bool,
    ) -> Option<Unclaimed> {
        let index = self
            .unclaimed
            .iter()
            .position(|(id, outcome)| id == prompt_id && wanted(outcome))?;
        self.unclaimed.remove(index).map(|(_, outcome)| outcome)
    }

    fn progress(&mut self, prompt_id: &str, percent: u8, now: Instant) -> Option<Dispatch> {
        let throttle = self.throttle;
        let record = self.records.get_mut(prompt_id)?;
        let handler = record.on_progress.clone()?;

        let changed = record.last_percent != Some(percent);
        let stale = record
            .last_emitted_at
            .map_or(true, |at| now.saturating_duration_since(at) >= throttle);
        if !changed && !stale {
            return None;
        }

        record.last_percent = Some(percent);
        record.last_emitted_at = Some(now);
        Some(Dispatch::Progress(handler, percent))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::messages::parse_message;

    use super::*;

    fn progress_frame(prompt_id: &str, nodes: &[(f64, f64)]) -> ComfyUIMessage {
        let nodes: serde_json::Map<String, serde_json::Value> = nodes
            .iter()
            .enumerate()
            .map(|(i, (value, max))| {
                (
                    i.to_string(),
                    serde_json::json!({ "value": value, "max": max }),
                )
            })
            .collect();
        let text = serde_json::json!({
            "type": "progress_state",
            "data": { "prompt_id": prompt_id, "nodes": nodes }
        })
        .to_string();
        parse_message(&text).unwrap()
    }

    fn executed_frame(prompt_id: &str) -> ComfyUIMessage {
        let text = serde_json::json!({
            "type": "executed",
            "data": { "node": "9", "prompt_id": prompt_id,
                      "output": { "images": [{ "filename": "a.png", "subfolder": "", "type": "output" }] } }
        })
        .to_string();
        parse_message(&text).unwrap()
    }

    fn error_frame(prompt_id: &str) -> ComfyUIMessage {
        let text = serde_json::json!({
            "type": "execution_error",
            "data": { "prompt_id": prompt_id, "node_id": "3",
                      "exception_type": "RuntimeError", "exception_message": "boom" }
        })
        .to_string();
        parse_message(&text).unwrap()
    }

    fn recording_handler() -> (ProgressHandler, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ProgressHandler = Arc::new(move |p| sink.lock().unwrap().push(p));
        (handler, seen)
    }

    fn fire_all(dispatches: Vec<Dispatch>) {
        dispatches.into_iter().for_each(Dispatch::fire);
    }

    #[test]
    fn overall_percent_sums_across_nodes() {
        let nodes = [
            NodeProgress { value: 5.0, max: 20.0, state: None },
            NodeProgress { value: 1.0, max: 1.0, state: None },
        ];
        // 6 / 21 = 28.57%
        assert_eq!(overall_percent(nodes.iter()), 29);
    }

    #[test]
    fn overall_percent_is_clamped() {
        let over = [NodeProgress { value: 30.0, max: 20.0, state: None }];
        assert_eq!(overall_percent(over.iter()), 100);

        let negative = [NodeProgress { value: -5.0, max: 20.0, state: None }];
        assert_eq!(overall_percent(negative.iter()), 0);

        let empty: [NodeProgress; 0] = [];
        assert_eq!(overall_percent(empty.iter()), 0);
    }

    #[test]
    fn progress_emits_on_change_and_throttles_repeats() {
        let mut tracker = ProgressTracker::new();
        let (handler, seen) = recording_handler();
        tracker.on_progress("p1", handler);

        let t0 = Instant::now();
        fire_all(tracker.handle_message_at(&progress_frame("p1", &[(5.0, 20.0)]), t0));
        // Same value within the throttle window: suppressed.
        fire_all(tracker.handle_message_at(
            &progress_frame("p1", &[(5.0, 20.0)]),
            t0 + Duration::from_millis(200),
        ));
        // Changed value: emitted immediately.
        fire_all(tracker.handle_message_at(
            &progress_frame("p1", &[(10.0, 20.0)]),
            t0 + Duration::from_millis(300),
        ));
        // Same value after the throttle window: emitted again.
        fire_all(tracker.handle_message_at(
            &progress_frame("p1", &[(10.0, 20.0)]),
            t0 + Duration::from_millis(1_400),
        ));

        assert_eq!(*seen.lock().unwrap(), vec![25, 50, 50]);
    }

    #[test]
    fn progress_over_max_is_clamped_when_emitted() {
        let mut tracker = ProgressTracker::new();
        let (handler, seen) = recording_handler();
        tracker.on_progress("p1", handler);

        fire_all(tracker.handle_message(&progress_frame("p1", &[(25.0, 20.0)])));
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn progress_for_unregistered_prompt_is_ignored() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker
            .handle_message(&progress_frame("other", &[(1.0, 2.0)]))
            .is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn last_registration_wins() {
        let mut tracker = ProgressTracker::new();
        let (first, first_seen) = recording_handler();
        let (second, second_seen) = recording_handler();
        tracker.on_progress("p1", first);
        tracker.on_progress("p1", second);

        fire_all(tracker.handle_message(&progress_frame("p1", &[(1.0, 4.0)])));
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec![25]);
    }

    #[test]
    fn completion_fires_once_and_clears_all_slots() {
        let mut tracker = ProgressTracker::new();
        let (handler, _) = recording_handler();
        let completed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&completed);
        tracker.on_progress("p1", handler);
        tracker.on_completion(
            "p1",
            Box::new(move |signal| *sink.lock().unwrap() = Some(signal.node)),
        );
        tracker.on_error("p1", Box::new(|_| panic!("error handler must not fire")));

        fire_all(tracker.handle_message(&executed_frame("p1")));
        assert_eq!(completed.lock().unwrap().as_deref(), Some("9"));
        assert!(!tracker.is_tracking("p1"));

        // A second completion frame finds nothing to fire.
        assert!(tracker.handle_message(&executed_frame("p1")).is_empty());
    }

    #[test]
    fn error_formats_message_and_clears_slots() {
        let mut tracker = ProgressTracker::new();
        let failed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&failed);
        tracker.on_completion("p1", Box::new(|_| panic!("completion must not fire")));
        tracker.on_error("p1", Box::new(move |msg| *sink.lock().unwrap() = Some(msg)));

        fire_all(tracker.handle_message(&error_frame("p1")));
        assert_eq!(failed.lock().unwrap().as_deref(), Some("RuntimeError: boom"));
        assert!(!tracker.is_tracking("p1"));
    }

    #[test]
    fn error_without_error_handler_still_clears_record() {
        let mut tracker = ProgressTracker::new();
        let (handler, _) = recording_handler();
        tracker.on_progress("p1", handler);

        assert!(tracker.handle_message(&error_frame("p1")).is_empty());
        assert!(!tracker.is_tracking("p1"));
    }

    #[test]
    fn prompts_do_not_interfere() {
        let mut tracker = ProgressTracker::new();
        let (a, a_seen) = recording_handler();
        let (b, b_seen) = recording_handler();
        tracker.on_progress("a", a);
        tracker.on_progress("b", b);

        fire_all(tracker.handle_message(&progress_frame("a", &[(1.0, 2.0)])));
        fire_all(tracker.handle_message(&error_frame("b")));

        assert_eq!(*a_seen.lock().unwrap(), vec![50]);
        assert!(b_seen.lock().unwrap().is_empty());
        assert!(tracker.is_tracking("a"));
        assert!(!tracker.is_tracking("b"));
    }

    #[test]
    fn completion_before_registration_is_delivered_on_register() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.handle_message(&executed_frame("p1")).is_empty());

        let (handler, _) = recording_handler();
        tracker.on_progress("p1", handler);
        let dispatch = tracker.on_completion("p1", Box::new(|_| {}));

        assert!(matches!(dispatch, Some(Dispatch::Completed(_, ref s)) if s.node == "9"));
        assert!(!tracker.is_tracking("p1"));
        // Claimed once only.
        assert!(tracker.on_completion("p1", Box::new(|_| {})).is_none());
    }

    #[test]
    fn early_error_waits_for_error_handler() {
        let mut tracker = ProgressTracker::new();
        tracker.handle_message(&error_frame("p1"));

        assert!(tracker.on_completion("p1", Box::new(|_| {})).is_none());
        let dispatch = tracker.on_error("p1", Box::new(|_| {}));

        assert!(matches!(dispatch, Some(Dispatch::Failed(_, ref m)) if m == "RuntimeError: boom"));
        assert!(!tracker.is_tracking("p1"));
    }

    #[test]
    fn clear_discards_unclaimed_frames() {
        let mut tracker = ProgressTracker::new();
        tracker.handle_message(&executed_frame("p1"));
        tracker.clear("p1");
        assert!(tracker.on_completion("p1", Box::new(|_| {})).is_none());
    }

    #[test]
    fn unclaimed_buffer_drops_oldest() {
        let mut tracker = ProgressTracker::new();
        for i in 0..=UNCLAIMED_CAPACITY {
            tracker.handle_message(&executed_frame(&format!("p{i}")));
        }
        assert!(tracker.on_completion("p0", Box::new(|_| {})).is_none());
        let newest = format!("p{UNCLAIMED_CAPACITY}");
        assert!(tracker.on_completion(&newest, Box::new(|_| {})).is_some());
    }
}
