//! Failure taxonomy for engine calls.
//!
//! Provides heuristic error categorization, retry eligibility, capped
//! exponential backoff, and advisory fallback strategies. Classification
//! is a pure function over the lower-cased error text; the keyword tables
//! below drive retry behavior downstream and must stay stable.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Base delay for the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Upper bound on any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(16_000);

/// Signals that the job itself is malformed (need `workflow` plus one of these).
const FATAL_QUALIFIERS: &[&str] = &["invalid", "validation"];

const RECOVERABLE_SIGNALS: &[&str] = &["node timeout", "execution timeout"];

const TRANSIENT_SIGNALS: &[&str] = &[
    "network",
    "timeout",
    "econnrefused",
    "etimedout",
    "fetch failed",
    "network error",
    "500",
    "502",
    "503",
    "504",
];

const PERMANENT_SIGNALS: &[&str] = &["400", "401", "403", "404", "422", "validation"];

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Infrastructure hiccup; retry.
    Transient,
    /// Caller or request fault; never retry.
    Permanent,
    /// Engine-side execution stall; retry like transient.
    Recoverable,
    /// Malformed job; fail fast.
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Recoverable => "recoverable",
            ErrorCategory::Fatal => "fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Recoverable)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FallbackStrategy
// ---------------------------------------------------------------------------

/// Named degradation path suggested for a failure. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Drop the push channel and observe via polling.
    WebsocketToRest,
    /// Switch to a secondary model or checkpoint.
    PrimaryToSecondary,
    /// Submit a simpler workflow.
    OptimizedToSimple,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::WebsocketToRest => "websocket_to_rest",
            FallbackStrategy::PrimaryToSecondary => "primary_to_secondary",
            FallbackStrategy::OptimizedToSimple => "optimized_to_simple",
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Categorize an error from its text (type name and message).
///
/// Checked from most to least specific: fatal, recoverable, transient,
/// permanent. Text matching nothing is treated as transient.
pub fn categorize(error_text: &str) -> ErrorCategory {
    let text = error_text.to_lowercase();

    if text.contains("workflow") && contains_any(&text, FATAL_QUALIFIERS) {
        return ErrorCategory::Fatal;
    }
    if contains_any(&text, RECOVERABLE_SIGNALS) {
        return ErrorCategory::Recoverable;
    }
    if contains_any(&text, TRANSIENT_SIGNALS) {
        return ErrorCategory::Transient;
    }
    if contains_any(&text, PERMANENT_SIGNALS) {
        return ErrorCategory::Permanent;
    }
    ErrorCategory::Transient
}

/// Whether an error with this text should be retried.
pub fn should_retry(error_text: &str) -> bool {
    categorize(error_text).is_retryable()
}

/// Delay before the retry that follows `attempt` (1-based).
///
/// `min(base * 2^(attempt - 1), cap)`, rounded to whole milliseconds.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 2f64.powi(exponent as i32);
    let ms = (base.as_millis() as f64 * factor).round();
    let capped = ms.min(cap.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// [`backoff_delay`] with the default base (1s) and cap (16s).
pub fn default_backoff_delay(attempt: u32) -> Duration {
    backoff_delay(attempt, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
}

/// Suggest a degradation path for an error, if any keyword applies.
pub fn fallback_strategy(error_text: &str) -> Option<FallbackStrategy> {
    let text = error_text.to_lowercase();

    if contains_any(&text, &["websocket", "ws"]) {
        Some(FallbackStrategy::WebsocketToRest)
    } else if contains_any(&text, &["model", "checkpoint"]) {
        Some(FallbackStrategy::PrimaryToSecondary)
    } else if contains_any(&text, &["workflow", "node"]) {
        Some(FallbackStrategy::OptimizedToSimple)
    } else {
        None
    }
}
