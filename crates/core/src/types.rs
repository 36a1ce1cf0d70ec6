/// Engine-assigned identifier for an accepted job.
pub type PromptId = String;

/// Identifier of a node inside a job graph (`"1"`, `"2"`, ...).
pub type NodeId = String;
