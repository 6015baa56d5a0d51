//! Typed error hierarchy for the bridge.
//!
//! Two enums cover the failures the orchestrator branches on:
//! - `AgentApiError` — remote coding-agent service call outcomes
//! - `MergeError` — trunk-merge failures (conflicts are non-retryable)

use thiserror::Error;

/// Errors from the remote coding-agent service client.
///
/// The creation endpoint distinguishes auth, permission, and payload
/// rejections so the dispatch path can report them precisely; everything
/// else collapses into `Api` (unexpected status) or `Network`.
#[derive(Debug, Error)]
pub enum AgentApiError {
    #[error("authentication failed (401): check the agent service API key")]
    Auth,

    #[error("permission denied (403): plan may not support remote agents, or the repository is not accessible")]
    Permission,

    #[error("bad request (400): {0}")]
    BadRequest(String),

    #[error("agent service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("agent service request failed: {0}")]
    Network(String),

    #[error("no usable repository remote: {0}")]
    Repository(String),

    #[error("failed to parse agent service response: {0}")]
    Parse(String),
}

/// Errors from the merge-to-trunk sequence.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The merge produced conflicts. Requires manual resolution; the
    /// orchestrator treats this as terminal for the task, never retried.
    #[error("merge conflict merging {branch}: manual resolution required")]
    Conflict { branch: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
