//! Typed error hierarchy for the webs service.
//!
//! Two top-level enums cover the two seams:
//! - `BridgeError` - work item lifecycle, ownership and dispatch failures
//! - `RunnerError` - transport and protocol failures talking to the
//!   external workflow runner

use thiserror::Error;

/// Errors from the status bridge and the owner-scoped resource operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Missing caller identity")]
    Unauthenticated,

    #[error("Caller does not own {kind} {id}")]
    Unauthorized { kind: &'static str, id: String },

    #[error("Work item {id} is {status}: {message}")]
    InvalidState {
        id: String,
        status: String,
        message: String,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Callback run {callback_run_id} does not match active run {active_run_id:?} for work item {id}")]
    StaleRun {
        id: String,
        callback_run_id: String,
        active_run_id: Option<String>,
    },

    #[error("Workflow runner error: {0}")]
    Upstream(#[from] RunnerError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Short machine-readable tag used in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidState { .. } => "invalid_state",
            Self::Validation(_) => "validation_error",
            Self::StaleRun { .. } => "stale_run",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn work_item_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Work item",
            id: id.to_string(),
        }
    }
}

/// Errors from the workflow runner HTTP client.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Workflow runner is not configured (set runner.base_url)")]
    NotConfigured,

    #[error("Runner request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Runner returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode runner response from {url}: {message}")]
    Decode { url: String, message: String },
}
