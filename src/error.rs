//! Error types for graph construction, chunking, backend calls and runs.
//!
//! Construction errors ([`GraphError`]) are raised before anything executes.
//! Everything that goes wrong during a run is reported as a [`RunError`],
//! which names the failing node and carries the underlying cause.

use std::time::Duration;
use thiserror::Error;

/// Failures while building a [`crate::graph::WorkflowGraph`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("workflow declares no agents")]
    EmptyGraph,

    #[error("duplicate agent name: {0}")]
    DuplicateNodeName(String),

    #[error("agent '{node}' depends on unknown agent '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("agent '{0}' needs either a prompt or an objective")]
    MissingPrompt(String),

    #[error("output key '{key}' is produced by both '{first}' and '{second}'")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("agent '{0}' uses the reserved output key 'input'")]
    ReservedOutputKey(String),

    #[error("agent '{node}' references '{{{placeholder}}}' which is neither 'input' nor a declared dependency")]
    UndeclaredPlaceholder { node: String, placeholder: String },

    #[error("agent '{node}' writes its artifact outside the output directory: '{path}'")]
    ArtifactOutsideOutputDir { node: String, path: String },

    #[error("artifact '{path}' is written by both '{first}' and '{second}'")]
    DuplicateArtifact {
        path: String,
        first: String,
        second: String,
    },

    #[error("invalid workflow description: {0}")]
    Parse(String),
}

/// Failures of the text chunker, reported before any backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("budget of {budget} units is smaller than a single character")]
    BudgetTooSmall { budget: usize },

    #[error("overlap of {overlap} units must be smaller than the budget of {budget} units")]
    OverlapTooLarge { overlap: usize, budget: usize },

    #[error("prompt scaffold needs {scaffold} units, leaving no room within the {budget} unit budget")]
    ScaffoldExceedsBudget { scaffold: usize, budget: usize },
}

/// Failures of a single backend invocation.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("backend misconfigured: {0}")]
    Configuration(String),
}

impl BackendError {
    /// Whether the retry policy may try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited { .. } | BackendError::Unavailable(_)
        )
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Authentication(_) => "authentication",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::Unavailable(_) => "unavailable",
            BackendError::MalformedResponse(_) => "malformed_response",
            BackendError::InvalidRequest(_) => "invalid_request",
            BackendError::Configuration(_) => "configuration",
        }
    }

    /// Map an HTTP status plus response body to an error kind.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = format!("HTTP {}: {}", status, preview(body));
        match status {
            401 | 403 => BackendError::Authentication(message),
            429 => BackendError::RateLimited {
                message,
                retry_after,
            },
            408 | 500..=599 => BackendError::Unavailable(message),
            _ => BackendError::InvalidRequest(message),
        }
    }

    /// Map a transport-level `reqwest` failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Unavailable(format!("request timed out: {}", err))
        } else if err.is_connect() {
            BackendError::Unavailable(format!("connection failed: {}", err))
        } else if err.is_decode() {
            BackendError::MalformedResponse(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

const BODY_PREVIEW_LIMIT: usize = 300;

fn preview(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return "<empty body>".to_string();
    }
    match body.char_indices().nth(BODY_PREVIEW_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Why a node could not produce its output.
#[derive(Error, Debug, Clone)]
pub enum NodeFailure {
    #[error("{0} ({kind})", kind = .0.kind())]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    #[error("no output recorded for upstream key '{0}'")]
    UnresolvedDependency(String),

    #[error("output key '{0}' was already recorded")]
    OutputAlreadyRecorded(String),

    #[error("prompt needs {units} units but the budget is {budget}; enable chunking or truncation")]
    InputTooLarge { units: usize, budget: usize },
}

/// A node failure attributed to the node that raised it.
#[derive(Error, Debug, Clone)]
#[error("agent '{node}' failed: {cause}")]
pub struct NodeExecutionError {
    pub node: String,
    #[source]
    pub cause: NodeFailure,
}

/// Outcome of a failed or aborted run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    NodeFailed(#[from] NodeExecutionError),

    #[error("run cancelled after {completed} of {total} agents")]
    Cancelled { completed: usize, total: usize },
}
