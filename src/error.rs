//! Error types for the redloop engine.

use thiserror::Error;

/// Errors raised by the tool layer and sandbox registry.
///
/// These are captured into the relevant result object and fed back to the
/// coordinator's decision logic; they never abort a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The sandbox id is unknown or the sandbox was already destroyed.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// The path does not resolve under the sandbox scratch root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// No explicit sandbox id was given and no preset sandbox is set.
    #[error("no default sandbox configured")]
    NoDefaultSandbox,

    /// The operation exceeded its time budget.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// The container backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// An HTTP probe failed at the transport level.
    #[error("http error: {0}")]
    Http(String),
}

/// Errors raised while generating or parsing a plan.
///
/// This is the only error class allowed to escalate to run termination:
/// without a plan the loop cannot proceed.
#[derive(Error, Debug, Clone)]
pub enum PlanningError {
    /// The model collaborator could not be reached.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The model responded with something that is not a plan.
    #[error("unparsable plan: {0}")]
    UnparsablePlan(String),
}

/// Top-level error type for the engine and binary surface.
#[derive(Error, Debug)]
pub enum Error {
    /// Tool layer or sandbox registry failure.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Plan generation failure.
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// Run state bookkeeping violation.
    #[error("state error: {0}")]
    State(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
