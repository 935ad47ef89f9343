//! Redloop - autonomous penetration-testing loop.
//!
//! This library drives exploratory security testing: given a target and
//! goal, a coordinator plans tasks, executes them inside isolated sandboxes
//! or via HTTP probes, extracts deduplicated findings from the output, and
//! re-plans on the accumulated evidence until the goal is proven or
//! exhausted.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod finding;
pub mod model;
pub mod planner;
pub mod sandbox;
pub mod state;
pub mod task;
pub mod tools;

pub use config::{ModelConfig, RunConfig, Validate, ValidationResult};
pub use coordinator::{CancelToken, CoordinatorAgent, RunOutcome, RunReport};
pub use error::{Error, PlanningError, Result, ToolError};
pub use executor::ExecutorAgent;
pub use extractor::FindingExtractor;
pub use finding::{Finding, FindingSeverity, FLAG_CATEGORY};
pub use model::{HttpModelClient, ModelClient, ModelError};
pub use planner::PlannerAgent;
pub use sandbox::{
    DockerCliBackend, RawOutput, SandboxBackend, SandboxInstance, SandboxRegistry, SandboxStatus,
};
pub use state::{
    ExecContext, ExecError, ExecErrorKind, ExecutionResult, PlanningSnapshot, RunState,
    StateManager,
};
pub use task::{Task, TaskStatus, TodoList};
pub use tools::{ToolCall, ToolLayer, ToolOutput};
