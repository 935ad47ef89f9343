//! Run configuration and validation.
//!
//! All loop bounds are first-class configuration: the step cap and the
//! consecutive-failure cap guarantee termination regardless of planner or
//! executor behavior.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the external model collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible chat endpoint.
    pub endpoint: String,

    /// Model name to request.
    pub model: String,

    /// Credential passed as a bearer token. Opaque to the engine.
    #[serde(default)]
    pub api_key: String,

    /// Time budget for a single model call.
    #[serde(default = "default_model_timeout")]
    pub request_timeout: Duration,
}

fn default_model_timeout() -> Duration {
    Duration::from_secs(120)
}

impl ModelConfig {
    /// Creates a model configuration for the given endpoint and model name.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: String::new(),
            request_timeout: default_model_timeout(),
        }
    }

    /// Sets the API credential.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }
}

/// Configuration for a single run of the coordinator loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model collaborator configuration.
    pub model: ModelConfig,

    /// Hard cap on loop steps. The step counter strictly increases, so this
    /// bounds total iterations.
    #[serde(default = "default_step_cap")]
    pub step_cap: u32,

    /// Consecutive failed tasks since the last plan that trigger a replan.
    #[serde(default = "default_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Replan attempts allowed without any new finding before the run is
    /// considered exhausted.
    #[serde(default = "default_replan_retry_cap")]
    pub replan_retry_cap: u32,

    /// Consecutive planning errors before the run terminates.
    #[serde(default = "default_max_planning_errors")]
    pub max_planning_errors: u32,

    /// Tool calls the executor may make for a single task.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,

    /// Default timeout for sandbox command execution.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: Duration,

    /// Timeout for HTTP probes.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: Duration,

    /// Scratch root inside sandboxes; file writes must resolve under it.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: String,

    /// Container image used for new sandboxes.
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,

    /// Network the sandbox joins; `None` disables networking.
    #[serde(default)]
    pub sandbox_network: Option<String>,

    /// Sandbox id to use when tool calls omit an explicit one.
    #[serde(default)]
    pub preset_sandbox: Option<String>,
}

fn default_step_cap() -> u32 {
    100
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_replan_retry_cap() -> u32 {
    2
}

fn default_max_planning_errors() -> u32 {
    3
}

fn default_max_tool_calls() -> u32 {
    8
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_scratch_root() -> String {
    "/tmp".to_string()
}

fn default_sandbox_image() -> String {
    "python:3.11-slim".to_string()
}

impl RunConfig {
    /// Creates a run configuration with defaults for everything but the model.
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            step_cap: default_step_cap(),
            consecutive_failure_threshold: default_failure_threshold(),
            replan_retry_cap: default_replan_retry_cap(),
            max_planning_errors: default_max_planning_errors(),
            max_tool_calls: default_max_tool_calls(),
            command_timeout: default_command_timeout(),
            http_timeout: default_http_timeout(),
            scratch_root: default_scratch_root(),
            sandbox_image: default_sandbox_image(),
            sandbox_network: None,
            preset_sandbox: None,
        }
    }

    /// Sets the step cap.
    pub fn with_step_cap(mut self, cap: u32) -> Self {
        self.step_cap = cap;
        self
    }

    /// Sets the consecutive-failure replan threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.consecutive_failure_threshold = threshold;
        self
    }

    /// Sets the preset sandbox id.
    pub fn with_preset_sandbox(mut self, id: impl Into<String>) -> Self {
        self.preset_sandbox = Some(id.into());
        self
    }

    /// Sets the sandbox network.
    pub fn with_sandbox_network(mut self, network: impl Into<String>) -> Self {
        self.sandbox_network = Some(network.into());
        self
    }

    /// Loads a run configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for ModelConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.endpoint.trim().is_empty() {
            result.add_error("model endpoint cannot be empty");
        }
        if self.model.trim().is_empty() {
            result.add_error("model name cannot be empty");
        }
        if self.api_key.trim().is_empty() {
            result.add_warning("no API credential configured");
        }
        if self.request_timeout < Duration::from_secs(5) {
            result.add_warning("model request_timeout under 5 seconds will abort most calls");
        }

        result
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.model.validate();

        if self.step_cap == 0 {
            result.add_error("step_cap must be at least 1");
        }
        if self.consecutive_failure_threshold == 0 {
            result.add_error("consecutive_failure_threshold must be at least 1");
        }
        if self.max_planning_errors == 0 {
            result.add_error("max_planning_errors must be at least 1");
        }
        if self.max_tool_calls == 0 {
            result.add_error("max_tool_calls must be at least 1");
        }
        if !self.scratch_root.starts_with('/') {
            result.add_error("scratch_root must be an absolute path");
        }
        if self.step_cap > 1000 {
            result.add_warning("step_cap over 1000 may run for a very long time");
        }
        if self.command_timeout > Duration::from_secs(600) {
            result.add_warning("command_timeout over 10 minutes stalls the loop on hung commands");
        }

        result
    }
}
