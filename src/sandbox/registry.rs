//! Registry of sandbox instances.
//!
//! The registry is an explicit object passed by reference into the tool
//! layer; the preset id is a field on it, not a process-wide global. Its
//! API stays valid if the surrounding application wraps it in a lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Lifecycle status of a sandbox. Creation and destruction are the only
/// transitions; there is no pausing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// The sandbox accepts writes and command execution.
    Live,
    /// The sandbox was destroyed; any further use fails fast.
    Destroyed,
}

/// An isolated execution environment tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Registry-scoped identifier.
    pub sandbox_id: String,
    /// Backend handle (e.g., a container id).
    pub container_ref: String,
    /// Scratch root inside the sandbox.
    pub mount_path: PathBuf,
    /// Creation time.
    pub created_at: SystemTime,
    /// Current lifecycle status.
    pub status: SandboxStatus,
}

impl SandboxInstance {
    /// Creates a live instance.
    pub fn new(
        sandbox_id: impl Into<String>,
        container_ref: impl Into<String>,
        mount_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            container_ref: container_ref.into(),
            mount_path: mount_path.into(),
            created_at: SystemTime::now(),
            status: SandboxStatus::Live,
        }
    }
}

/// Tracks sandbox instances and the preset default id.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    sandboxes: HashMap<String, SandboxInstance>,
    preset: Option<String>,
}

impl SandboxRegistry {
    /// Creates a registry, optionally with a preset sandbox id.
    ///
    /// A preset id may reference a sandbox created outside this process;
    /// it is adopted into the registry on first use.
    pub fn new(preset: Option<String>) -> Self {
        Self {
            sandboxes: HashMap::new(),
            preset,
        }
    }

    /// Registers an instance under its sandbox id.
    pub fn register(&mut self, instance: SandboxInstance) {
        tracing::debug!(sandbox_id = %instance.sandbox_id, "registered sandbox");
        self.sandboxes.insert(instance.sandbox_id.clone(), instance);
    }

    /// Returns the instance for an id, if registered.
    pub fn get(&self, sandbox_id: &str) -> Option<&SandboxInstance> {
        self.sandboxes.get(sandbox_id)
    }

    /// Returns true if the id is registered (live or destroyed).
    pub fn contains(&self, sandbox_id: &str) -> bool {
        self.sandboxes.contains_key(sandbox_id)
    }

    /// The preset sandbox id, if set.
    pub fn preset(&self) -> Option<&str> {
        self.preset.as_deref()
    }

    /// Sets or clears the preset sandbox id. At most one id is preset at a
    /// time; setting replaces the previous value.
    pub fn set_preset(&mut self, sandbox_id: Option<String>) {
        self.preset = sandbox_id;
    }

    /// Resolves the id targeted by a call: the explicit id when given, the
    /// preset otherwise.
    ///
    /// An explicit id must be registered and live. A preset id may be
    /// unregistered (adoption is the caller's job), but a registered
    /// destroyed preset fails like any destroyed sandbox.
    pub fn resolve_target(&self, explicit: Option<&str>) -> Result<String, ToolError> {
        let id = match explicit {
            Some(id) => {
                self.require_live(id)?;
                id
            }
            None => {
                let preset = self
                    .preset
                    .as_deref()
                    .ok_or(ToolError::NoDefaultSandbox)?;
                if self.contains(preset) {
                    self.require_live(preset)?;
                }
                preset
            }
        };
        Ok(id.to_string())
    }

    fn require_live(&self, sandbox_id: &str) -> Result<(), ToolError> {
        match self.sandboxes.get(sandbox_id) {
            Some(instance) if instance.status == SandboxStatus::Live => Ok(()),
            _ => Err(ToolError::SandboxNotFound(sandbox_id.to_string())),
        }
    }

    /// Marks a sandbox destroyed, returning its container ref if it was
    /// live. Destroying an already-destroyed sandbox is a no-op.
    pub fn mark_destroyed(&mut self, sandbox_id: &str) -> Result<Option<String>, ToolError> {
        let instance = self
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ToolError::SandboxNotFound(sandbox_id.to_string()))?;

        if instance.status == SandboxStatus::Destroyed {
            return Ok(None);
        }
        instance.status = SandboxStatus::Destroyed;
        Ok(Some(instance.container_ref.clone()))
    }

    /// Returns all live instances, for run-teardown cleanup.
    pub fn live(&self) -> Vec<SandboxInstance> {
        self.sandboxes
            .values()
            .filter(|i| i.status == SandboxStatus::Live)
            .cloned()
            .collect()
    }
}
