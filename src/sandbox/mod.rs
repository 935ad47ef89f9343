//! Sandbox lifecycle: isolated, disposable execution environments.
//!
//! This module provides the [`SandboxRegistry`] tracking live instances and
//! the [`SandboxBackend`] trait with the [`DockerCliBackend`] implementation.

mod backend;
mod registry;

pub use backend::{DockerCliBackend, RawOutput, SandboxBackend};
pub use registry::{SandboxInstance, SandboxRegistry, SandboxStatus};
