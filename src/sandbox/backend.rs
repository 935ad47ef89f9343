//! Container backend for sandbox side effects.
//!
//! [`DockerCliBackend`] drives the `docker` CLI through `tokio::process`.
//! Everything above it depends only on the [`SandboxBackend`] trait, so
//! tests substitute an in-memory backend.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::process::Command;

use crate::error::ToolError;

/// Raw output of a command executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// Process exit code (-1 when unavailable).
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Side-effect boundary to the container runtime.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Creates a new container and returns its backend handle.
    async fn create(&self) -> Result<String, ToolError>;

    /// Writes a file inside the container.
    async fn write_file(
        &self,
        container: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ToolError>;

    /// Executes a command inside the container, bounded by `timeout`.
    ///
    /// On expiry the underlying process is forcibly terminated and the
    /// call returns [`ToolError::Timeout`] rather than hanging.
    async fn exec(
        &self,
        container: &str,
        command: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<RawOutput, ToolError>;

    /// Destroys the container. Destroying a missing container succeeds.
    async fn destroy(&self, container: &str) -> Result<(), ToolError>;

    /// Returns true if the container exists and is running. Used to adopt
    /// preset sandboxes created outside this process.
    async fn probe(&self, container: &str) -> Result<bool, ToolError>;
}

/// Backend shelling out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCliBackend {
    image: String,
    network: Option<String>,
}

impl DockerCliBackend {
    /// Creates a backend using the given image. `network` attaches new
    /// containers to a named network; `None` disables networking.
    pub fn new(image: impl Into<String>, network: Option<String>) -> Self {
        Self {
            image: image.into(),
            network,
        }
    }

    async fn run_docker(&self, args: &[&str]) -> Result<RawOutput, ToolError> {
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ToolError::Backend(format!("docker invocation failed: {e}")))?;

        Ok(RawOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl SandboxBackend for DockerCliBackend {
    async fn create(&self) -> Result<String, ToolError> {
        let mut args = vec![
            "run",
            "-d",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--memory",
            "512m",
            "--pids-limit",
            "128",
        ];
        let network = self.network.as_deref().unwrap_or("none");
        args.extend(["--network", network]);
        args.extend([self.image.as_str(), "sleep", "infinity"]);

        let output = self.run_docker(&args).await?;
        if output.exit_code != 0 {
            return Err(ToolError::Backend(format!(
                "docker run failed: {}",
                output.stderr.trim()
            )));
        }

        let container = output.stdout.trim().to_string();
        if container.is_empty() {
            return Err(ToolError::Backend("docker run returned no id".to_string()));
        }
        tracing::info!(container = %container, image = %self.image, "created sandbox container");
        Ok(container)
    }

    async fn write_file(
        &self,
        container: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ToolError> {
        let encoded = BASE64.encode(content.as_bytes());
        let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let script = if dir.is_empty() || dir == "/" {
            format!("printf '%s' '{encoded}' | base64 -d > '{path}'")
        } else {
            format!("mkdir -p '{dir}' && printf '%s' '{encoded}' | base64 -d > '{path}'")
        };

        let output = self
            .run_docker(&["exec", container, "sh", "-c", &script])
            .await?;
        if output.exit_code != 0 {
            return Err(ToolError::Backend(format!(
                "write to {path} failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        command: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<RawOutput, ToolError> {
        let mut child = Command::new("docker")
            .args([
                "exec",
                "--user",
                user,
                "--workdir",
                "/tmp",
                container,
                "sh",
                "-c",
                command,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // On timeout the in-flight future is dropped; the process must
            // die with it rather than linger.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Backend(format!("docker exec failed: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(RawOutput {
                exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(ToolError::Backend(format!("docker exec failed: {e}"))),
            Err(_) => {
                tracing::warn!(container = %container, ?timeout, "exec timed out, killing");
                Err(ToolError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn destroy(&self, container: &str) -> Result<(), ToolError> {
        let output = self.run_docker(&["rm", "-f", container]).await?;
        // `docker rm -f` on a missing container errors; treat as success so
        // kill stays idempotent.
        if output.exit_code != 0 && !output.stderr.contains("No such container") {
            return Err(ToolError::Backend(format!(
                "docker rm failed: {}",
                output.stderr.trim()
            )));
        }
        tracing::info!(container = %container, "destroyed sandbox container");
        Ok(())
    }

    async fn probe(&self, container: &str) -> Result<bool, ToolError> {
        let output = self
            .run_docker(&["inspect", "-f", "{{.State.Running}}", container])
            .await?;
        Ok(output.exit_code == 0 && output.stdout.trim() == "true")
    }
}
