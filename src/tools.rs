//! Typed tool operations invoked by the executor.
//!
//! The tool set is closed: the model selects among the variants of
//! [`ToolCall`], nothing is runtime-extensible. Every sandbox side effect
//! goes through the registry held here; HTTP probes go through a shared
//! client. All calls are individually time-bounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::ToolError;
use crate::sandbox::{SandboxBackend, SandboxInstance, SandboxRegistry};

/// Maximum HTTP response body carried into execution output.
const MAX_HTTP_BODY: usize = 64 * 1024;

/// A single typed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    /// Create a fresh sandbox and register it.
    CreateSandbox,
    /// Write a file under the sandbox scratch root.
    WriteFile {
        #[serde(default)]
        sandbox_id: Option<String>,
        path: String,
        content: String,
    },
    /// Run a command inside a sandbox.
    RunCommand {
        #[serde(default)]
        sandbox_id: Option<String>,
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        user: Option<String>,
    },
    /// Destroy a sandbox. Idempotent.
    KillSandbox { sandbox_id: String },
    /// Issue an HTTP request to the target.
    HttpRequest {
        method: String,
        url: String,
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
        #[serde(default)]
        body: Option<String>,
    },
    /// HTTP request from a flat curl-style argument list, for non-standard
    /// invocations.
    HttpRequestRaw { args: Vec<String> },
}

impl ToolCall {
    /// Name of the operation, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::CreateSandbox => "create_sandbox",
            ToolCall::WriteFile { .. } => "write_file",
            ToolCall::RunCommand { .. } => "run_command",
            ToolCall::KillSandbox { .. } => "kill_sandbox",
            ToolCall::HttpRequest { .. } => "http_request",
            ToolCall::HttpRequestRaw { .. } => "http_request_raw",
        }
    }
}

/// Raw, `ExecutionResult`-shaped output of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Exit code (0 for non-command tools that succeeded).
    pub exit_code: i64,
    /// Captured output or response.
    pub stdout: String,
    /// Captured error output.
    pub stderr: String,
}

impl ToolOutput {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Dispatch layer over the sandbox registry and the HTTP client.
pub struct ToolLayer {
    backend: Arc<dyn SandboxBackend>,
    // The registry is the one object shared across roles (executor writes,
    // coordinator reads for cleanup); the lock keeps its contract safe if
    // callers ever parallelize.
    registry: Mutex<SandboxRegistry>,
    http: reqwest::Client,
    scratch_root: String,
    command_timeout: Duration,
    http_timeout: Duration,
}

impl ToolLayer {
    /// Builds the tool layer from configuration.
    pub fn new(backend: Arc<dyn SandboxBackend>, config: &RunConfig) -> Result<Self, ToolError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ToolError::Http(e.to_string()))?;

        Ok(Self {
            backend,
            registry: Mutex::new(SandboxRegistry::new(config.preset_sandbox.clone())),
            http,
            scratch_root: config.scratch_root.clone(),
            command_timeout: config.command_timeout,
            http_timeout: config.http_timeout,
        })
    }

    /// Executes one tool call.
    pub async fn dispatch(&self, call: ToolCall) -> Result<ToolOutput, ToolError> {
        tracing::debug!(tool = call.name(), "dispatching tool call");
        match call {
            ToolCall::CreateSandbox => self.create_sandbox().await,
            ToolCall::WriteFile {
                sandbox_id,
                path,
                content,
            } => self.write_file(sandbox_id.as_deref(), &path, &content).await,
            ToolCall::RunCommand {
                sandbox_id,
                command,
                timeout_ms,
                user,
            } => {
                self.run_command(sandbox_id.as_deref(), &command, timeout_ms, user.as_deref())
                    .await
            }
            ToolCall::KillSandbox { sandbox_id } => self.kill_sandbox(&sandbox_id).await,
            ToolCall::HttpRequest {
                method,
                url,
                headers,
                body,
            } => {
                self.http_request(&method, &url, headers.unwrap_or_default(), body)
                    .await
            }
            ToolCall::HttpRequestRaw { args } => self.http_request_raw(&args).await,
        }
    }

    /// Creates a sandbox, registers it, and makes it the preset when none
    /// is set yet.
    pub async fn create_sandbox(&self) -> Result<ToolOutput, ToolError> {
        let container = self.backend.create().await?;
        let sandbox_id = Uuid::new_v4().simple().to_string();
        let instance =
            SandboxInstance::new(sandbox_id.clone(), container, self.scratch_root.clone());

        let mut registry = self.lock_registry();
        registry.register(instance);
        if registry.preset().is_none() {
            registry.set_preset(Some(sandbox_id.clone()));
        }
        drop(registry);

        tracing::info!(sandbox_id = %sandbox_id, "sandbox created");
        Ok(ToolOutput::ok(format!(
            "{{\"sandbox_id\":\"{}\",\"mount_path\":\"{}\"}}",
            sandbox_id, self.scratch_root
        )))
    }

    /// Writes a file inside a sandbox. The path must resolve under the
    /// scratch root.
    pub async fn write_file(
        &self,
        sandbox_id: Option<&str>,
        path: &str,
        content: &str,
    ) -> Result<ToolOutput, ToolError> {
        let resolved_path = validate_scratch_path(&self.scratch_root, path)?;
        let (_, container) = self.resolve_sandbox(sandbox_id).await?;

        self.backend
            .write_file(&container, &resolved_path, content)
            .await?;
        Ok(ToolOutput::ok(format!("ok: wrote {resolved_path}")))
    }

    /// Runs a command inside a sandbox, bounded by `timeout_ms` (or the
    /// configured default). On expiry the call fails with
    /// [`ToolError::Timeout`]; the loop never hangs here.
    pub async fn run_command(
        &self,
        sandbox_id: Option<&str>,
        command: &str,
        timeout_ms: Option<u64>,
        user: Option<&str>,
    ) -> Result<ToolOutput, ToolError> {
        let (_, container) = self.resolve_sandbox(sandbox_id).await?;
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.command_timeout);
        let user = user.unwrap_or("root");

        let raw = match tokio::time::timeout(
            timeout,
            self.backend.exec(&container, command, user, timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ToolError::Timeout(timeout.as_millis() as u64)),
        };

        Ok(ToolOutput {
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
        })
    }

    /// Destroys a sandbox. Killing an already-destroyed sandbox is a no-op
    /// success.
    pub async fn kill_sandbox(&self, sandbox_id: &str) -> Result<ToolOutput, ToolError> {
        let container = {
            let mut registry = self.lock_registry();
            registry.mark_destroyed(sandbox_id)?
        };

        if let Some(container) = container {
            self.backend.destroy(&container).await?;
        }
        Ok(ToolOutput::ok(format!("ok: sandbox {sandbox_id} destroyed")))
    }

    /// Issues an HTTP request; the response is rendered status-line first
    /// so downstream extraction sees the full exchange.
    pub async fn http_request(
        &self,
        method: &str,
        url: &str,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Result<ToolOutput, ToolError> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| ToolError::Http(format!("unsupported method: {method}")))?;

        let mut request = self.http.request(method, url);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(self.http_timeout.as_millis() as u64)
            } else {
                ToolError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        let mut rendered = format!("HTTP {}\n", status);
        for (name, value) in response.headers() {
            rendered.push_str(name.as_str());
            rendered.push_str(": ");
            rendered.push_str(value.to_str().unwrap_or("<binary>"));
            rendered.push('\n');
        }
        rendered.push('\n');

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        let truncated = &bytes[..bytes.len().min(MAX_HTTP_BODY)];
        rendered.push_str(&String::from_utf8_lossy(truncated));

        Ok(ToolOutput::ok(rendered))
    }

    /// HTTP request from a flat curl-style argument list.
    pub async fn http_request_raw(&self, args: &[String]) -> Result<ToolOutput, ToolError> {
        let parsed = parse_raw_http_args(args)?;
        self.http_request(&parsed.method, &parsed.url, parsed.headers, parsed.body)
            .await
    }

    /// Destroys every live sandbox. Called at run teardown; no sandbox may
    /// outlive its owning run.
    pub async fn destroy_all_live(&self) {
        let live = {
            let registry = self.lock_registry();
            registry.live()
        };

        for instance in live {
            {
                let mut registry = self.lock_registry();
                let _ = registry.mark_destroyed(&instance.sandbox_id);
            }
            if let Err(e) = self.backend.destroy(&instance.container_ref).await {
                tracing::warn!(
                    sandbox_id = %instance.sandbox_id,
                    error = %e,
                    "sandbox teardown failed"
                );
            }
        }
    }

    /// Returns ids of all live sandboxes.
    pub fn live_sandbox_ids(&self) -> Vec<String> {
        self.lock_registry()
            .live()
            .into_iter()
            .map(|i| i.sandbox_id)
            .collect()
    }

    /// Resolves the sandbox targeted by a call, adopting an unregistered
    /// preset by probing the backend.
    async fn resolve_sandbox(
        &self,
        explicit: Option<&str>,
    ) -> Result<(String, String), ToolError> {
        let (target, known) = {
            let registry = self.lock_registry();
            let target = registry.resolve_target(explicit)?;
            let known = registry.get(&target).map(|i| i.container_ref.clone());
            (target, known)
        };

        if let Some(container) = known {
            return Ok((target, container));
        }

        // Unregistered preset id: adopt the external container if it runs.
        if !self.backend.probe(&target).await? {
            return Err(ToolError::SandboxNotFound(target));
        }
        let instance =
            SandboxInstance::new(target.clone(), target.clone(), self.scratch_root.clone());
        let container = instance.container_ref.clone();
        let mut registry = self.lock_registry();
        if !registry.contains(&target) {
            tracing::info!(sandbox_id = %target, "adopted preset sandbox");
            registry.register(instance);
        }
        Ok((target, container))
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, SandboxRegistry> {
        // Held only for map operations; poisoning would mean a panic while
        // mutating the map, which nothing here does.
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Validates that a path resolves under the scratch root, remapping
/// unambiguous outside paths to `root/<basename>` and rejecting traversal.
fn validate_scratch_path(root: &str, path: &str) -> Result<String, ToolError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(ToolError::InvalidPath("empty path".to_string()));
    }
    if path.contains(['\'', '"', '\n', '\r', '\0', '`', ';']) {
        return Err(ToolError::InvalidPath(path.to_string()));
    }
    if path.split('/').any(|component| component == "..") {
        return Err(ToolError::InvalidPath(path.to_string()));
    }

    let resolved = if let Some(relative) = path.strip_prefix('/') {
        if path.starts_with(&format!("{root}/")) {
            path.to_string()
        } else {
            // Absolute path outside the scratch root: keep the basename.
            let basename = relative
                .rsplit('/')
                .next()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| ToolError::InvalidPath(path.to_string()))?;
            tracing::debug!(from = %path, "remapped path under scratch root");
            format!("{root}/{basename}")
        }
    } else {
        format!("{root}/{path}")
    };

    if resolved == root || resolved.ends_with('/') {
        return Err(ToolError::InvalidPath(path.to_string()));
    }
    Ok(resolved)
}

#[derive(Debug, PartialEq)]
struct RawHttpArgs {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Option<String>,
}

/// Parses a flat curl-style argument list into a request description.
fn parse_raw_http_args(args: &[String]) -> Result<RawHttpArgs, ToolError> {
    let mut method: Option<String> = None;
    let mut url: Option<String> = None;
    let mut headers = HashMap::new();
    let mut body: Option<String> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-X" | "--request" => {
                method = Some(next_value(&mut iter, arg)?);
            }
            "-H" | "--header" => {
                let header = next_value(&mut iter, arg)?;
                let (name, value) = header
                    .split_once(':')
                    .ok_or_else(|| ToolError::Http(format!("malformed header: {header}")))?;
                headers.insert(name.trim().to_string(), value.trim().to_string());
            }
            "-d" | "--data" | "--data-binary" | "--data-raw" => {
                body = Some(next_value(&mut iter, arg)?);
            }
            "-k" | "--insecure" | "-s" | "-sS" | "-S" | "-L" | "--location" | "-i"
            | "--include" => {}
            "--max-time" => {
                next_value(&mut iter, arg)?;
            }
            other if other.starts_with('-') => {
                return Err(ToolError::Http(format!("unsupported argument: {other}")));
            }
            other => {
                if url.replace(other.to_string()).is_some() {
                    return Err(ToolError::Http("multiple urls given".to_string()));
                }
            }
        }
    }

    let url = url.ok_or_else(|| ToolError::Http("no url given".to_string()))?;
    let method = method.unwrap_or_else(|| {
        if body.is_some() {
            "POST".to_string()
        } else {
            "GET".to_string()
        }
    });

    Ok(RawHttpArgs {
        method,
        url,
        headers,
        body,
    })
}

fn next_value(
    iter: &mut std::slice::Iter<'_, String>,
    flag: &str,
) -> Result<String, ToolError> {
    iter.next()
        .cloned()
        .ok_or_else(|| ToolError::Http(format!("{flag} needs a value")))
}
