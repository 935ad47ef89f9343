//! Task execution: the model as a tool-selecting policy over the closed
//! tool set.
//!
//! The executor runs one task at a time. Each model turn yields exactly one
//! action: a tool call, or a final report. Failures of any kind are
//! captured into the [`ExecutionResult`]; the executor never crashes the
//! loop.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::error::ToolError;
use crate::model::{extract_json, ModelClient};
use crate::state::{ExecContext, ExecError, ExecErrorKind, ExecutionResult};
use crate::task::Task;
use crate::tools::{ToolCall, ToolLayer};

/// Longest tool observation fed back into the next model turn.
const MAX_OBSERVATION: usize = 4000;

const EXECUTOR_SYSTEM: &str = "You are a security-testing assistant executing \
exactly one todo item against an authorized target. Respond with exactly one \
JSON object per turn. To act, use \
{\"tool\": \"<name>\", \"args\": {...}} where <name> is one of create_sandbox, \
write_file, run_command, kill_sandbox, http_request, http_request_raw. To \
finish, use {\"done\": true, \"report\": \"...\"}.\n\
Rules:\n\
- A preset sandbox is usually available: call run_command and write_file \
without a sandbox_id and only create_sandbox when they fail.\n\
- write_file paths must live under /tmp, e.g. /tmp/probe.py.\n\
- Observation items only look; test items may write scripts and run them.\n\
- The final report must list what was learned using these markers, one per \
line: [DISCOVERY] new path or behavior, [FINDING] category: evidence, \
[FLAG] captured flag value.";

#[derive(Debug, Deserialize)]
struct DoneAction {
    done: bool,
    #[serde(default)]
    report: String,
}

enum Action {
    Call(ToolCall),
    Finish(String),
}

fn parse_action(text: &str) -> Action {
    if let Some(raw) = extract_json(text) {
        if let Ok(call) = serde_json::from_str::<ToolCall>(raw) {
            return Action::Call(call);
        }
        if let Ok(done) = serde_json::from_str::<DoneAction>(raw) {
            if done.done {
                return Action::Finish(done.report);
            }
        }
    }
    // No structured action: treat the whole turn as the final report, the
    // markers still get extracted downstream.
    Action::Finish(text.to_string())
}

/// Executes single tasks through the tool layer.
pub struct ExecutorAgent {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolLayer>,
    max_tool_calls: u32,
}

impl ExecutorAgent {
    /// Creates an executor with a tool-call budget per task.
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<ToolLayer>, max_tool_calls: u32) -> Self {
        Self {
            model,
            tools,
            max_tool_calls,
        }
    }

    /// Executes one task and returns its result. Never fails: every error
    /// is captured into the result.
    pub async fn execute(&self, task: &Task, ctx: &ExecContext) -> ExecutionResult {
        let started = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut observations = String::new();
        let mut calls: u32 = 0;
        let mut last_exit: i64 = 0;
        let mut error: Option<ExecError> = None;

        tracing::info!(task_id = %task.id, description = %task.description, "executing task");

        loop {
            let turn = self.render_turn(task, ctx, &observations, calls);
            let response = match self.model.complete(EXECUTOR_SYSTEM, &turn).await {
                Ok(response) => response,
                Err(e) => {
                    error = Some(ExecError::new(ExecErrorKind::Model, e.to_string()));
                    break;
                }
            };

            match parse_action(&response) {
                Action::Finish(report) => {
                    if !stdout.is_empty() {
                        stdout.push('\n');
                    }
                    stdout.push_str(&report);
                    break;
                }
                Action::Call(call) => {
                    if calls >= self.max_tool_calls {
                        error = Some(ExecError::new(
                            ExecErrorKind::Model,
                            format!("tool budget of {} calls exhausted", self.max_tool_calls),
                        ));
                        break;
                    }
                    calls += 1;
                    let name = call.name();
                    tracing::debug!(task_id = %task.id, tool = name, "policy selected tool");

                    match self.tools.dispatch(call).await {
                        Ok(output) => {
                            last_exit = output.exit_code;
                            if !output.stdout.is_empty() {
                                if !stdout.is_empty() {
                                    stdout.push('\n');
                                }
                                stdout.push_str(&output.stdout);
                            }
                            if !output.stderr.is_empty() {
                                if !stderr.is_empty() {
                                    stderr.push('\n');
                                }
                                stderr.push_str(&output.stderr);
                            }
                            observations.push_str(&format!(
                                "### {} (exit {})\n{}\n",
                                name,
                                output.exit_code,
                                truncate(&output.stdout, MAX_OBSERVATION)
                            ));
                            if !output.stderr.is_empty() {
                                observations.push_str(&format!(
                                    "stderr:\n{}\n",
                                    truncate(&output.stderr, MAX_OBSERVATION)
                                ));
                            }
                        }
                        Err(ToolError::Timeout(ms)) => {
                            error = Some(ExecError::new(
                                ExecErrorKind::Timeout,
                                format!("{name} timed out after {ms} ms"),
                            ));
                            break;
                        }
                        Err(e) => {
                            error = Some(ExecError::new(ExecErrorKind::Tool, e.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        if let Some(e) = &error {
            tracing::warn!(task_id = %task.id, kind = ?e.kind, message = %e.message, "task errored");
        }

        ExecutionResult {
            task_id: task.id.clone(),
            exit_code: last_exit,
            stdout,
            stderr,
            tool_calls_made: calls,
            duration: started.elapsed(),
            error,
        }
    }

    fn render_turn(
        &self,
        task: &Task,
        ctx: &ExecContext,
        observations: &str,
        calls: u32,
    ) -> String {
        let mut turn = format!(
            "Overall goal: {}\n\nCurrent todo: {}\n\n",
            ctx.goal, task.description
        );

        if !ctx.recent_findings.is_empty() {
            turn.push_str("Known findings:\n");
            for finding in &ctx.recent_findings {
                turn.push_str(&format!(
                    "  - [{}] {}: {}\n",
                    finding.severity.label(),
                    finding.category,
                    finding.evidence
                ));
            }
            turn.push('\n');
        }

        if observations.is_empty() {
            turn.push_str("No tools called yet. Choose the first action.");
        } else {
            turn.push_str(&format!(
                "Tool output so far:\n{observations}\n\
                 {} of {} tool calls used. Choose the next action or finish \
                 with the report.",
                calls, self.max_tool_calls
            ));
        }
        turn
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, RunConfig};
    use crate::model::ModelError;
    use crate::sandbox::{RawOutput, SandboxBackend};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct TurnModel {
        turns: Mutex<VecDeque<Result<String, String>>>,
    }

    impl TurnModel {
        fn new(turns: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(
                    turns
                        .into_iter()
                        .map(|t| t.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl ModelClient for TurnModel {
        async fn complete(&self, _: &str, _: &str) -> Result<String, ModelError> {
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok("{\"done\": true, \"report\": \"out of turns\"}".to_string()))
                .map_err(ModelError)
        }

        fn name(&self) -> &str {
            "turns"
        }
    }

    struct EchoBackend;

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        async fn create(&self) -> Result<String, ToolError> {
            Ok("container-0".to_string())
        }

        async fn write_file(&self, _: &str, _: &str, _: &str) -> Result<(), ToolError> {
            Ok(())
        }

        async fn exec(
            &self,
            _: &str,
            command: &str,
            _: &str,
            _: Duration,
        ) -> Result<RawOutput, ToolError> {
            if let Some(ms) = command.strip_prefix("sleep:") {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
            }
            if command == "false" {
                return Ok(RawOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "failed".to_string(),
                });
            }
            Ok(RawOutput {
                exit_code: 0,
                stdout: format!("ran: {command}"),
                stderr: String::new(),
            })
        }

        async fn destroy(&self, _: &str) -> Result<(), ToolError> {
            Ok(())
        }

        async fn probe(&self, _: &str) -> Result<bool, ToolError> {
            Ok(false)
        }
    }

    fn tools() -> Arc<ToolLayer> {
        let config = RunConfig::new(ModelConfig::new("https://api.example.com", "m"));
        Arc::new(ToolLayer::new(Arc::new(EchoBackend), &config).unwrap())
    }

    fn task() -> Task {
        Task::new("TASK-0001", "observe the target", 1)
    }

    fn ctx() -> ExecContext {
        ExecContext {
            goal: "probe target X".to_string(),
            recent_findings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn executes_tool_calls_then_report() {
        let model = TurnModel::new(vec![
            Ok(r#"{"tool": "create_sandbox"}"#),
            Ok(r#"{"tool": "run_command", "args": {"command": "curl http://x/"}}"#),
            Ok(r#"{"done": true, "report": "[DISCOVERY] /admin panel exposed"}"#),
        ]);
        let executor = ExecutorAgent::new(model, tools(), 8);

        let result = executor.execute(&task(), &ctx()).await;

        assert!(result.error.is_none());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.tool_calls_made, 2);
        assert!(result.stdout.contains("ran: curl http://x/"));
        assert!(result.stdout.contains("[DISCOVERY] /admin panel exposed"));
    }

    #[tokio::test]
    async fn prose_response_becomes_final_report() {
        let model = TurnModel::new(vec![Ok("[FINDING] idor: order 17 readable by anyone")]);
        let executor = ExecutorAgent::new(model, tools(), 8);

        let result = executor.execute(&task(), &ctx()).await;

        assert!(result.error.is_none());
        assert_eq!(result.tool_calls_made, 0);
        assert!(result.stdout.contains("[FINDING] idor"));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_surfaced() {
        let model = TurnModel::new(vec![
            Ok(r#"{"tool": "create_sandbox"}"#),
            Ok(r#"{"tool": "run_command", "args": {"command": "false"}}"#),
            Ok(r#"{"done": true, "report": "command failed"}"#),
        ]);
        let executor = ExecutorAgent::new(model, tools(), 8);

        let result = executor.execute(&task(), &ctx()).await;

        assert!(result.error.is_none());
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("failed"));
    }

    #[tokio::test]
    async fn timeout_is_captured_as_timeout_error() {
        let model = TurnModel::new(vec![
            Ok(r#"{"tool": "create_sandbox"}"#),
            Ok(r#"{"tool": "run_command", "args": {"command": "sleep:10000", "timeout_ms": 100}}"#),
        ]);
        let executor = ExecutorAgent::new(model, tools(), 8);

        let started = Instant::now();
        let result = executor.execute(&task(), &ctx()).await;

        let error = result.error.expect("timeout error");
        assert_eq!(error.kind, ExecErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn tool_error_is_captured_not_raised() {
        // No sandbox exists and no preset is configured.
        let model = TurnModel::new(vec![Ok(
            r#"{"tool": "run_command", "args": {"command": "id"}}"#,
        )]);
        let executor = ExecutorAgent::new(model, tools(), 8);

        let result = executor.execute(&task(), &ctx()).await;

        let error = result.error.expect("tool error");
        assert_eq!(error.kind, ExecErrorKind::Tool);
        assert!(error.message.contains("no default sandbox"));
    }

    #[tokio::test]
    async fn model_failure_is_captured() {
        let model = TurnModel::new(vec![Err("502 bad gateway")]);
        let executor = ExecutorAgent::new(model, tools(), 8);

        let result = executor.execute(&task(), &ctx()).await;

        let error = result.error.expect("model error");
        assert_eq!(error.kind, ExecErrorKind::Model);
    }

    #[tokio::test]
    async fn tool_budget_is_enforced() {
        let calls: Vec<Result<&str, &str>> = std::iter::repeat(Ok(
            r#"{"tool": "run_command", "args": {"command": "id"}}"#,
        ))
        .take(5)
        .collect();
        let model = TurnModel::new(
            [vec![Ok(r#"{"tool": "create_sandbox"}"#)], calls].concat(),
        );
        let executor = ExecutorAgent::new(model, tools(), 3);

        let result = executor.execute(&task(), &ctx()).await;

        let error = result.error.expect("budget error");
        assert_eq!(error.kind, ExecErrorKind::Model);
        assert!(error.message.contains("budget"));
        assert_eq!(result.tool_calls_made, 3);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let cut = truncate(text, 3);
        assert!(cut.starts_with("hé") || cut.starts_with("h"));
        assert_eq!(truncate("short", 100), "short");
    }
}
