//! End-to-end scenarios for the coordination loop.
//!
//! These tests drive the real coordinator, planner, executor, and extractor
//! against a scripted model and an in-memory sandbox backend, so every
//! scenario is deterministic and CI-safe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use redloop::{
    CoordinatorAgent, ExecErrorKind, ExecutorAgent, FindingExtractor, FindingSeverity,
    ModelClient, ModelConfig, ModelError, PlannerAgent, RawOutput, RunConfig, RunOutcome,
    SandboxBackend, ToolError, ToolLayer, FLAG_CATEGORY,
};

/// Scripted model that routes on the calling role's system prompt.
struct RoleModel {
    planner: Mutex<VecDeque<String>>,
    executor: Mutex<VecDeque<String>>,
    /// Fallback when the executor queue runs dry.
    executor_default: String,
    /// Response for extraction-policy calls.
    extractor_response: String,
    /// When set, the planner synthesizes fresh task lines forever.
    endless_planner: bool,
    planner_calls: AtomicUsize,
}

impl RoleModel {
    fn new(planner: Vec<&str>, executor: Vec<&str>) -> Self {
        Self {
            planner: Mutex::new(planner.into_iter().map(str::to_string).collect()),
            executor: Mutex::new(executor.into_iter().map(str::to_string).collect()),
            executor_default: r#"{"done": true, "report": "nothing further"}"#.to_string(),
            extractor_response: "[]".to_string(),
            endless_planner: false,
            planner_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for RoleModel {
    async fn complete(&self, system: &str, _user: &str) -> Result<String, ModelError> {
        if system.contains("coach") {
            let n = self.planner_calls.fetch_add(1, Ordering::SeqCst);
            if self.endless_planner {
                return Ok(format!(
                    "Approach variant {n} alpha\nApproach variant {n} beta"
                ));
            }
            return Ok(self
                .planner
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default());
        }
        if system.contains("review raw output") {
            return Ok(self.extractor_response.clone());
        }
        Ok(self
            .executor
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.executor_default.clone()))
    }

    fn name(&self) -> &str {
        "role-model"
    }
}

/// In-memory backend standing in for the container runtime.
#[derive(Default)]
struct MockBackend {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

#[async_trait]
impl SandboxBackend for MockBackend {
    async fn create(&self) -> Result<String, ToolError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("container-{n}"))
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
        Ok(RawOutput {
            exit_code: 0,
            stdout: format!("HTTP/1.1 200 OK\n\nran: {command}"),
            stderr: String::new(),
        })
    }

    async fn destroy(&self, _: &str) -> Result<(), ToolError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _: &str) -> Result<bool, ToolError> {
        Ok(false)
    }
}

fn test_config() -> RunConfig {
    RunConfig::new(ModelConfig::new("http://localhost:9", "mock")).with_step_cap(20)
}

fn coordinator_with(
    goal: &str,
    model: RoleModel,
    backend: Arc<MockBackend>,
    config: RunConfig,
) -> CoordinatorAgent {
    let model: Arc<dyn ModelClient> = Arc::new(model);
    let tools = Arc::new(ToolLayer::new(backend, &config).expect("tool layer"));
    CoordinatorAgent::new(
        goal,
        PlannerAgent::new(model.clone()),
        ExecutorAgent::new(model.clone(), tools.clone(), config.max_tool_calls),
        FindingExtractor::new(model),
        tools,
        config,
    )
}

#[tokio::test]
async fn clean_probe_with_empty_replan_exhausts() {
    // One task, a clean 200 response, no findings, then the planner gives up.
    let model = RoleModel::new(
        vec!["Create a sandbox and curl http://x/", ""],
        vec![
            r#"{"tool": "create_sandbox"}"#,
            r#"{"tool": "run_command", "args": {"command": "curl http://x/"}}"#,
            r#"{"done": true, "report": "Plain 200 response, nothing of note."}"#,
        ],
    );
    let backend = Arc::new(MockBackend::default());

    let report = coordinator_with("probe target X", model, backend.clone(), test_config())
        .run()
        .await;

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.steps, 1);
    assert!(report.findings.is_empty());
    assert_eq!(report.history.len(), 1);

    let result = &report.history[0];
    assert!(result.error.is_none());
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.tool_calls_made, 2);
    assert!(result.stdout.contains("ran: curl http://x/"));
}

#[tokio::test]
async fn command_timeout_fails_task_quickly() {
    let model = RoleModel::new(
        vec!["Run the slow scanner", ""],
        vec![
            r#"{"tool": "create_sandbox"}"#,
            r#"{"tool": "run_command", "args": {"command": "sleep:10000", "timeout_ms": 100}}"#,
        ],
    );
    let backend = Arc::new(MockBackend::default());

    let started = std::time::Instant::now();
    let report = coordinator_with("probe target X", model, backend, test_config())
        .run()
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.history.len(), 1);

    // The task failed with a timeout; it is not left in progress.
    let error = report.history[0].error.as_ref().expect("timeout error");
    assert_eq!(error.kind, ExecErrorKind::Timeout);
    assert!(report.summary.contains("0/1 tasks succeeded"));
}

#[tokio::test]
async fn flag_finding_achieves_goal() {
    let model = RoleModel::new(
        vec!["Exploit the IDOR on /orders"],
        vec![
            r#"{"tool": "create_sandbox"}"#,
            r#"{"tool": "run_command", "args": {"command": "python3 /tmp/probe.py"}}"#,
            r#"{"done": true, "report": "[FINDING] idor: order 17 readable\n[FLAG] flag{pwned}"}"#,
        ],
    );
    let backend = Arc::new(MockBackend::default());

    let report = coordinator_with("capture the flag on target X", model, backend.clone(), test_config())
        .run()
        .await;

    assert_eq!(report.outcome, RunOutcome::GoalAchieved);
    assert_eq!(report.steps, 1);

    let flag = report
        .findings
        .iter()
        .find(|f| f.category == FLAG_CATEGORY)
        .expect("flag finding");
    assert_eq!(flag.severity, FindingSeverity::Critical);
    assert!(flag.evidence.contains("flag{pwned}"));

    // Sandboxes never outlive the run.
    assert_eq!(
        backend.created.load(Ordering::SeqCst),
        backend.destroyed.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn always_failing_tools_still_terminate() {
    // The planner has endless ideas; every execution hits a tool error
    // because no sandbox exists and no preset is configured. The loop must
    // still converge on Exhausted within the caps.
    let mut model = RoleModel::new(vec![], vec![]);
    model.endless_planner = true;
    model.executor_default =
        r#"{"tool": "run_command", "args": {"command": "id"}}"#.to_string();
    let backend = Arc::new(MockBackend::default());

    let report = coordinator_with("probe target X", model, backend, test_config())
        .run()
        .await;

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert!(report.steps <= 20);
    assert!(!report.history.is_empty());
    assert!(report
        .history
        .iter()
        .all(|r| r.error.as_ref().map(|e| e.kind) == Some(ExecErrorKind::Tool)));
}

#[tokio::test]
async fn repeated_planning_failures_terminate_run() {
    struct DownModel;

    #[async_trait]
    impl ModelClient for DownModel {
        async fn complete(&self, _: &str, _: &str) -> Result<String, ModelError> {
            Err(ModelError("connection refused".to_string()))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    let config = test_config();
    let model: Arc<dyn ModelClient> = Arc::new(DownModel);
    let backend: Arc<MockBackend> = Arc::new(MockBackend::default());
    let tools = Arc::new(ToolLayer::new(backend, &config).expect("tool layer"));
    let coordinator = CoordinatorAgent::new(
        "probe target X",
        PlannerAgent::new(model.clone()),
        ExecutorAgent::new(model.clone(), tools.clone(), config.max_tool_calls),
        FindingExtractor::new(model),
        tools,
        config,
    );

    let report = coordinator.run().await;

    assert_eq!(report.outcome, RunOutcome::PlanningFailed);
    assert_eq!(report.steps, 0);
    assert!(report.history.is_empty());
}

#[tokio::test]
async fn cancellation_aborts_and_tears_down() {
    let model = RoleModel::new(
        vec!["Create a sandbox and curl http://x/"],
        vec![r#"{"tool": "create_sandbox"}"#],
    );
    let backend = Arc::new(MockBackend::default());

    let coordinator =
        coordinator_with("probe target X", model, backend.clone(), test_config());
    coordinator.cancel_token().cancel();

    let report = coordinator.run().await;

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.steps, 0);
    assert!(report.history.is_empty());
}

#[tokio::test]
async fn duplicate_evidence_across_tasks_yields_one_finding() {
    let model = RoleModel::new(
        vec![
            "Probe the orders endpoint\nProbe the orders endpoint again",
            "",
        ],
        vec![
            r#"{"done": true, "report": "[FINDING] idor: User 10032 CAN read user 10033 data"}"#,
            r#"{"done": true, "report": "[FINDING] IDOR: user  10032 can read\nuser 10033 data"}"#,
        ],
    );
    let backend = Arc::new(MockBackend::default());

    let report = coordinator_with("probe target X", model, backend, test_config())
        .run()
        .await;

    assert_eq!(report.history.len(), 2);
    let idor: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.category == "idor")
        .collect();
    assert_eq!(idor.len(), 1);
}

#[tokio::test]
async fn high_severity_finding_triggers_replan() {
    // Two pending tasks; the first surfaces a high-severity finding via the
    // extraction policy, which pulls planning forward. The refreshed plan
    // drops the stale second task, so only the follow-up exploit task runs.
    let mut model = RoleModel::new(
        vec![
            "Probe the orders endpoint\nScan static assets",
            "Exploit the exposed admin token",
            "",
        ],
        vec![
            r#"{"done": true, "report": "The orders endpoint response body embeds what looks like an administrative bearer token next to the pagination block."}"#,
            r#"{"done": true, "report": "token rejected"}"#,
        ],
    );
    model.extractor_response = r#"[{"category": "exposed-secret", "severity": "high",
        "evidence": "administrative bearer token in response body"}]"#
        .to_string();
    let backend = Arc::new(MockBackend::default());

    let report = coordinator_with("probe target X", model, backend, test_config())
        .run()
        .await;

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.history.len(), 2);
    assert_eq!(report.history[1].task_id, "TASK-0003");
    assert!(report
        .findings
        .iter()
        .any(|f| f.category == "exposed-secret" && f.severity == FindingSeverity::High));
}
