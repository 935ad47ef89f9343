//! Run state: the single source of truth for goal, todo list, history,
//! and findings.
//!
//! The coordinator is the only writer of the step counter and of todo-list
//! swaps; the executor and finding extractor feed history and findings
//! through the methods here. All other components are stateless per call.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::finding::Finding;
use crate::task::{Task, TaskStatus, TodoList};

/// Kind of failure captured in an execution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecErrorKind {
    /// A tool call exceeded its time budget.
    Timeout,
    /// A tool call failed (sandbox missing, bad path, backend error).
    Tool,
    /// The model collaborator failed or produced an unusable action.
    Model,
}

/// Failure captured in an execution result instead of being raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecError {
    /// Failure class.
    pub kind: ExecErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl ExecError {
    /// Creates an error of the given kind.
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of executing one task. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Task this result belongs to.
    pub task_id: String,
    /// Exit code of the last command-like tool call (0 when none ran).
    pub exit_code: i64,
    /// Accumulated stdout plus the executor's final report.
    pub stdout: String,
    /// Accumulated stderr.
    pub stderr: String,
    /// Number of tool calls made.
    pub tool_calls_made: u32,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    /// Failure, if the execution did not complete cleanly.
    pub error: Option<ExecError>,
}

impl ExecutionResult {
    /// Returns true when the result carries no error and a zero exit code.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }

    /// Combined output for finding extraction.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// A failed action the planner should not repeat verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    /// Description of the failed task.
    pub description: String,
    /// Why it failed.
    pub reason: String,
}

/// Read-only view of run state handed to the planner.
#[derive(Debug, Clone)]
pub struct PlanningSnapshot {
    /// The immutable run goal.
    pub goal: String,
    /// Current step counter value.
    pub step: u32,
    /// Next free task sequence number for id continuity.
    pub next_task_seq: u32,
    /// Tasks still open (pending or in progress), in list order.
    pub open_tasks: Vec<Task>,
    /// Recently failed attempts with their reasons.
    pub failed_attempts: Vec<FailedAttempt>,
    /// Most recent findings, oldest first.
    pub recent_findings: Vec<Finding>,
    /// Descriptions of recently finished tasks, used to avoid re-planning
    /// work that was already done.
    pub recent_descriptions: Vec<String>,
}

/// Read-only view of run state handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// The immutable run goal.
    pub goal: String,
    /// Most recent findings, oldest first.
    pub recent_findings: Vec<Finding>,
}

/// Aggregated mutable state for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Test objective, set once at run start.
    pub goal: String,
    /// Current todo list.
    pub todos: TodoList,
    /// Execution results in dispatch order.
    pub history: Vec<ExecutionResult>,
    /// Deduplicated findings, in discovery order.
    pub findings: Vec<Finding>,
    /// Strictly increasing loop step counter.
    pub step: u32,
}

/// Owner of [`RunState`], enforcing the mutation contract.
#[derive(Debug)]
pub struct StateManager {
    state: RunState,
    /// Fingerprints of all recorded findings.
    fingerprints: HashSet<String>,
    /// Every task id that ever appeared in a todo-list version, with its
    /// description. Results may only reference ids recorded here.
    known_tasks: HashMap<String, String>,
    /// Next free task sequence number.
    task_seq: u32,
    /// Descriptions of finished tasks in completion order.
    finished_descriptions: Vec<String>,
}

impl StateManager {
    /// Creates state for a new run with the given goal.
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            state: RunState {
                goal: goal.into(),
                todos: TodoList::new(),
                history: Vec::new(),
                findings: Vec::new(),
                step: 0,
            },
            fingerprints: HashSet::new(),
            known_tasks: HashMap::new(),
            task_seq: 1,
            finished_descriptions: Vec::new(),
        }
    }

    /// The run goal.
    pub fn goal(&self) -> &str {
        &self.state.goal
    }

    /// Current step counter value.
    pub fn step(&self) -> u32 {
        self.state.step
    }

    /// Increments the step counter and returns the new value.
    /// Called by the coordinator only.
    pub fn advance_step(&mut self) -> u32 {
        self.state.step += 1;
        self.state.step
    }

    /// Replaces the todo list with a merged version of `new_tasks`.
    ///
    /// Tasks already Done or InProgress are preserved by exact id match
    /// with unchanged status, ahead of the incoming tasks; an incoming task
    /// whose id collides with a preserved one is ignored. Everything else
    /// is appended as Pending. Returns the number of tasks appended.
    pub fn apply_plan(&mut self, new_tasks: Vec<Task>) -> usize {
        let mut merged = TodoList::new();
        let mut seen: HashSet<String> = HashSet::new();

        for task in self.state.todos.tasks() {
            if task.status.is_preserved_on_replan() {
                seen.insert(task.id.clone());
                merged.push(task.clone());
            }
        }

        let mut appended = 0;
        for mut task in new_tasks {
            if !seen.insert(task.id.clone()) {
                tracing::debug!(task_id = %task.id, "dropping planned task with preserved id");
                continue;
            }
            task.status = TaskStatus::Pending;
            task.created_at_step = self.state.step;
            self.bump_task_seq(&task.id);
            self.known_tasks
                .insert(task.id.clone(), task.description.clone());
            merged.push(task);
            appended += 1;
        }

        tracing::info!(
            appended,
            total = merged.len(),
            step = self.state.step,
            "applied plan"
        );
        self.state.todos = merged;
        appended
    }

    fn bump_task_seq(&mut self, id: &str) {
        if let Some(seq) = id
            .rsplit('-')
            .next()
            .and_then(|digits| digits.parse::<u32>().ok())
        {
            self.task_seq = self.task_seq.max(seq + 1);
        }
    }

    /// Marks a task as in progress. Called by the coordinator when the task
    /// is dispatched.
    pub fn mark_in_progress(&mut self, task_id: &str) {
        if let Some(task) = self.state.todos.get_mut(task_id) {
            task.status = TaskStatus::InProgress;
        }
    }

    /// Records an execution result, transitioning the task's status and
    /// appending to history in dispatch order.
    ///
    /// The task transitions to Failed when the result carries an error or a
    /// nonzero exit code, Done otherwise. Failed tasks are not retried here;
    /// that decision belongs to the coordinator.
    pub fn record_result(&mut self, result: ExecutionResult) -> Result<TaskStatus> {
        let description = self
            .known_tasks
            .get(&result.task_id)
            .cloned()
            .ok_or_else(|| {
                Error::State(format!(
                    "result references unknown task {}",
                    result.task_id
                ))
            })?;

        let status = if result.error.is_some() || result.exit_code != 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Done
        };

        if let Some(task) = self.state.todos.get_mut(&result.task_id) {
            task.status = status;
        }
        self.finished_descriptions.push(description);

        tracing::info!(
            task_id = %result.task_id,
            ?status,
            exit_code = result.exit_code,
            tool_calls = result.tool_calls_made,
            "recorded result"
        );
        self.state.history.push(result);
        Ok(status)
    }

    /// Inserts findings whose fingerprint is not yet present. Returns the
    /// number actually inserted.
    pub fn add_findings(&mut self, findings: Vec<Finding>) -> usize {
        let mut inserted = 0;
        for finding in findings {
            if self.fingerprints.insert(finding.fingerprint()) {
                tracing::info!(
                    category = %finding.category,
                    severity = ?finding.severity,
                    task_id = %finding.source_task_id,
                    "new finding"
                );
                self.state.findings.push(finding);
                inserted += 1;
            }
        }
        inserted
    }

    /// Returns the first pending task in list order.
    pub fn next_pending_task(&self) -> Option<Task> {
        self.state.todos.first_pending().cloned()
    }

    /// Returns true if any task is still pending.
    pub fn has_pending(&self) -> bool {
        self.state.todos.has_pending()
    }

    /// Returns true once a goal-proving finding was recorded.
    pub fn has_goal_proof(&self) -> bool {
        self.state.findings.iter().any(Finding::is_goal_proof)
    }

    /// Fingerprints of all recorded findings, for extractor-side dedup.
    pub fn fingerprints(&self) -> &HashSet<String> {
        &self.fingerprints
    }

    /// All findings in discovery order.
    pub fn findings(&self) -> &[Finding] {
        &self.state.findings
    }

    /// All execution results in dispatch order.
    pub fn history(&self) -> &[ExecutionResult] {
        &self.state.history
    }

    /// The current todo list.
    pub fn todos(&self) -> &TodoList {
        &self.state.todos
    }

    /// Builds the read-only view handed to the planner.
    pub fn snapshot_for_planning(&self) -> PlanningSnapshot {
        let open_tasks = self
            .state
            .todos
            .tasks()
            .iter()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();

        let failed_attempts = self
            .state
            .history
            .iter()
            .rev()
            .filter(|r| !r.is_success())
            .take(5)
            .map(|r| FailedAttempt {
                description: self
                    .known_tasks
                    .get(&r.task_id)
                    .cloned()
                    .unwrap_or_else(|| r.task_id.clone()),
                reason: r
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("exit code {}", r.exit_code)),
            })
            .collect();

        PlanningSnapshot {
            goal: self.state.goal.clone(),
            step: self.state.step,
            next_task_seq: self.task_seq,
            open_tasks,
            failed_attempts,
            recent_findings: last_n(&self.state.findings, 5),
            recent_descriptions: last_n(&self.finished_descriptions, 5),
        }
    }

    /// Builds the read-only view handed to the executor.
    pub fn exec_context(&self) -> ExecContext {
        ExecContext {
            goal: self.state.goal.clone(),
            recent_findings: last_n(&self.state.findings, 3),
        }
    }

    /// Consumes the manager, yielding findings and history for the final
    /// report.
    pub fn into_audit(self) -> (Vec<Finding>, Vec<ExecutionResult>, u32) {
        (self.state.findings, self.state.history, self.state.step)
    }
}

fn last_n<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items.iter().rev().take(n).rev().cloned().collect()
}
