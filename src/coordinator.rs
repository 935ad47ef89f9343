//! Top-level coordination loop.
//!
//! The coordinator owns the run: it pulls tasks from state, dispatches them
//! to the executor, feeds results through the finding extractor, and decides
//! between continuing, re-planning, and terminating. Global termination is
//! decided here and nowhere else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::extractor::FindingExtractor;
use crate::executor::ExecutorAgent;
use crate::finding::Finding;
use crate::planner::PlannerAgent;
use crate::state::{ExecutionResult, StateManager};
use crate::task::TaskStatus;
use crate::tools::ToolLayer;

/// Cooperative run-level cancellation flag.
///
/// Checked at the top of every coordinator state transition; once set, the
/// run transitions to an orderly termination and destroys its sandboxes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A goal-proving finding was recorded.
    GoalAchieved,
    /// The loop ran out of steps, tasks, or fresh ideas.
    Exhausted,
    /// An external cancellation stopped the run.
    Aborted,
    /// The planner failed repeatedly; the loop cannot proceed without it.
    PlanningFailed,
}

/// Final report of a run, carrying the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Steps consumed.
    pub steps: u32,
    /// All findings, in discovery order.
    pub findings: Vec<Finding>,
    /// All execution results, in dispatch order.
    pub history: Vec<ExecutionResult>,
    /// Human-readable closing summary.
    pub summary: String,
}

#[derive(Debug)]
enum Phase {
    Planning,
    Executing,
    Extracting(Box<ExecutionResult>),
    Deciding,
}

/// Drives the planning/execution loop to one of the four outcomes.
pub struct CoordinatorAgent {
    planner: PlannerAgent,
    executor: ExecutorAgent,
    extractor: FindingExtractor,
    tools: Arc<ToolLayer>,
    state: StateManager,
    config: RunConfig,
    cancel: CancelToken,
}

impl CoordinatorAgent {
    /// Creates a coordinator for a fresh run with the given goal.
    pub fn new(
        goal: impl Into<String>,
        planner: PlannerAgent,
        executor: ExecutorAgent,
        extractor: FindingExtractor,
        tools: Arc<ToolLayer>,
        config: RunConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            extractor,
            tools,
            state: StateManager::new(goal),
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Returns a handle for external cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the loop to completion. Always returns a report; planning
    /// collapse is reported as an outcome, not an error.
    pub async fn run(mut self) -> RunReport {
        let mut phase = Phase::Planning;
        let mut initial = true;
        let mut consecutive_failures: u32 = 0;
        let mut planning_errors: u32 = 0;
        let mut stale_replans: u32 = 0;
        let mut findings_at_last_plan: usize = 0;
        let mut high_severity_hint = false;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                tracing::info!("cancellation requested, terminating run");
                break RunOutcome::Aborted;
            }

            phase = match phase {
                Phase::Planning => {
                    let planned = if initial {
                        self.planner.initial_plan(self.state.goal()).await
                    } else {
                        let snapshot = self.state.snapshot_for_planning();
                        self.planner.replan(&snapshot).await
                    };

                    match planned {
                        Ok(tasks) => {
                            planning_errors = 0;
                            consecutive_failures = 0;
                            initial = false;
                            let appended = self.state.apply_plan(tasks);
                            findings_at_last_plan = self.state.findings().len();
                            if appended == 0 && !self.state.has_pending() {
                                tracing::info!("replan produced no tasks, goal exhausted");
                                break RunOutcome::Exhausted;
                            }
                            Phase::Executing
                        }
                        Err(e) => {
                            planning_errors += 1;
                            tracing::warn!(
                                error = %e,
                                consecutive = planning_errors,
                                "planning failed"
                            );
                            if planning_errors >= self.config.max_planning_errors {
                                break RunOutcome::PlanningFailed;
                            }
                            Phase::Planning
                        }
                    }
                }

                Phase::Executing => {
                    if self.state.step() >= self.config.step_cap {
                        tracing::info!(cap = self.config.step_cap, "step cap reached");
                        break RunOutcome::Exhausted;
                    }

                    match self.state.next_pending_task() {
                        None => match self.try_replan_transition(
                            &mut stale_replans,
                            findings_at_last_plan,
                        ) {
                            Some(next) => next,
                            None => break RunOutcome::Exhausted,
                        },
                        Some(task) => {
                            let step = self.state.advance_step();
                            tracing::info!(step, task_id = %task.id, "dispatching task");
                            self.state.mark_in_progress(&task.id);
                            let ctx = self.state.exec_context();
                            let result = self.executor.execute(&task, &ctx).await;
                            Phase::Extracting(Box::new(result))
                        }
                    }
                }

                Phase::Extracting(result) => {
                    let step = self.state.step();
                    let new_findings = self
                        .extractor
                        .extract(&result, self.state.fingerprints(), step)
                        .await;
                    high_severity_hint = new_findings
                        .iter()
                        .any(|f| f.severity.triggers_replan());
                    let added = self.state.add_findings(new_findings);
                    high_severity_hint = high_severity_hint && added > 0;

                    match self.state.record_result(*result) {
                        Ok(TaskStatus::Failed) => consecutive_failures += 1,
                        Ok(_) => consecutive_failures = 0,
                        Err(e) => {
                            // Unreachable while the executor echoes the
                            // dispatched task id; keep the loop alive.
                            tracing::error!(error = %e, "failed to record result");
                        }
                    }
                    Phase::Deciding
                }

                Phase::Deciding => {
                    if self.state.has_goal_proof() {
                        break RunOutcome::GoalAchieved;
                    }

                    let failures_tripped =
                        consecutive_failures >= self.config.consecutive_failure_threshold;
                    let exhausted_list = !self.state.has_pending();

                    if failures_tripped || exhausted_list || high_severity_hint {
                        tracing::info!(
                            failures_tripped,
                            exhausted_list,
                            high_severity_hint,
                            "replan triggered"
                        );
                        high_severity_hint = false;
                        match self.try_replan_transition(
                            &mut stale_replans,
                            findings_at_last_plan,
                        ) {
                            Some(next) => next,
                            None => break RunOutcome::Exhausted,
                        }
                    } else {
                        Phase::Executing
                    }
                }
            };
        };

        // No sandbox outlives its owning run.
        self.tools.destroy_all_live().await;

        let (findings, history, steps) = self.state.into_audit();
        let summary = render_summary(outcome, steps, &findings, &history);
        tracing::info!(?outcome, steps, findings = findings.len(), "run finished");

        RunReport {
            outcome,
            steps,
            findings,
            history,
            summary,
        }
    }

    /// Accounts for a replan attempt; returns `None` when the run should be
    /// considered exhausted because replanning stopped producing findings.
    fn try_replan_transition(
        &self,
        stale_replans: &mut u32,
        findings_at_last_plan: usize,
    ) -> Option<Phase> {
        if self.state.findings().len() > findings_at_last_plan {
            *stale_replans = 0;
        } else {
            *stale_replans += 1;
        }
        if *stale_replans > self.config.replan_retry_cap {
            tracing::info!(
                cap = self.config.replan_retry_cap,
                "replan retries without new findings exhausted"
            );
            return None;
        }
        Some(Phase::Planning)
    }
}

fn render_summary(
    outcome: RunOutcome,
    steps: u32,
    findings: &[Finding],
    history: &[ExecutionResult],
) -> String {
    let verdict = match outcome {
        RunOutcome::GoalAchieved => "goal achieved",
        RunOutcome::Exhausted => "goal exhausted",
        RunOutcome::Aborted => "run aborted",
        RunOutcome::PlanningFailed => "planning failed",
    };
    let completed = history.iter().filter(|r| r.is_success()).count();
    format!(
        "{verdict} after {steps} steps ({completed}/{} tasks succeeded, {} findings)",
        history.len(),
        findings.len()
    )
}
