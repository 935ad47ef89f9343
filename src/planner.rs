//! Plan generation: turning the goal and accumulated state into an
//! ordered todo list.
//!
//! The planner is pure apart from the model call: it consults the snapshot
//! it is given and produces tasks. Replan scheduling belongs to the
//! coordinator.

use std::sync::Arc;

use crate::error::PlanningError;
use crate::model::ModelClient;
use crate::state::PlanningSnapshot;
use crate::task::Task;

/// Upper bound on tasks taken from a single plan.
const MAX_PLAN_TASKS: usize = 8;

const PLANNER_SYSTEM: &str = "You are a senior security-testing coach. Break \
the goal into short, executable steps. Respond with the todo list only, one \
step per line, no other text. Start with observation (fetch and read pages) \
before probing. Never propose a step that already failed in the same form; \
rework it using what was learned.";

/// Fallback first step when the model returns nothing usable for the
/// initial plan.
const DEFAULT_FIRST_STEP: &str = "Observe the target homepage and map entry points";

/// Produces and refreshes the ordered todo list.
pub struct PlannerAgent {
    model: Arc<dyn ModelClient>,
}

impl PlannerAgent {
    /// Creates a planner backed by the given model collaborator.
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Generates the initial plan for a goal.
    pub async fn initial_plan(&self, goal: &str) -> Result<Vec<Task>, PlanningError> {
        let user = format!(
            "Goal:\n\n{goal}\n\nProduce an initial todo list of at most 5 \
             observation-first steps, one per line."
        );
        let text = self.complete(&user).await?;

        let mut descriptions = parse_task_lines(&text);
        if descriptions.is_empty() {
            descriptions.push(DEFAULT_FIRST_STEP.to_string());
        }
        Ok(to_tasks(descriptions, 1, 0))
    }

    /// Re-plans from accumulated state. An empty list is a valid outcome
    /// and signals the planner sees nothing left to try.
    pub async fn replan(&self, snapshot: &PlanningSnapshot) -> Result<Vec<Task>, PlanningError> {
        let user = render_replan_prompt(snapshot);
        let text = self.complete(&user).await?;

        let descriptions: Vec<String> = parse_task_lines(&text)
            .into_iter()
            .filter(|candidate| !repeats_finished_work(candidate, &snapshot.recent_descriptions))
            .collect();

        tracing::info!(
            proposed = descriptions.len(),
            step = snapshot.step,
            "replan produced tasks"
        );
        Ok(to_tasks(descriptions, snapshot.next_task_seq, snapshot.step))
    }

    async fn complete(&self, user: &str) -> Result<String, PlanningError> {
        self.model
            .complete(PLANNER_SYSTEM, user)
            .await
            .map_err(|e| PlanningError::ModelUnavailable(e.to_string()))
    }
}

fn to_tasks(descriptions: Vec<String>, start_seq: u32, step: u32) -> Vec<Task> {
    descriptions
        .into_iter()
        .enumerate()
        .map(|(offset, description)| {
            Task::new(
                Task::format_id(start_seq + offset as u32),
                description,
                step,
            )
        })
        .collect()
}

fn render_replan_prompt(snapshot: &PlanningSnapshot) -> String {
    let mut prompt = format!("Goal:\n\n{}\n\n---\n\n", snapshot.goal);

    prompt.push_str(&format!("Findings so far ({}):\n", snapshot.recent_findings.len()));
    if snapshot.recent_findings.is_empty() {
        prompt.push_str("  (none)\n");
    }
    for finding in &snapshot.recent_findings {
        prompt.push_str(&format!(
            "  - [{}] {}: {}\n",
            finding.severity.label(),
            finding.category,
            finding.evidence
        ));
    }

    if !snapshot.failed_attempts.is_empty() {
        prompt.push_str("\nFailed attempts (do not repeat verbatim, rework them):\n");
        for attempt in &snapshot.failed_attempts {
            prompt.push_str(&format!(
                "  - {} (failed: {})\n",
                attempt.description, attempt.reason
            ));
        }
    }

    if !snapshot.open_tasks.is_empty() {
        prompt.push_str("\nStill open:\n");
        for task in &snapshot.open_tasks {
            prompt.push_str(&format!("  - {}\n", task.description));
        }
    }

    prompt.push_str(
        "\n---\n\nProduce the next todo list based on the findings above, one \
         step per line. Respond with an empty message if there is nothing \
         promising left to try.",
    );
    prompt
}

/// Strips list decoration and dedups while preserving order.
fn parse_task_lines(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut tasks = Vec::new();

    for line in text.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(['-', '*', '•'])
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
            .trim();
        if cleaned.is_empty() || cleaned.starts_with("```") {
            continue;
        }
        if seen.insert(cleaned.to_lowercase()) {
            tasks.push(cleaned.to_string());
        }
        if tasks.len() == MAX_PLAN_TASKS {
            break;
        }
    }
    tasks
}

/// True when a proposed step textually repeats recently finished work.
fn repeats_finished_work(candidate: &str, recent: &[String]) -> bool {
    let candidate = candidate.to_lowercase();
    recent.iter().any(|finished| {
        let finished = finished.to_lowercase();
        finished.contains(&candidate) || candidate.contains(&finished)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::{Finding, FindingSeverity};
    use crate::model::ModelError;
    use crate::state::FailedAttempt;
    use async_trait::async_trait;

    struct ScriptedModel {
        response: Result<String, String>,
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, _: &str, _: &str) -> Result<String, ModelError> {
            self.response.clone().map_err(ModelError)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn planner(response: &str) -> PlannerAgent {
        PlannerAgent::new(Arc::new(ScriptedModel {
            response: Ok(response.to_string()),
        }))
    }

    fn snapshot() -> PlanningSnapshot {
        PlanningSnapshot {
            goal: "probe target X".to_string(),
            step: 3,
            next_task_seq: 4,
            open_tasks: Vec::new(),
            failed_attempts: Vec::new(),
            recent_findings: Vec::new(),
            recent_descriptions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn initial_plan_parses_numbered_lines() {
        let tasks = planner("1. Observe the homepage\n2. Enumerate endpoints\n")
            .initial_plan("probe target X")
            .await
            .unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "TASK-0001");
        assert_eq!(tasks[0].description, "Observe the homepage");
        assert_eq!(tasks[1].id, "TASK-0002");
    }

    #[tokio::test]
    async fn initial_plan_falls_back_on_empty_response() {
        let tasks = planner("").initial_plan("goal").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, DEFAULT_FIRST_STEP);
    }

    #[tokio::test]
    async fn initial_plan_surfaces_model_unavailability() {
        let planner = PlannerAgent::new(Arc::new(ScriptedModel {
            response: Err("connection refused".to_string()),
        }));
        let err = planner.initial_plan("goal").await.unwrap_err();
        assert!(matches!(err, PlanningError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn replan_continues_id_sequence() {
        let tasks = planner("Test IDOR on /orders\nFuzz the search parameter\n")
            .replan(&snapshot())
            .await
            .unwrap();

        assert_eq!(tasks[0].id, "TASK-0004");
        assert_eq!(tasks[1].id, "TASK-0005");
        assert_eq!(tasks[0].created_at_step, 3);
    }

    #[tokio::test]
    async fn replan_filters_finished_work() {
        let mut snap = snapshot();
        snap.recent_descriptions = vec!["Test IDOR on /orders".to_string()];

        let tasks = planner("Test IDOR on /orders\nTry XSS in the comment field\n")
            .replan(&snap)
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "Try XSS in the comment field");
    }

    #[tokio::test]
    async fn replan_accepts_empty_plan() {
        let tasks = planner("").replan(&snapshot()).await.unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn parse_task_lines_strips_decoration_and_dedups() {
        let parsed = parse_task_lines(
            "- Observe homepage\n* Observe homepage\n3) Probe login\n\n```\nignored\n```\n",
        );
        assert_eq!(parsed, vec!["Observe homepage", "Probe login"]);
    }

    #[test]
    fn parse_task_lines_caps_length() {
        let many = (0..20)
            .map(|i| format!("step number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(parse_task_lines(&many).len(), MAX_PLAN_TASKS);
    }

    #[test]
    fn replan_prompt_carries_failures_and_findings() {
        let mut snap = snapshot();
        snap.failed_attempts = vec![FailedAttempt {
            description: "Brute force admin login".to_string(),
            reason: "rate limited".to_string(),
        }];
        snap.recent_findings = vec![Finding::new(
            "idor",
            FindingSeverity::High,
            "order 17 readable",
            "TASK-0002",
            2,
        )];

        let prompt = render_replan_prompt(&snap);
        assert!(prompt.contains("Brute force admin login"));
        assert!(prompt.contains("rate limited"));
        assert!(prompt.contains("order 17 readable"));
        assert!(prompt.contains("[high] idor"));
    }
}
