//! Task representation for the planning loop.

use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is waiting to be started.
    #[default]
    Pending,
    /// Task is currently being executed.
    InProgress,
    /// Task completed successfully.
    Done,
    /// Task failed.
    Failed,
    /// Task was skipped.
    Skipped,
}

impl TaskStatus {
    /// Returns true for statuses that survive a plan replacement.
    pub fn is_preserved_on_replan(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::InProgress)
    }

    /// Returns true for statuses that mark the task as finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Skipped)
    }
}

/// A single task in the todo list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (e.g., "TASK-0001").
    pub id: String,
    /// What to do, in the planner's words.
    pub description: String,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Step counter value when the task entered the list.
    #[serde(default)]
    pub created_at_step: u32,
}

impl Task {
    /// Creates a pending task.
    pub fn new(id: impl Into<String>, description: impl Into<String>, step: u32) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            created_at_step: step,
        }
    }

    /// Formats a task id from a sequence number.
    pub fn format_id(seq: u32) -> String {
        format!("TASK-{:04}", seq)
    }
}

/// Ordered list of tasks. Replaced wholesale on replan; completed tasks are
/// carried forward by id so they are never dropped from the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TodoList {
    tasks: Vec<Task>,
}

impl TodoList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list from tasks in order.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Appends a task.
    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Returns the tasks in order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Returns the first pending task in list order, if any.
    pub fn first_pending(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Pending)
    }

    /// Returns a mutable handle to the task with the given id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Returns the task with the given id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Returns true if any task is still pending.
    pub fn has_pending(&self) -> bool {
        self.first_pending().is_some()
    }

    /// Returns the count of tasks by status: (pending, in_progress, done, failed).
    pub fn status_counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.0 += 1,
                TaskStatus::InProgress => counts.1 += 1,
                TaskStatus::Done => counts.2 += 1,
                TaskStatus::Failed => counts.3 += 1,
                TaskStatus::Skipped => {}
            }
        }
        counts
    }

    /// Number of tasks in the list.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the list holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_pending() {
        let task = Task::new("TASK-0001", "Probe the homepage", 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.created_at_step, 0);
    }

    #[test]
    fn format_id_pads_sequence() {
        assert_eq!(Task::format_id(7), "TASK-0007");
        assert_eq!(Task::format_id(1234), "TASK-1234");
    }

    #[test]
    fn first_pending_respects_list_order() {
        let mut list = TodoList::new();
        let mut done = Task::new("TASK-0001", "first", 0);
        done.status = TaskStatus::Done;
        list.push(done);
        list.push(Task::new("TASK-0002", "second", 0));
        list.push(Task::new("TASK-0003", "third", 0));

        assert_eq!(list.first_pending().unwrap().id, "TASK-0002");
    }

    #[test]
    fn first_pending_returns_none_when_exhausted() {
        let mut list = TodoList::new();
        let mut failed = Task::new("TASK-0001", "only", 0);
        failed.status = TaskStatus::Failed;
        list.push(failed);

        assert!(list.first_pending().is_none());
        assert!(!list.has_pending());
    }

    #[test]
    fn status_counts_cover_all_tasks() {
        let mut list = TodoList::new();
        list.push(Task::new("TASK-0001", "a", 0));
        let mut in_progress = Task::new("TASK-0002", "b", 0);
        in_progress.status = TaskStatus::InProgress;
        list.push(in_progress);
        let mut done = Task::new("TASK-0003", "c", 0);
        done.status = TaskStatus::Done;
        list.push(done);

        assert_eq!(list.status_counts(), (1, 1, 1, 0));
    }

    #[test]
    fn preserved_statuses_are_done_and_in_progress() {
        assert!(TaskStatus::Done.is_preserved_on_replan());
        assert!(TaskStatus::InProgress.is_preserved_on_replan());
        assert!(!TaskStatus::Pending.is_preserved_on_replan());
        assert!(!TaskStatus::Failed.is_preserved_on_replan());
        assert!(!TaskStatus::Skipped.is_preserved_on_replan());
    }

    #[test]
    fn task_status_serializes_to_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
    }
}
