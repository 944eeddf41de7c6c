//! Focus Module - multi-step task tracking
//!
//! Complex commands are decomposed into sequential steps and tracked here,
//! outside the execution agent's single-task slot. The module only tracks
//! state; decomposition text comes from the agent's LLM round.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Status of a focus task or step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Priority levels for focus tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low = 1,
    Medium = 2,
    High = 3,
}

/// A single step of a decomposed task
#[derive(Debug, Clone)]
pub struct TaskStep {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// A complex task being tracked by the focus module
#[derive(Debug, Clone)]
pub struct FocusTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub steps: Vec<TaskStep>,
    pub created_at: DateTime<Utc>,
}

impl FocusTask {
    /// Next step that still needs work
    pub fn current_step(&self) -> Option<&TaskStep> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, TaskStatus::Pending | TaskStatus::InProgress))
    }

    /// Completed fraction of the task, 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .count();
        completed as f64 / self.steps.len() as f64
    }
}

/// Tracker for decomposed multi-step tasks
pub struct FocusModule {
    tasks: Mutex<HashMap<String, FocusTask>>,
}

impl Default for FocusModule {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusModule {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new tracked task; returns its id
    pub fn create_task(&self, title: &str, description: &str, priority: TaskPriority) -> String {
        let id = Uuid::new_v4().to_string();
        let task = FocusTask {
            id: id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            priority,
            status: TaskStatus::Pending,
            steps: Vec::new(),
            created_at: Utc::now(),
        };

        info!("Created focus task: {title}");
        self.tasks.lock().insert(id.clone(), task);
        id
    }

    /// Attach decomposed steps to a task
    pub fn decompose(&self, task_id: &str, steps: Vec<(String, String)>) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };

        for (id, description) in steps {
            task.steps.push(TaskStep {
                id,
                description,
                status: TaskStatus::Pending,
                result: None,
                error: None,
            });
        }

        debug!("Task {} decomposed into {} steps", task_id, task.steps.len());
        true
    }

    /// Mark a task in progress
    pub fn start_task(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        task.status = TaskStatus::InProgress;
        true
    }

    /// Record a step result; completion propagates to the task status
    pub fn complete_step(
        &self,
        task_id: &str,
        step_id: &str,
        result: Option<String>,
        error: Option<String>,
    ) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        let Some(step) = task.steps.iter_mut().find(|s| s.id == step_id) else {
            return false;
        };

        step.status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        step.result = result;
        step.error = error;

        let all_done = !task.steps.is_empty()
            && task
                .steps
                .iter()
                .all(|s| matches!(s.status, TaskStatus::Completed | TaskStatus::Failed));

        if all_done {
            let failed = task.steps.iter().any(|s| s.status == TaskStatus::Failed);
            task.status = if failed {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            info!("Focus task {} finished: {:?}", task.title, task.status);
        }

        true
    }

    /// Cancel a tracked task
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        task.status = TaskStatus::Cancelled;
        true
    }

    /// Snapshot of a task
    pub fn get(&self, task_id: &str) -> Option<FocusTask> {
        self.tasks.lock().get(task_id).cloned()
    }

    /// Tasks that are pending or in progress
    pub fn active_tasks(&self) -> Vec<FocusTask> {
        self.tasks
            .lock()
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle() {
        let focus = FocusModule::new();

        let id = focus.create_task("build a site", "build a three page site", TaskPriority::Medium);
        focus.decompose(
            &id,
            vec![
                ("step_1".to_string(), "create index.html".to_string()),
                ("step_2".to_string(), "create about.html".to_string()),
            ],
        );
        focus.start_task(&id);

        let task = focus.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.current_step().unwrap().id, "step_1");
        assert_eq!(task.progress(), 0.0);

        focus.complete_step(&id, "step_1", Some("done".to_string()), None);
        let task = focus.get(&id).unwrap();
        assert_eq!(task.progress(), 0.5);
        assert_eq!(task.current_step().unwrap().id, "step_2");

        focus.complete_step(&id, "step_2", Some("done".to_string()), None);
        let task = focus.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.current_step().is_none());
    }

    #[test]
    fn test_step_failure_fails_task() {
        let focus = FocusModule::new();

        let id = focus.create_task("risky", "risky work", TaskPriority::High);
        focus.decompose(&id, vec![("s1".to_string(), "try it".to_string())]);
        focus.start_task(&id);

        focus.complete_step(&id, "s1", None, Some("it broke".to_string()));
        assert_eq!(focus.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_active_tasks() {
        let focus = FocusModule::new();

        let a = focus.create_task("a", "a", TaskPriority::Low);
        let _b = focus.create_task("b", "b", TaskPriority::Low);
        focus.cancel(&a);

        let active = focus.active_tasks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "b");
    }

    #[test]
    fn test_unknown_task_rejected() {
        let focus = FocusModule::new();
        assert!(!focus.start_task("missing"));
        assert!(!focus.decompose("missing", vec![]));
    }
}
