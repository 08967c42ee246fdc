//! Registry of detached long-running tasks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Exited { code: Option<i32> },
    Failed { message: String },
    /// Remote tasks are not polled after launch.
    Detached,
}

/// A launched background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub task_id: String,
    pub host_id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub log_file: String,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: TaskState,
}

impl BackgroundTask {
    pub fn new(host_id: &str, command: &str, log_file: String) -> Self {
        Self {
            task_id: new_task_id(),
            host_id: host_id.to_string(),
            command: command.to_string(),
            pid: None,
            log_file,
            started_at: Utc::now(),
            state: TaskState::Running,
        }
    }
}

pub fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4().simple())
}

/// Process-lifetime task table.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<BTreeMap<String, BackgroundTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: BackgroundTask) {
        self.tasks.lock().insert(task.task_id.clone(), task);
    }

    pub fn set_state(&self, task_id: &str, state: TaskState) {
        if let Some(task) = self.tasks.lock().get_mut(task_id) {
            task.state = state;
        }
    }

    pub fn get(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.lock().get(task_id).cloned()
    }

    pub fn list(&self) -> Vec<BackgroundTask> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count()
    }
}
