use thiserror::Error;

use crate::core::task::TaskId;

/// Errors raised while building or validating the task graph.
///
/// Graph errors are always fatal to a run: construction errors abort before
/// scheduling starts, and a deadlock aborts the dispatch loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("Adding task {task_id} would create a cycle through {}", join_ids(.via))]
    CycleDetected { task_id: TaskId, via: Vec<TaskId> },

    #[error("Deadlock: {} pending task(s) can never become ready ({})", .pending.len(), join_ids(.pending))]
    Deadlock { pending: Vec<TaskId> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id} from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: String,
        to: String,
    },
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("No agent registered for task {task_id} (agent: {agent_id})")]
    Routing { task_id: TaskId, agent_id: String },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Milestone error: {0}")]
    Milestone(String),

    #[error("Milestone not found: {0}")]
    MilestoneNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
