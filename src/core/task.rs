//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work routed to agents. Each task tracks
//! its target agent, dependencies, scheduling metadata, status, timing,
//! and final result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Neutral complexity on the 1-10 scale.
pub const DEFAULT_COMPLEXITY: f64 = 5.0;

/// Unique identifier for a task within a graph.
///
/// Task ids are caller-chosen strings so that plans can name their
/// dependencies before every task exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
///
/// `Completed`, `Failed` and `Blocked` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created, waiting for its dependencies or a free lane.
    #[default]
    Pending,
    /// Task dispatched to its agent (including retry back-off).
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed terminally.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task can never run because a dependency failed.
    Blocked {
        /// Which upstream failure caused the block.
        reason: String,
    },
}

impl TaskStatus {
    /// Short name without payload, for logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// Scheduling priority. Higher runs first.
///
/// Deserializes from an integer or one of `LOW`, `MEDIUM`, `HIGH`, `CRITICAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(2);
    pub const HIGH: Priority = Priority(3);
    pub const CRITICAL: Priority = Priority(4);

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(Self::LOW),
            "MEDIUM" | "NORMAL" => Some(Self::MEDIUM),
            "HIGH" => Some(Self::HIGH),
            "CRITICAL" | "URGENT" => Some(Self::CRITICAL),
            other => other.parse::<i64>().ok().map(Priority),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Priority(n)),
            Raw::Name(name) => Priority::parse(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown priority: {}", name))),
        }
    }
}

/// Open key/value metadata attached to a task.
///
/// The keys the scheduler and estimator understand are typed fields;
/// everything else is carried through to the agent untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub priority: Priority,
    /// Complexity on a 1-10 scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
    /// Caller's own estimate, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,
    /// Fraction of each named resource the task occupies while running.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_requirements: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Final outcome of a task, as reported in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskResult {
    Success {
        #[serde(default)]
        details: serde_json::Value,
    },
    Error {
        error: String,
        error_type: String,
        attempts: u32,
        retry_strategy: String,
    },
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    /// Executor this task is routed to.
    pub agent_id: String,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    /// Ordered, duplicate-free dependency ids.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Number of dispatch attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    pub result: Option<TaskResult>,
}

impl Task {
    /// Create a pending task with no dependencies and default metadata.
    pub fn new(task_id: impl Into<TaskId>, agent_id: &str, task_type: &str) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.to_string(),
            task_type: task_type.to_string(),
            description: String::new(),
            depends_on: Vec::new(),
            metadata: TaskMetadata::default(),
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            attempts: 0,
            result: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add dependencies, skipping ids already present.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.metadata.complexity = Some(complexity);
        self
    }

    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.metadata.estimated_duration = Some(secs);
        self
    }

    pub fn with_milestone(mut self, milestone_id: &str) -> Self {
        self.metadata.milestone_id = Some(milestone_id.to_string());
        self
    }

    pub fn with_resource(mut self, resource: &str, share: f64) -> Self {
        self.metadata
            .resource_requirements
            .insert(resource.to_string(), share);
        self
    }

    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }

    /// Complexity clamped into 1-10; absent or non-finite values are neutral.
    pub fn complexity(&self) -> f64 {
        match self.metadata.complexity {
            Some(c) if c.is_finite() => c.clamp(1.0, 10.0),
            _ => DEFAULT_COMPLEXITY,
        }
    }

    /// Transition to Running. The first start time is kept across retries.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, details: serde_json::Value) {
        self.status = TaskStatus::Completed;
        self.end_time = Some(Utc::now());
        self.result = Some(TaskResult::Success { details });
    }

    pub fn fail(&mut self, result: TaskResult) {
        let error = match &result {
            TaskResult::Error { error, .. } => error.clone(),
            TaskResult::Success { .. } => "unknown error".to_string(),
        };
        self.status = TaskStatus::Failed { error };
        self.end_time = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock seconds between first start and end, if both are known.
    pub fn elapsed_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(crate::util::elapsed_secs(start, end)),
            _ => None,
        }
    }
}
