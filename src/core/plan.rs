//! JSON plan format: the tasks and milestones for one run.
//!
//! ```json
//! {
//!   "tasks": [
//!     {"task_id": "schema", "agent_id": "backend", "task_type": "db_schema"},
//!     {"task_id": "api", "task_type": "backend_route", "depends_on": ["schema"],
//!      "metadata": {"priority": "HIGH", "complexity": 7, "milestone_id": "beta"}}
//!   ],
//!   "milestones": [
//!     {"milestone_id": "beta", "name": "Beta", "estimated_duration": 3600}
//!   ]
//! }
//! ```

use crate::core::graph::TaskGraph;
use crate::core::task::{Task, TaskId, TaskMetadata};
use crate::error::{Error, Result};
use crate::estimation::critical_path::earliest_completion;
use crate::estimation::throughput::DurationEstimator;
use crate::milestone::Milestone;
use crate::util::offset_secs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A task as written in a plan or returned by an agent as follow-up work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    /// Left empty to route by task type.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskSpec {
    pub fn into_task(self) -> Task {
        let mut task = Task::new(
            self.task_id,
            self.agent_id.as_deref().unwrap_or_default(),
            &self.task_type,
        )
        .with_description(&self.description)
        .depends_on(self.depends_on);
        task.metadata = self.metadata;
        task
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub milestone_id: String,
    pub name: String,
    #[serde(default, alias = "tasks")]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Seconds after `start_time`; used when `estimated_completion` is absent.
    #[serde(default)]
    pub estimated_duration: Option<f64>,
}

impl MilestoneSpec {
    /// Resolve into a milestone. `fallback_secs` sets the window when the
    /// spec gives neither a completion time nor a duration.
    ///
    /// # Errors
    /// `Validation` when the duration puts the completion out of range.
    pub fn into_milestone(self, now: DateTime<Utc>, fallback_secs: f64) -> Result<Milestone> {
        let start = self.start_time.unwrap_or(now);
        let estimated_completion = match self.estimated_completion {
            Some(at) => at,
            None => {
                let secs = self.estimated_duration.unwrap_or(fallback_secs).max(0.0);
                offset_secs(start, secs).map_err(|_| {
                    Error::Validation(format!(
                        "milestone {} has an out-of-range duration ({}s)",
                        self.milestone_id, secs
                    ))
                })?
            }
        };
        Ok(
            Milestone::new(&self.milestone_id, &self.name, start, estimated_completion)
                .with_tasks(self.task_ids),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub milestones: Vec<MilestoneSpec>,
}

impl Plan {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Resolve milestones, estimating missing completion times from the
    /// latest earliest-completion among each milestone's tasks.
    pub fn resolve_milestones<E: DurationEstimator + ?Sized>(
        &self,
        graph: &TaskGraph,
        estimator: &E,
        now: DateTime<Utc>,
    ) -> Result<Vec<Milestone>> {
        let earliest = earliest_completion(graph, estimator)?;
        let tagged = |milestone_id: &str| {
            graph
                .tasks()
                .filter(|t| t.metadata.milestone_id.as_deref() == Some(milestone_id))
                .map(|t| t.task_id.clone())
                .collect::<Vec<_>>()
        };

        self.milestones
            .iter()
            .cloned()
            .map(|spec| {
                let mut members = spec.task_ids.clone();
                members.extend(tagged(&spec.milestone_id));
                let fallback = members
                    .iter()
                    .filter_map(|id| earliest.get(id))
                    .fold(0.0f64, |acc, &t| acc.max(t));
                spec.into_milestone(now, fallback)
            })
            .collect()
    }
}
