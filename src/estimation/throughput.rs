//! Per-agent throughput statistics and duration estimates.

use crate::core::task::{Task, TaskId, DEFAULT_COMPLEXITY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Historical record of one terminal task outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub agent_id: String,
    /// Seconds.
    pub estimated_duration: f64,
    /// Seconds, from first start to terminal transition.
    pub actual_duration: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub complexity: f64,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub success: bool,
    #[serde(default)]
    pub notes: String,
}

impl TaskCompletion {
    /// `1 - |actual - estimated| / estimated`, when there was an estimate.
    pub fn accuracy(&self) -> Option<f64> {
        if self.estimated_duration > 0.0 {
            Some(1.0 - (self.actual_duration - self.estimated_duration).abs() / self.estimated_duration)
        } else {
            None
        }
    }
}

/// Running statistics for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThroughput {
    /// Seconds.
    pub average_duration: f64,
    pub tasks_per_minute: f64,
    pub total_tasks: u64,
    pub last_update: DateTime<Utc>,
}

impl AgentThroughput {
    fn rate(average_duration: f64) -> f64 {
        if average_duration > 0.0 {
            60.0 / average_duration
        } else {
            0.0
        }
    }
}

/// One entry of an agent's persisted completion history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSample {
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    /// Seconds. Absent in history written before durations were kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Persisted per-agent history: accuracy plus the durations that warm the
/// tracker on the next run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHistory {
    /// Empty in files written before the id was stored.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub total_tasks: u64,
    pub average_accuracy: f64,
    #[serde(default)]
    pub completion_times: Vec<CompletionSample>,
    #[serde(default)]
    pub patterns: BTreeMap<String, serde_json::Value>,
}

impl AgentHistory {
    /// Fold one completion in. Completions without an estimate leave the
    /// accuracy average untouched.
    pub fn record(&mut self, completion: &TaskCompletion) {
        let accuracy = completion.accuracy();
        let scored = self
            .completion_times
            .iter()
            .filter(|s| s.accuracy.is_some())
            .count() as f64;
        if self.agent_id.is_empty() {
            self.agent_id = completion.agent_id.clone();
        }
        if let Some(acc) = accuracy {
            self.average_accuracy = (self.average_accuracy * scored + acc) / (scored + 1.0);
        }
        self.total_tasks += 1;
        self.completion_times.push(CompletionSample {
            timestamp: completion.end_time,
            accuracy,
            duration: Some(completion.actual_duration),
        });
    }

    /// Mean of the recorded durations, if any were kept.
    pub fn average_duration(&self) -> Option<(f64, u64)> {
        let durations: Vec<f64> = self
            .completion_times
            .iter()
            .filter_map(|s| s.duration)
            .collect();
        if durations.is_empty() {
            return None;
        }
        let n = durations.len();
        Some((durations.iter().sum::<f64>() / n as f64, n as u64))
    }
}

/// Anything that can put a duration on a task.
pub trait DurationEstimator {
    /// Seconds.
    fn estimate_duration(&self, task: &Task) -> f64;
}

impl<F> DurationEstimator for F
where
    F: Fn(&Task) -> f64,
{
    fn estimate_duration(&self, task: &Task) -> f64 {
        self(task)
    }
}

/// Tracks average task duration per agent.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    /// Seconds, used for agents with no history.
    default_duration: f64,
    agents: HashMap<String, AgentThroughput>,
}

impl ThroughputTracker {
    pub fn new(default_duration: f64) -> Self {
        Self {
            default_duration,
            agents: HashMap::new(),
        }
    }

    /// Warm a tracker from persisted histories.
    pub fn from_histories(default_duration: f64, histories: &HashMap<String, AgentHistory>) -> Self {
        let mut tracker = Self::new(default_duration);
        for (agent_id, history) in histories {
            if let Some((average_duration, total_tasks)) = history.average_duration() {
                let last_update = history
                    .completion_times
                    .last()
                    .map(|s| s.timestamp)
                    .unwrap_or_else(Utc::now);
                tracker.agents.insert(
                    agent_id.clone(),
                    AgentThroughput {
                        average_duration,
                        tasks_per_minute: AgentThroughput::rate(average_duration),
                        total_tasks,
                        last_update,
                    },
                );
            }
        }
        tracker
    }

    pub fn default_duration(&self) -> f64 {
        self.default_duration
    }

    /// Fold a completion into its agent's cumulative mean.
    pub fn record(&mut self, completion: &TaskCompletion) {
        let duration = completion.actual_duration.max(0.0);
        let stats = self
            .agents
            .entry(completion.agent_id.clone())
            .or_insert(AgentThroughput {
                average_duration: 0.0,
                tasks_per_minute: 0.0,
                total_tasks: 0,
                last_update: completion.end_time,
            });

        stats.total_tasks += 1;
        let n = stats.total_tasks as f64;
        stats.average_duration = (stats.average_duration * (n - 1.0) + duration) / n;
        stats.tasks_per_minute = AgentThroughput::rate(stats.average_duration);
        stats.last_update = completion.end_time;
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentThroughput> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = (&String, &AgentThroughput)> {
        self.agents.iter()
    }

    /// Seconds per task for an agent before complexity scaling.
    pub fn base_duration(&self, agent_id: &str) -> f64 {
        match self.agents.get(agent_id) {
            Some(stats) if stats.tasks_per_minute > 0.0 => 60.0 / stats.tasks_per_minute,
            _ => self.default_duration,
        }
    }
}

impl DurationEstimator for ThroughputTracker {
    fn estimate_duration(&self, task: &Task) -> f64 {
        self.base_duration(&task.agent_id) * (task.complexity() / DEFAULT_COMPLEXITY)
    }
}
