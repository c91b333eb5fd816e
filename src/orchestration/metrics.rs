//! Metrics sink injected into the scheduler.
//!
//! Every attempt is reported, successful or not. Terminal outcomes are
//! reported once more as a [`TaskCompletion`].

use crate::core::task::TaskId;
use crate::estimation::throughput::TaskCompletion;
use crate::clog_debug;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptStatus {
    Pass,
    Fail,
}

/// One dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptMetric {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub task_id: TaskId,
    pub task_type: String,
    pub status: AttemptStatus,
    pub duration_ms: f64,
    /// Retries made before this attempt.
    pub retries_attempted: u32,
    /// Set once a task has been retried: whether the retries paid off.
    pub retry_success: Option<bool>,
    /// Backoff in effect, once a task has been retried.
    pub retry_strategy: Option<String>,
    pub error_type: Option<String>,
}

pub trait MetricsSink: Send + Sync {
    fn record_attempt(&self, metric: &AttemptMetric);

    fn record_completion(&self, _completion: &TaskCompletion) {}
}

/// Writes metrics to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record_attempt(&self, metric: &AttemptMetric) {
        clog_debug!(
            "metric agent={} task={} type={} status={:?} ms={:.0} retries={} retry_success={:?}",
            metric.agent_id,
            metric.task_id,
            metric.task_type,
            metric.status,
            metric.duration_ms,
            metric.retries_attempted,
            metric.retry_success
        );
    }

    fn record_completion(&self, completion: &TaskCompletion) {
        clog_debug!(
            "completion task={} agent={} success={} actual={:.1}s estimated={:.1}s",
            completion.task_id,
            completion.agent_id,
            completion.success,
            completion.actual_duration,
            completion.estimated_duration
        );
    }
}

/// Keeps metrics in memory. Useful for tests and for summaries.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    attempts: Mutex<Vec<AttemptMetric>>,
    completions: Mutex<Vec<TaskCompletion>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<AttemptMetric> {
        match self.attempts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn completions(&self) -> Vec<TaskCompletion> {
        match self.completions.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn attempts_for(&self, task_id: &TaskId) -> Vec<AttemptMetric> {
        self.attempts()
            .into_iter()
            .filter(|m| &m.task_id == task_id)
            .collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn record_attempt(&self, metric: &AttemptMetric) {
        match self.attempts.lock() {
            Ok(mut guard) => guard.push(metric.clone()),
            Err(poisoned) => poisoned.into_inner().push(metric.clone()),
        }
    }

    fn record_completion(&self, completion: &TaskCompletion) {
        match self.completions.lock() {
            Ok(mut guard) => guard.push(completion.clone()),
            Err(poisoned) => poisoned.into_inner().push(completion.clone()),
        }
    }
}
