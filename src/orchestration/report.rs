//! Final run report.

use crate::core::task::TaskId;
use crate::milestone::Milestone;
use crate::orchestration::retry::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub agent_id: String,
    pub error: String,
    /// `fatal`, `max_retries_exceeded` or `routing`.
    pub error_type: String,
    pub error_class: ErrorClass,
    /// Error type of the last attempt.
    pub cause: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: TaskId,
    pub reason: String,
}

/// A follow-up task an agent asked for that could not be added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTask {
    pub task_id: TaskId,
    pub parent: TaskId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In completion order.
    pub completed: Vec<TaskId>,
    pub failed: Vec<FailedTask>,
    pub blocked: Vec<BlockedTask>,
    /// Tasks still Pending or Running when the run stopped early.
    pub unfinished: Vec<TaskId>,
    pub rejected: Vec<RejectedTask>,
    pub milestones: Vec<Milestone>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.failed.is_empty()
            && self.blocked.is_empty()
            && self.unfinished.is_empty()
    }

    pub fn failed_task(&self, task_id: &TaskId) -> Option<&FailedTask> {
        self.failed.iter().find(|f| &f.task_id == task_id)
    }

    pub fn is_blocked(&self, task_id: &TaskId) -> bool {
        self.blocked.iter().any(|b| &b.task_id == task_id)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        writeln!(f, "Run {} ({:.1}s)", self.run_id, secs)?;
        if self.cancelled {
            writeln!(f, "  CANCELLED")?;
        }
        writeln!(f, "  Completed: {}", self.completed.len())?;
        for id in &self.completed {
            writeln!(f, "    {}", id)?;
        }
        writeln!(f, "  Failed: {}", self.failed.len())?;
        for t in &self.failed {
            writeln!(
                f,
                "    {} [{}] {} ({}, {}, {} attempt(s)): {}",
                t.task_id, t.agent_id, t.error_type, t.error_class, t.cause, t.attempts, t.error
            )?;
        }
        writeln!(f, "  Blocked: {}", self.blocked.len())?;
        for t in &self.blocked {
            writeln!(f, "    {}: {}", t.task_id, t.reason)?;
        }
        if !self.unfinished.is_empty() {
            writeln!(f, "  Unfinished: {}", self.unfinished.len())?;
        }
        for r in &self.rejected {
            writeln!(f, "  Rejected follow-up {} from {}: {}", r.task_id, r.parent, r.error)?;
        }
        if !self.milestones.is_empty() {
            writeln!(f, "  Milestones:")?;
            for m in &self.milestones {
                write!(f, "    {} [{}] {:.0}%", m.name, m.status, m.progress * 100.0)?;
                if let Some(reason) = &m.delay_reason {
                    write!(f, " - {}", reason)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
