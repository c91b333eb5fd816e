//! Milestone progress and delay detection.
//!
//! A milestone is a named group of tasks with a start time and an
//! estimated completion. Progress is the fraction of member tasks that
//! have Completed, recomputed whenever a member reaches a terminal state.
//! A milestone is Delayed while its progress trails the time-based
//! expectation by more than the configured margin.

use crate::core::graph::TaskGraph;
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::state::StateStore;
use crate::{clog, clog_debug, clog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Pending,
    InProgress,
    Delayed,
    Completed,
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Delayed => "delayed",
            MilestoneStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: String,
    pub name: String,
    /// Ordered, duplicate-free.
    #[serde(alias = "tasks")]
    pub task_ids: Vec<TaskId>,
    pub start_time: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    #[serde(default)]
    pub actual_completion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MilestoneStatus,
    /// Fraction of member tasks Completed, in [0, 1].
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub delay_reason: Option<String>,
}

impl Milestone {
    pub fn new(
        milestone_id: &str,
        name: &str,
        start_time: DateTime<Utc>,
        estimated_completion: DateTime<Utc>,
    ) -> Self {
        Self {
            milestone_id: milestone_id.to_string(),
            name: name.to_string(),
            task_ids: Vec::new(),
            start_time,
            estimated_completion,
            actual_completion: None,
            status: MilestoneStatus::Pending,
            progress: 0.0,
            delay_reason: None,
        }
    }

    pub fn with_tasks<I, T>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        for task in tasks {
            self.add_task(task.into());
        }
        self
    }

    fn add_task(&mut self, task_id: TaskId) -> bool {
        if self.task_ids.contains(&task_id) {
            return false;
        }
        self.task_ids.push(task_id);
        true
    }

    /// Completed members over all members. An empty milestone has no progress.
    pub fn progress_in(&self, graph: &TaskGraph) -> f64 {
        if self.task_ids.is_empty() {
            return 0.0;
        }
        self.completed_in(graph) as f64 / self.task_ids.len() as f64
    }

    fn completed_in(&self, graph: &TaskGraph) -> usize {
        self.task_ids
            .iter()
            .filter(|id| {
                graph
                    .get_task(id)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Share of the planned window that has elapsed at `now`, in [0, 1].
    pub fn expected_progress(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.estimated_completion - self.start_time).num_milliseconds();
        let elapsed = (now - self.start_time).num_milliseconds();
        if total <= 0 {
            return if now >= self.estimated_completion { 1.0 } else { 0.0 };
        }
        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn is_completed(&self) -> bool {
        self.status == MilestoneStatus::Completed
    }
}

/// Notification payloads produced by milestone transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MilestoneEvent {
    Update {
        milestone_id: String,
        name: String,
        status: MilestoneStatus,
        progress: f64,
        tasks_completed: usize,
        total_tasks: usize,
        delay_reason: Option<String>,
    },
    Delay {
        milestone_id: String,
        name: String,
        progress: f64,
        expected_progress: f64,
        reason: String,
    },
}

impl MilestoneEvent {
    pub fn milestone_id(&self) -> &str {
        match self {
            MilestoneEvent::Update { milestone_id, .. } => milestone_id,
            MilestoneEvent::Delay { milestone_id, .. } => milestone_id,
        }
    }
}

impl std::fmt::Display for MilestoneEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MilestoneEvent::Update {
                name,
                status,
                progress,
                tasks_completed,
                total_tasks,
                delay_reason,
                ..
            } => {
                write!(
                    f,
                    "Milestone Update: {} [{}] {:.1}% ({}/{} tasks)",
                    name,
                    status,
                    progress * 100.0,
                    tasks_completed,
                    total_tasks
                )?;
                if let Some(reason) = delay_reason {
                    write!(f, " delay reason: {}", reason)?;
                }
                Ok(())
            }
            MilestoneEvent::Delay {
                name,
                progress,
                expected_progress,
                reason,
                ..
            } => write!(
                f,
                "Milestone Delay Alert: {} at {:.1}% (expected {:.1}%): {}",
                name,
                progress * 100.0,
                expected_progress * 100.0,
                reason
            ),
        }
    }
}

/// When a milestone counts as slipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRule {
    /// How far progress may trail the expectation before the milestone is Delayed.
    pub margin: f64,
}

impl Default for DelayRule {
    fn default() -> Self {
        Self { margin: 0.5 }
    }
}

impl DelayRule {
    pub fn is_delayed(&self, progress: f64, expected: f64) -> bool {
        expected - progress > self.margin
    }
}

/// Owns milestones and keeps their progress and status current.
#[derive(Debug, Default)]
pub struct MilestoneTracker {
    milestones: Vec<Milestone>,
    rule: DelayRule,
    store: Option<StateStore>,
}

impl MilestoneTracker {
    pub fn new(rule: DelayRule) -> Self {
        Self {
            milestones: Vec::new(),
            rule,
            store: None,
        }
    }

    /// Persist every change through `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Tracker seeded with the milestones already persisted in `store`,
    /// writing changes back through it.
    pub fn restore(rule: DelayRule, store: StateStore) -> Result<Self> {
        let milestones = store.load_milestones()?;
        clog_debug!(
            "Restored {} milestone(s) from {}",
            milestones.len(),
            store.dir().display()
        );
        Ok(Self {
            milestones,
            rule,
            store: Some(store),
        })
    }

    /// Add a milestone, replacing a tracked one with the same id.
    pub fn upsert_milestone(&mut self, milestone: Milestone) {
        match self.get_mut(&milestone.milestone_id) {
            Some(existing) => {
                clog_debug!("Replacing milestone {}", milestone.milestone_id);
                *existing = milestone;
            }
            None => self.milestones.push(milestone),
        }
    }

    pub fn add_milestone(&mut self, milestone: Milestone) -> Result<()> {
        if self.get(&milestone.milestone_id).is_some() {
            return Err(Error::Milestone(format!(
                "duplicate milestone id: {}",
                milestone.milestone_id
            )));
        }
        clog_debug!(
            "Tracking milestone {} with {} task(s)",
            milestone.milestone_id,
            milestone.task_ids.len()
        );
        self.milestones.push(milestone);
        Ok(())
    }

    /// Add a task to a milestone. Attaching twice is a no-op.
    pub fn attach_task(&mut self, milestone_id: &str, task_id: TaskId) -> Result<()> {
        let milestone = self
            .get_mut(milestone_id)
            .ok_or_else(|| Error::MilestoneNotFound(milestone_id.to_string()))?;
        if milestone.is_completed() {
            return Err(Error::Milestone(format!(
                "milestone {} is already completed",
                milestone_id
            )));
        }
        milestone.add_task(task_id);
        Ok(())
    }

    pub fn get(&self, milestone_id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.milestone_id == milestone_id)
    }

    fn get_mut(&mut self, milestone_id: &str) -> Option<&mut Milestone> {
        self.milestones
            .iter_mut()
            .find(|m| m.milestone_id == milestone_id)
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn is_empty(&self) -> bool {
        self.milestones.is_empty()
    }

    pub fn progress(&self, milestone_id: &str, graph: &TaskGraph) -> Result<f64> {
        self.get(milestone_id)
            .map(|m| m.progress_in(graph))
            .ok_or_else(|| Error::MilestoneNotFound(milestone_id.to_string()))
    }

    pub fn expected_progress(&self, milestone_id: &str, now: DateTime<Utc>) -> Result<f64> {
        self.get(milestone_id)
            .map(|m| m.expected_progress(now))
            .ok_or_else(|| Error::MilestoneNotFound(milestone_id.to_string()))
    }

    /// Pending milestones containing `task_id` move to InProgress.
    pub fn on_task_started(&mut self, task_id: &TaskId, graph: &TaskGraph) -> Vec<MilestoneEvent> {
        let mut events = Vec::new();
        for milestone in self.milestones.iter_mut() {
            if milestone.status == MilestoneStatus::Pending && milestone.task_ids.contains(task_id) {
                milestone.status = MilestoneStatus::InProgress;
                clog!("Milestone {} in progress", milestone.milestone_id);
                events.push(update_event(milestone, graph));
            }
        }
        events
    }

    /// Recompute every milestone containing `task_id` after it reached a
    /// terminal state at `now`.
    pub fn on_task_terminal(
        &mut self,
        task_id: &TaskId,
        graph: &TaskGraph,
        now: DateTime<Utc>,
    ) -> Vec<MilestoneEvent> {
        let rule = self.rule;
        let mut events = Vec::new();
        for milestone in self.milestones.iter_mut() {
            if milestone.is_completed() || !milestone.task_ids.contains(task_id) {
                continue;
            }
            let before = (milestone.status, milestone.progress);
            milestone.progress = milestone.progress_in(graph);
            if milestone.status == MilestoneStatus::Pending {
                milestone.status = MilestoneStatus::InProgress;
            }

            if milestone.progress >= 1.0 {
                milestone.progress = 1.0;
                milestone.status = MilestoneStatus::Completed;
                milestone.actual_completion = Some(now);
                milestone.delay_reason = None;
                clog!("Milestone {} completed", milestone.milestone_id);
                events.push(update_event(milestone, graph));
                continue;
            }

            let delay = evaluate_delay(milestone, rule, graph, now);
            let changed = before != (milestone.status, milestone.progress);
            if changed && delay.is_none() {
                events.push(update_event(milestone, graph));
            }
            events.extend(delay);
        }
        events
    }

    /// Re-evaluate slippage for every open milestone at `now`. Milestones
    /// with no member in `graph` belong to another run and are left as is.
    pub fn check_delays(&mut self, graph: &TaskGraph, now: DateTime<Utc>) -> Vec<MilestoneEvent> {
        let rule = self.rule;
        let mut events = Vec::new();
        for milestone in self.milestones.iter_mut() {
            if milestone.is_completed()
                || !milestone.task_ids.iter().any(|id| graph.contains_task(id))
            {
                continue;
            }
            milestone.progress = milestone.progress_in(graph);
            let before = milestone.status;
            let delay = evaluate_delay(milestone, rule, graph, now);
            if delay.is_none() && before != milestone.status {
                events.push(update_event(milestone, graph));
            }
            events.extend(delay);
        }
        events
    }

    /// Write the current milestone state through the store, if one is set.
    pub fn persist(&self) -> Result<()> {
        match &self.store {
            Some(store) => store
                .save_milestones(&self.milestones)
                .map_err(|e| Error::Milestone(format!("failed to persist milestones: {}", e))),
            None => Ok(()),
        }
    }
}

fn update_event(milestone: &Milestone, graph: &TaskGraph) -> MilestoneEvent {
    MilestoneEvent::Update {
        milestone_id: milestone.milestone_id.clone(),
        name: milestone.name.clone(),
        status: milestone.status,
        progress: milestone.progress,
        tasks_completed: milestone.completed_in(graph),
        total_tasks: milestone.task_ids.len(),
        delay_reason: milestone.delay_reason.clone(),
    }
}

/// Apply the delay rule. Returns a Delay event on entering Delayed; a
/// milestone that recovers goes back to InProgress silently here and the
/// caller reports the status change.
fn evaluate_delay(
    milestone: &mut Milestone,
    rule: DelayRule,
    graph: &TaskGraph,
    now: DateTime<Utc>,
) -> Option<MilestoneEvent> {
    let expected = milestone.expected_progress(now);
    if rule.is_delayed(milestone.progress, expected) {
        let total = milestone.task_ids.len();
        let behind = total - milestone.completed_in(graph);
        let reason = format!(
            "{} of {} tasks behind their individual estimates (progress {:.1}%, expected {:.1}%)",
            behind,
            total,
            milestone.progress * 100.0,
            expected * 100.0
        );
        let entering = milestone.status != MilestoneStatus::Delayed;
        milestone.status = MilestoneStatus::Delayed;
        milestone.delay_reason = Some(reason.clone());
        if entering {
            clog_warn!("Milestone {} delayed: {}", milestone.milestone_id, reason);
            return Some(MilestoneEvent::Delay {
                milestone_id: milestone.milestone_id.clone(),
                name: milestone.name.clone(),
                progress: milestone.progress,
                expected_progress: expected,
                reason,
            });
        }
    } else if milestone.status == MilestoneStatus::Delayed {
        clog!("Milestone {} back on track", milestone.milestone_id);
        milestone.status = MilestoneStatus::InProgress;
        milestone.delay_reason = None;
    }
    None
}
