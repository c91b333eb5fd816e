//! Discrete-event simulation of concurrent execution, and the timeline
//! estimate built on it.
//!
//! The simulator advances a virtual clock in fixed ticks. Each agent works
//! on one task at a time; an idle agent takes the best ready task routed to
//! it (priority, then complexity, then insertion order). Tasks finish once
//! the clock has covered their estimated duration.

use crate::core::graph::TaskGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, GraphError, Result};
use crate::estimation::critical_path::{analyze_queue, QueueAnalysis};
use crate::estimation::throughput::DurationEstimator;
use crate::util::offset_secs;
use crate::{clog_debug, clog_trace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const HIGH_UTILIZATION: f64 = 0.9;
pub const MAX_DIRECT_DEPENDENCIES: usize = 3;
pub const HIGH_RESOURCE_USAGE: f64 = 0.8;

const EPSILON: f64 = 1e-9;

/// When one task ran in the simulation. Offsets are seconds from start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWindow {
    pub task_id: TaskId,
    pub agent_id: String,
    pub start: f64,
    pub end: f64,
}

/// Output of one simulation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    /// Seconds.
    pub total_duration: f64,
    /// busy_time / total_duration per agent.
    pub utilization: BTreeMap<String, f64>,
    /// In completion order.
    pub windows: Vec<TaskWindow>,
    /// Highest concurrent usage per resource.
    pub resource_peaks: BTreeMap<String, f64>,
}

struct InFlight<'a> {
    task: &'a Task,
    start: f64,
    duration: f64,
}

/// Pick the ready task for `agent_id` with the highest (priority, complexity),
/// first added on ties.
fn find_suitable_task(remaining: &[&Task], agent_id: &str, done: &HashSet<TaskId>) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (pos, task) in remaining.iter().enumerate() {
        if task.agent_id != agent_id || !task.depends_on.iter().all(|d| done.contains(d)) {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => {
                let current = remaining[b];
                match task.priority().cmp(&current.priority()) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => task.complexity() > current.complexity(),
                }
            }
        };
        if better {
            best = Some(pos);
        }
    }
    best
}

/// Run the simulation over every task that still has work to do.
///
/// Completed tasks count as done at time zero; Failed and Blocked tasks
/// are left out. Remaining tasks that can never start are a deadlock.
pub fn simulate<E: DurationEstimator + ?Sized>(
    graph: &TaskGraph,
    estimator: &E,
    tick: f64,
) -> Result<Simulation> {
    if tick <= 0.0 || !tick.is_finite() {
        return Err(Error::Validation(format!(
            "simulation tick must be positive, got {}",
            tick
        )));
    }

    let mut done: HashSet<TaskId> = graph
        .tasks()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.task_id.clone())
        .collect();
    let mut remaining: Vec<&Task> = graph
        .tasks()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
        .collect();
    let agents: BTreeSet<String> = remaining.iter().map(|t| t.agent_id.clone()).collect();

    let mut busy: BTreeMap<String, InFlight> = BTreeMap::new();
    let mut busy_time: BTreeMap<String, f64> = agents.iter().map(|a| (a.clone(), 0.0)).collect();
    let mut resource_peaks: BTreeMap<String, f64> = BTreeMap::new();
    let mut windows = Vec::new();
    let mut ticks: u64 = 0;

    loop {
        let clock = ticks as f64 * tick;

        for agent in &agents {
            if busy.contains_key(agent) {
                continue;
            }
            if let Some(pos) = find_suitable_task(&remaining, agent, &done) {
                let task = remaining.remove(pos);
                let duration = estimator.estimate_duration(task).max(0.0);
                clog_trace!("sim t={:.1}: {} starts {} ({:.1}s)", clock, agent, task.task_id, duration);
                busy.insert(
                    agent.clone(),
                    InFlight {
                        task,
                        start: clock,
                        duration,
                    },
                );
            }
        }

        if busy.is_empty() {
            if remaining.is_empty() {
                break;
            }
            return Err(GraphError::Deadlock {
                pending: remaining.iter().map(|t| t.task_id.clone()).collect(),
            }
            .into());
        }

        let mut usage: BTreeMap<&str, f64> = BTreeMap::new();
        for flight in busy.values() {
            for (resource, amount) in &flight.task.metadata.resource_requirements {
                *usage.entry(resource.as_str()).or_insert(0.0) += amount;
            }
        }
        for (resource, amount) in usage {
            let peak = resource_peaks.entry(resource.to_string()).or_insert(0.0);
            *peak = peak.max(amount);
        }

        ticks += 1;
        let clock = ticks as f64 * tick;

        let finished: Vec<String> = busy
            .iter()
            .filter(|(_, f)| clock - f.start + EPSILON >= f.duration)
            .map(|(agent, _)| agent.clone())
            .collect();
        for agent in finished {
            if let Some(flight) = busy.remove(&agent) {
                if let Some(total) = busy_time.get_mut(&agent) {
                    *total += clock - flight.start;
                }
                done.insert(flight.task.task_id.clone());
                windows.push(TaskWindow {
                    task_id: flight.task.task_id.clone(),
                    agent_id: agent,
                    start: flight.start,
                    end: clock,
                });
            }
        }
    }

    let total_duration = ticks as f64 * tick;
    let utilization = busy_time
        .into_iter()
        .map(|(agent, busy)| {
            let u = if total_duration > 0.0 { busy / total_duration } else { 0.0 };
            (agent, u)
        })
        .collect();

    clog_debug!(
        "Simulated {} task(s) over {:.1}s in {} tick(s)",
        windows.len(),
        total_duration,
        ticks
    );

    Ok(Simulation {
        total_duration,
        utilization,
        windows,
        resource_peaks,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// Something in the projected schedule likely to cause slippage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RiskFactor {
    HighUtilization { agent_id: String, utilization: f64 },
    ComplexDependencies { task_id: TaskId, dependencies: usize },
    ResourceConstraint { resource: String, peak: f64 },
}

impl RiskFactor {
    pub fn severity(&self) -> Severity {
        match self {
            RiskFactor::ComplexDependencies { .. } => Severity::Medium,
            _ => Severity::High,
        }
    }

    pub fn description(&self) -> String {
        match self {
            RiskFactor::HighUtilization {
                agent_id,
                utilization,
            } => format!(
                "Agent {} has high utilization ({:.1}%)",
                agent_id,
                utilization * 100.0
            ),
            RiskFactor::ComplexDependencies {
                task_id,
                dependencies,
            } => format!("Task {} has many dependencies ({})", task_id, dependencies),
            RiskFactor::ResourceConstraint { resource, peak } => format!(
                "Resource {} has high peak usage ({:.1}%)",
                resource,
                peak * 100.0
            ),
        }
    }
}

pub fn identify_risks(graph: &TaskGraph, simulation: &Simulation) -> Vec<RiskFactor> {
    let mut risks = Vec::new();

    for (agent_id, &utilization) in &simulation.utilization {
        if utilization > HIGH_UTILIZATION {
            risks.push(RiskFactor::HighUtilization {
                agent_id: agent_id.clone(),
                utilization,
            });
        }
    }

    for task in graph.tasks() {
        if task.depends_on.len() > MAX_DIRECT_DEPENDENCIES {
            risks.push(RiskFactor::ComplexDependencies {
                task_id: task.task_id.clone(),
                dependencies: task.depends_on.len(),
            });
        }
    }

    for (resource, &peak) in &simulation.resource_peaks {
        if peak > HIGH_RESOURCE_USAGE {
            risks.push(RiskFactor::ResourceConstraint {
                resource: resource.clone(),
                peak,
            });
        }
    }

    risks
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub at: DateTime<Utc>,
    pub tasks_completed: usize,
    pub total_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: TaskId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
}

/// Simulation results placed on the calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub checkpoints: Vec<Checkpoint>,
    pub agent_schedules: BTreeMap<String, Vec<ScheduledTask>>,
}

impl Timeline {
    /// # Errors
    /// `Validation` when a projected time falls outside chrono's range.
    pub fn from_simulation(simulation: &Simulation, start: DateTime<Utc>) -> Result<Self> {
        let end = offset_secs(start, simulation.total_duration)?;
        let total_tasks = simulation.windows.len();

        let mut checkpoints = vec![Checkpoint {
            name: "Project Start".to_string(),
            at: start,
            tasks_completed: 0,
            total_tasks,
        }];
        // Windows are already in completion order.
        for pct in [25usize, 50, 75] {
            let target = total_tasks * pct / 100;
            if target == 0 {
                continue;
            }
            if let Some(window) = simulation.windows.get(target - 1) {
                checkpoints.push(Checkpoint {
                    name: format!("{}% Complete", pct),
                    at: offset_secs(start, window.end)?,
                    tasks_completed: target,
                    total_tasks,
                });
            }
        }
        checkpoints.push(Checkpoint {
            name: "Project Completion".to_string(),
            at: end,
            tasks_completed: total_tasks,
            total_tasks,
        });

        let mut agent_schedules: BTreeMap<String, Vec<ScheduledTask>> = BTreeMap::new();
        for window in &simulation.windows {
            let scheduled = ScheduledTask {
                task_id: window.task_id.clone(),
                start: offset_secs(start, window.start)?,
                end: offset_secs(start, window.end)?,
                duration: window.end - window.start,
            };
            agent_schedules
                .entry(window.agent_id.clone())
                .or_default()
                .push(scheduled);
        }

        Ok(Self {
            start,
            end,
            checkpoints,
            agent_schedules,
        })
    }
}

/// Everything the estimator reports about a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEstimate {
    pub generated_at: DateTime<Utc>,
    /// Simulated seconds until every task finishes.
    pub total_duration: f64,
    pub queue: QueueAnalysis,
    pub utilization: BTreeMap<String, f64>,
    pub timeline: Timeline,
    pub risk_factors: Vec<RiskFactor>,
}

/// Runs the critical-path analysis and the simulator together.
#[derive(Debug, Clone)]
pub struct CriticalPathEstimator {
    /// Simulation tick in seconds.
    tick: f64,
}

impl Default for CriticalPathEstimator {
    fn default() -> Self {
        Self { tick: 1.0 }
    }
}

impl CriticalPathEstimator {
    pub fn new(tick: f64) -> Self {
        Self { tick }
    }

    pub fn estimate<E: DurationEstimator + ?Sized>(
        &self,
        graph: &TaskGraph,
        estimator: &E,
        now: DateTime<Utc>,
    ) -> Result<TimelineEstimate> {
        let queue = analyze_queue(graph, estimator)?;
        let simulation = simulate(graph, estimator, self.tick)?;
        let timeline = Timeline::from_simulation(&simulation, now)?;
        let risk_factors = identify_risks(graph, &simulation);

        Ok(TimelineEstimate {
            generated_at: now,
            total_duration: simulation.total_duration,
            queue,
            utilization: simulation.utilization,
            timeline,
            risk_factors,
        })
    }
}
