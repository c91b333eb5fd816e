//! Earliest-completion times, the critical path, and queue analysis.

use crate::core::graph::TaskGraph;
use crate::core::task::TaskId;
use crate::error::GraphError;
use crate::estimation::throughput::DurationEstimator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The longest dependency chain by estimated duration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// First task to last.
    pub tasks: Vec<TaskId>,
    /// Seconds.
    pub total_duration: f64,
}

/// Earliest finish time (seconds from start) of every task, assuming
/// unlimited parallelism.
///
/// Dependencies that are not in the graph do not contribute.
pub fn earliest_completion<E: DurationEstimator + ?Sized>(
    graph: &TaskGraph,
    estimator: &E,
) -> Result<HashMap<TaskId, f64>, GraphError> {
    let mut earliest: HashMap<TaskId, f64> = HashMap::with_capacity(graph.task_count());
    for task in graph.topological_order()? {
        let own = estimator.estimate_duration(task).max(0.0);
        let after = task
            .depends_on
            .iter()
            .filter_map(|dep| earliest.get(dep))
            .fold(0.0f64, |acc, &t| acc.max(t));
        earliest.insert(task.task_id.clone(), own + after);
    }
    Ok(earliest)
}

/// Reconstruct the chain that produced the largest earliest-completion time.
///
/// Starts from the task with the maximum value and repeatedly steps to the
/// dependency with the largest value. Ties go to the task added first (for
/// the end of the chain) or listed first (for dependencies).
pub fn critical_path(graph: &TaskGraph, earliest: &HashMap<TaskId, f64>) -> CriticalPath {
    let mut end: Option<(&TaskId, f64)> = None;
    for task in graph.tasks() {
        if let Some(&t) = earliest.get(&task.task_id) {
            if end.map_or(true, |(_, best)| t > best) {
                end = Some((&task.task_id, t));
            }
        }
    }

    let Some((end_id, total_duration)) = end else {
        return CriticalPath::default();
    };

    let mut chain = vec![end_id.clone()];
    let mut cursor = end_id;
    while let Some(task) = graph.get_task(cursor) {
        let mut next: Option<(&TaskId, f64)> = None;
        for dep in &task.depends_on {
            if let Some(&t) = earliest.get(dep) {
                if next.map_or(true, |(_, best)| t > best) {
                    next = Some((dep, t));
                }
            }
        }
        match next {
            Some((dep, _)) => {
                chain.push(dep.clone());
                cursor = dep;
            }
            None => break,
        }
    }
    chain.reverse();

    CriticalPath {
        tasks: chain,
        total_duration,
    }
}

/// Summary of the work queued in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueAnalysis {
    pub total_tasks: usize,
    pub task_types: BTreeMap<String, usize>,
    /// Task count per agent.
    pub agent_workload: BTreeMap<String, usize>,
    /// Summed requirement per resource.
    pub resource_requirements: BTreeMap<String, f64>,
    pub dependency_chains: Vec<Vec<TaskId>>,
    pub critical_path: CriticalPath,
}

pub fn analyze_queue<E: DurationEstimator + ?Sized>(
    graph: &TaskGraph,
    estimator: &E,
) -> Result<QueueAnalysis, GraphError> {
    let mut task_types = BTreeMap::new();
    let mut agent_workload = BTreeMap::new();
    let mut resource_requirements = BTreeMap::new();

    for task in graph.tasks() {
        *task_types.entry(task.task_type.clone()).or_insert(0) += 1;
        *agent_workload.entry(task.agent_id.clone()).or_insert(0) += 1;
        for (resource, amount) in &task.metadata.resource_requirements {
            *resource_requirements.entry(resource.clone()).or_insert(0.0) += amount;
        }
    }

    let earliest = earliest_completion(graph, estimator)?;

    Ok(QueueAnalysis {
        total_tasks: graph.task_count(),
        task_types,
        agent_workload,
        resource_requirements,
        dependency_chains: graph.dependency_chains(),
        critical_path: critical_path(graph, &earliest),
    })
}
