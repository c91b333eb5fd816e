//! Estimation integration tests.
//!
//! These tests verify the critical path, the execution simulator, the
//! projected timeline and estimates warmed from persisted history.

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use cadence::core::{Task, TaskGraph, TaskId};
use cadence::estimation::{
    critical_path, earliest_completion, simulate, CriticalPathEstimator, DurationEstimator,
    RiskFactor, Severity, TaskCompletion, ThroughputTracker,
};
use cadence::state::StateStore;
use cadence::{Error, GraphError};

fn fixed(secs: &'static [(&'static str, f64)]) -> impl Fn(&Task) -> f64 {
    move |task: &Task| {
        secs.iter()
            .find(|(id, _)| *id == task.task_id.as_str())
            .map(|(_, d)| *d)
            .unwrap_or(1.0)
    }
}

fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::from(*id)).collect()
}

/// Test: Critical path scenario
/// Given A (2s) -> B (3s) and A -> C (1s)
/// When the critical path is computed
/// Then it is [A, B] with total 5s
#[test]
fn test_critical_path_scenario() {
    let graph = TaskGraph::from_tasks(vec![
        Task::new("a", "x", "t"),
        Task::new("b", "x", "t").depends_on(["a"]),
        Task::new("c", "y", "t").depends_on(["a"]),
    ])
    .unwrap();
    let estimator = fixed(&[("a", 2.0), ("b", 3.0), ("c", 1.0)]);

    let earliest = earliest_completion(&graph, &estimator).unwrap();
    assert_eq!(earliest[&TaskId::from("b")], 5.0);
    assert_eq!(earliest[&TaskId::from("c")], 3.0);

    let path = critical_path(&graph, &earliest);
    assert_eq!(path.tasks, ids(&["a", "b"]));
    assert_eq!(path.total_duration, 5.0);
}

/// Test: Ties at the maximum
/// Given a chain a -> b finishing at 5s and an unrelated x also finishing at 5s
/// When the critical path is computed
/// Then it is one real chain, not the set of tasks tied at the maximum
#[test]
fn test_critical_path_is_a_chain_not_a_tie_set() {
    let graph = TaskGraph::from_tasks(vec![
        Task::new("a", "x", "t"),
        Task::new("b", "x", "t").depends_on(["a"]),
        Task::new("x", "y", "t"),
    ])
    .unwrap();
    let estimator = fixed(&[("a", 2.0), ("b", 3.0), ("x", 5.0)]);

    let earliest = earliest_completion(&graph, &estimator).unwrap();
    let path = critical_path(&graph, &earliest);
    assert_eq!(path.tasks, ids(&["a", "b"]));
}

/// Test: Warm estimates from history
/// Given persisted completions of 60s and 120s for backend
/// When a tracker is built from the store
/// Then backend tasks scale from a 90s base and unknown agents use the default
#[test]
fn test_estimates_warm_from_persisted_history() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let now = Utc::now();
    for (id, secs) in [("t1", 60.0), ("t2", 120.0)] {
        let completion = TaskCompletion {
            task_id: TaskId::from(id),
            agent_id: "backend".to_string(),
            estimated_duration: 90.0,
            actual_duration: secs,
            start_time: now - ChronoDuration::seconds(secs as i64),
            end_time: now,
            complexity: 5.0,
            dependencies: Vec::new(),
            success: true,
            notes: String::new(),
        };
        store.save_completion(&completion).unwrap();
        store.record_agent_history(&completion).unwrap();
    }

    let histories = store.load_agent_histories().unwrap();
    let tracker = ThroughputTracker::from_histories(300.0, &histories);

    let stats = tracker.get("backend").unwrap();
    assert_eq!(stats.total_tasks, 2);
    assert!((stats.average_duration - 90.0).abs() < 1e-9);

    let hard = Task::new("h", "backend", "t").with_complexity(10.0);
    assert!((tracker.estimate_duration(&hard) - 180.0).abs() < 1e-9);
    let unknown = Task::new("u", "docs", "t");
    assert!((tracker.estimate_duration(&unknown) - 300.0).abs() < 1e-9);

    assert_eq!(store.load_completions().unwrap().len(), 2);
}

/// Test: Parallel simulation
/// Given two agents with two 10s tasks each
/// When the execution is simulated
/// Then the project takes 20s and both agents are fully utilized
#[test]
fn test_simulation_runs_agents_in_parallel() {
    let graph = TaskGraph::from_tasks(vec![
        Task::new("a1", "alpha", "t"),
        Task::new("a2", "alpha", "t"),
        Task::new("b1", "beta", "t"),
        Task::new("b2", "beta", "t").depends_on(["a1"]),
    ])
    .unwrap();
    let estimator = |_: &Task| 10.0;

    let sim = simulate(&graph, &estimator, 1.0).unwrap();

    assert_eq!(sim.total_duration, 20.0);
    assert_eq!(sim.windows.len(), 4);
    assert_eq!(sim.utilization["alpha"], 1.0);
    assert_eq!(sim.utilization["beta"], 1.0);
    let b2 = sim.windows.iter().find(|w| w.task_id.as_str() == "b2").unwrap();
    let a1 = sim.windows.iter().find(|w| w.task_id.as_str() == "a1").unwrap();
    assert!(b2.start >= a1.end);
}

/// Test: Completed work is not re-simulated
#[test]
fn test_simulation_skips_completed_tasks() {
    let mut graph = TaskGraph::from_tasks(vec![
        Task::new("a", "alpha", "t"),
        Task::new("b", "alpha", "t").depends_on(["a"]),
    ])
    .unwrap();
    graph.mark_running(&TaskId::from("a")).unwrap();
    graph
        .mark_completed(&TaskId::from("a"), serde_json::Value::Null)
        .unwrap();

    let sim = simulate(&graph, &|_: &Task| 4.0, 1.0).unwrap();

    assert_eq!(sim.windows.len(), 1);
    assert_eq!(sim.windows[0].task_id, TaskId::from("b"));
    assert_eq!(sim.windows[0].start, 0.0);
    assert_eq!(sim.total_duration, 4.0);
}

/// Test: Simulator deadlock
#[test]
fn test_simulation_reports_deadlock() {
    let graph = TaskGraph::from_tasks(vec![Task::new("a", "alpha", "t").depends_on(["ghost"])])
        .unwrap();
    let err = simulate(&graph, &|_: &Task| 1.0, 1.0).unwrap_err();
    assert!(matches!(err, Error::Graph(GraphError::Deadlock { .. })));
}

/// Test: Full estimate
/// Given four chained tasks on one agent and a hub task with many dependencies
/// When the estimator runs
/// Then the timeline has the five checkpoints and the risks are flagged
#[test]
fn test_estimate_timeline_and_risks() {
    let graph = TaskGraph::from_tasks(vec![
        Task::new("a", "alpha", "schema").with_resource("db", 0.5),
        Task::new("b", "beta", "api").with_resource("db", 0.5),
        Task::new("c", "alpha", "api"),
        Task::new("d", "beta", "ui"),
        Task::new("hub", "alpha", "release").depends_on(["a", "b", "c", "d"]),
    ])
    .unwrap();
    let now = Utc::now();

    let estimate = CriticalPathEstimator::new(1.0)
        .estimate(&graph, &|_: &Task| 10.0, now)
        .unwrap();

    assert_eq!(estimate.total_duration, 30.0);
    assert_eq!(estimate.queue.total_tasks, 5);
    assert_eq!(estimate.queue.agent_workload["alpha"], 3);
    assert_eq!(estimate.queue.task_types["api"], 2);
    assert_eq!(estimate.queue.resource_requirements["db"], 1.0);
    assert_eq!(estimate.queue.critical_path.total_duration, 20.0);

    let names: Vec<&str> = estimate
        .timeline
        .checkpoints
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "Project Start",
            "25% Complete",
            "50% Complete",
            "75% Complete",
            "Project Completion"
        ]
    );
    assert_eq!(estimate.timeline.start, now);
    assert_eq!(estimate.timeline.end, now + ChronoDuration::seconds(30));
    assert_eq!(estimate.timeline.agent_schedules["alpha"].len(), 3);

    let hub = estimate
        .risk_factors
        .iter()
        .find(|r| matches!(r, RiskFactor::ComplexDependencies { .. }))
        .unwrap();
    assert_eq!(hub.severity(), Severity::Medium);
    assert_eq!(hub.description(), "Task hub has many dependencies (4)");

    let db = estimate
        .risk_factors
        .iter()
        .find(|r| matches!(r, RiskFactor::ResourceConstraint { .. }))
        .unwrap();
    assert_eq!(db.severity(), Severity::High);
    assert_eq!(db.description(), "Resource db has high peak usage (100.0%)");

    let json = serde_json::to_value(&estimate).unwrap();
    assert_eq!(json["risk_factors"][0]["type"], "high_utilization");
}
