//! Scheduler integration tests.
//!
//! These tests verify dependency ordering, per-agent lanes, the global
//! concurrency cap, follow-up injection and run-level cancellation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cadence::core::{Task, TaskId, TaskStatus};
use cadence::orchestration::{AgentRegistry, Scheduler, SchedulerConfig, SchedulerEvent};
use cadence::{Error, GraphError};

use crate::fixtures::{diamond, drain, position, shared_graph, Gauge, ScriptedAgent, Step};

fn registry_of(agents: &[Arc<ScriptedAgent>]) -> AgentRegistry {
    agents.iter().fold(AgentRegistry::new(), |registry, agent| {
        registry.with_agent(Arc::clone(agent) as Arc<dyn cadence::orchestration::Agent>)
    })
}

/// Test: Dependency ordering
/// Given a diamond of tasks spread over three agents
/// When the scheduler drains it
/// Then every task starts after all of its dependencies ended
#[tokio::test(start_paused = true)]
async fn test_dependency_order_in_diamond() {
    let agents = vec![
        ScriptedAgent::new("backend").taking(Duration::from_secs(1)).build(),
        ScriptedAgent::new("frontend").taking(Duration::from_secs(2)).build(),
        ScriptedAgent::new("qa").taking(Duration::from_secs(1)).build(),
    ];
    let graph = shared_graph(diamond());
    let mut scheduler = Scheduler::new(Arc::clone(&graph), registry_of(&agents));

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success(), "report: {}", report);
    assert_eq!(report.completed.len(), 4);
    assert_eq!(report.completed.first(), Some(&TaskId::from("a")));
    assert_eq!(report.completed.last(), Some(&TaskId::from("d")));

    let graph = graph.read().await;
    for task in graph.tasks() {
        for dep in &task.depends_on {
            let dep = graph.get_task(dep).unwrap();
            assert!(
                task.start_time.unwrap() >= dep.end_time.unwrap(),
                "{} started before {} ended",
                task.task_id,
                dep.task_id
            );
        }
    }
}

/// Test: Per-agent serialization
/// Given three independent tasks for the same agent
/// When they are scheduled
/// Then the agent never sees more than one call at a time
#[tokio::test(start_paused = true)]
async fn test_same_agent_is_serialized() {
    let backend = ScriptedAgent::new("backend")
        .taking(Duration::from_secs(5))
        .build();
    let graph = shared_graph(vec![
        Task::new("a", "backend", "t"),
        Task::new("b", "backend", "t"),
        Task::new("c", "backend", "t"),
    ]);
    let mut scheduler = Scheduler::new(graph, registry_of(&[Arc::clone(&backend)]));

    let started = Instant::now();
    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(backend.peak_in_flight(), 1);
    assert_eq!(backend.call_count(), 3);
    assert!(started.elapsed() >= Duration::from_secs(15));
}

/// Test: Cross-agent concurrency
/// Given one task per agent for three agents
/// When they are scheduled without a cap
/// Then all three run at once
#[tokio::test(start_paused = true)]
async fn test_different_agents_run_concurrently() {
    let gauge = Gauge::new();
    let agents: Vec<_> = ["backend", "frontend", "qa"]
        .iter()
        .map(|id| {
            ScriptedAgent::new(id)
                .taking(Duration::from_secs(10))
                .sharing(Arc::clone(&gauge))
                .build()
        })
        .collect();
    let graph = shared_graph(vec![
        Task::new("a", "backend", "t"),
        Task::new("b", "frontend", "t"),
        Task::new("c", "qa", "t"),
    ]);
    let mut scheduler = Scheduler::new(graph, registry_of(&agents));

    let started = Instant::now();
    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(gauge.peak(), 3);
    assert!(started.elapsed() < Duration::from_secs(11));
}

/// Test: Global concurrency cap
/// Given the same three agents and max_concurrency = 1
/// When they are scheduled
/// Then only one attempt is ever in flight
#[tokio::test(start_paused = true)]
async fn test_global_concurrency_cap() {
    let gauge = Gauge::new();
    let agents: Vec<_> = ["backend", "frontend", "qa"]
        .iter()
        .map(|id| {
            ScriptedAgent::new(id)
                .taking(Duration::from_secs(10))
                .sharing(Arc::clone(&gauge))
                .build()
        })
        .collect();
    let graph = shared_graph(vec![
        Task::new("a", "backend", "t"),
        Task::new("b", "frontend", "t"),
        Task::new("c", "qa", "t"),
    ]);
    let config = SchedulerConfig {
        max_concurrency: Some(1),
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(graph, registry_of(&agents)).with_config(config);

    let started = Instant::now();
    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(gauge.peak(), 1);
    assert!(started.elapsed() >= Duration::from_secs(30));
}

/// Test: Priority order within a lane
/// Given three ready tasks for one agent with different priorities
/// When the agent works through them
/// Then the highest priority goes first and ties keep insertion order
#[tokio::test]
async fn test_ready_tasks_dispatch_by_priority() {
    use cadence::core::Priority;

    let backend = ScriptedAgent::ok("backend");
    let graph = shared_graph(vec![
        Task::new("low", "backend", "t").with_priority(Priority::LOW),
        Task::new("first", "backend", "t"),
        Task::new("urgent", "backend", "t").with_priority(Priority::CRITICAL),
        Task::new("second", "backend", "t"),
    ]);
    let mut scheduler = Scheduler::new(graph, registry_of(&[Arc::clone(&backend)]));
    scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(
        backend.called_tasks(),
        vec![
            TaskId::from("urgent"),
            TaskId::from("first"),
            TaskId::from("second"),
            TaskId::from("low"),
        ]
    );
}

/// Test: Event stream
/// Given a two-task chain
/// When the run finishes
/// Then events arrive in lifecycle order and end with AllTasksComplete
#[tokio::test]
async fn test_event_stream_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let graph = shared_graph(vec![
        Task::new("a", "backend", "t"),
        Task::new("b", "backend", "t").depends_on(["a"]),
    ]);
    let mut scheduler =
        Scheduler::new(graph, registry_of(&[ScriptedAgent::ok("backend")])).with_events(tx);
    scheduler.run(CancellationToken::new()).await.unwrap();

    let events = drain(&mut rx);
    let started_a = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str() == "a")
    });
    let completed_a = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id, .. } if task_id.as_str() == "a")
    });
    let started_b = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str() == "b")
    });
    assert!(started_a < completed_a);
    assert!(completed_a < started_b);
    assert_eq!(events.last(), Some(&SchedulerEvent::AllTasksComplete));
}

/// Test: Follow-up injection
/// Given an agent that answers with two follow-up tasks, one a duplicate id
/// When the scheduler handles the response
/// Then the new task runs and the duplicate is reported as rejected
#[tokio::test]
async fn test_follow_up_tasks_are_injected() {
    let planner = ScriptedAgent::new("planner")
        .then(Step::Succeed(serde_json::json!({
            "tasks": [
                {"task_id": "docs", "agent_id": "writer", "task_type": "docs", "depends_on": ["plan"]},
                {"task_id": "plan", "task_type": "docs"}
            ]
        })))
        .build();
    let writer = ScriptedAgent::ok("writer");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let graph = shared_graph(vec![Task::new("plan", "planner", "plan")]);
    let mut scheduler = Scheduler::new(
        Arc::clone(&graph),
        registry_of(&[planner, Arc::clone(&writer)]),
    )
    .with_events(tx);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.completed, vec![TaskId::from("plan"), TaskId::from("docs")]);
    assert_eq!(writer.called_tasks(), vec![TaskId::from("docs")]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].task_id, TaskId::from("plan"));
    assert!(report.rejected[0].error.contains("Duplicate"));

    let events = drain(&mut rx);
    assert!(events.contains(&SchedulerEvent::TaskInjected {
        task_id: TaskId::from("docs"),
        parent: TaskId::from("plan"),
    }));
}

/// Test: Unroutable follow-up
/// Given a follow-up that names an agent nobody registered
/// When it is injected
/// Then it fails immediately with a routing error
#[tokio::test]
async fn test_unroutable_follow_up_fails_with_routing() {
    let planner = ScriptedAgent::new("planner")
        .then(Step::Succeed(serde_json::json!({
            "tasks": [{"task_id": "ghost_work", "agent_id": "ghost", "task_type": "x"}]
        })))
        .build();
    let graph = shared_graph(vec![Task::new("plan", "planner", "plan")]);
    let mut scheduler = Scheduler::new(graph, registry_of(&[planner]));

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    let failed = report.failed_task(&TaskId::from("ghost_work")).unwrap();
    assert_eq!(failed.error_type, "routing");
    assert_eq!(failed.attempts, 0);
}

/// Test: Follow-up under a failed task
/// Given a planner that answers after a sibling has already failed
/// When it injects a follow-up depending on the failed sibling
/// Then the follow-up is reported Blocked through the event stream
#[tokio::test(start_paused = true)]
async fn test_follow_up_under_failed_task_is_reported_blocked() {
    let planner = ScriptedAgent::new("planner")
        .then(Step::Succeed(serde_json::json!({
            "tasks": [{"task_id": "retry_fix", "agent_id": "planner", "task_type": "fix",
                       "depends_on": ["broken"]}]
        })))
        .taking(Duration::from_secs(1))
        .build();
    let strict = ScriptedAgent::new("strict").otherwise(Step::Fatal).build();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let graph = shared_graph(vec![
        Task::new("plan", "planner", "plan"),
        Task::new("broken", "strict", "t"),
    ]);
    let mut scheduler = Scheduler::new(
        Arc::clone(&graph),
        registry_of(&[Arc::clone(&planner), strict]),
    )
    .with_events(tx);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(planner.called_tasks(), vec![TaskId::from("plan")]);
    assert!(matches!(
        graph.read().await.get_task(&TaskId::from("retry_fix")).unwrap().status,
        TaskStatus::Blocked { .. }
    ));
    assert!(report.blocked.iter().any(|b| b.task_id == TaskId::from("retry_fix")));

    let events = drain(&mut rx);
    let injected = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskInjected { task_id, .. } if task_id.as_str() == "retry_fix")
    });
    let blocked = position(&events, |e| {
        matches!(e, SchedulerEvent::TaskBlocked { task_id, .. } if task_id.as_str() == "retry_fix")
    });
    assert!(injected < blocked);
}

/// Test: Deadlock detection
/// Given a task depending on an id that never appears
/// When the scheduler runs out of work
/// Then it raises a deadlock naming the stuck task instead of spinning
#[tokio::test]
async fn test_missing_dependency_is_deadlock() {
    let graph = shared_graph(vec![
        Task::new("a", "backend", "t"),
        Task::new("b", "backend", "t").depends_on(["a", "never_added"]),
    ]);
    let mut scheduler = Scheduler::new(graph, registry_of(&[ScriptedAgent::ok("backend")]));

    match scheduler.run(CancellationToken::new()).await {
        Err(Error::Graph(GraphError::Deadlock { pending })) => {
            assert_eq!(pending, vec![TaskId::from("b")]);
        }
        other => panic!("expected deadlock, got {:?}", other.map(|r| r.to_string())),
    }
}

/// Test: Run-level cancellation
/// Given an agent that never answers
/// When the run is cancelled
/// Then the scheduler returns promptly with the task unfinished
#[tokio::test(start_paused = true)]
async fn test_cancellation_reports_unfinished() {
    let stuck = ScriptedAgent::new("backend").otherwise(Step::Hang).build();
    let graph = shared_graph(vec![
        Task::new("a", "backend", "t"),
        Task::new("b", "backend", "t").depends_on(["a"]),
    ]);
    let config = SchedulerConfig {
        task_timeout: None,
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(graph, registry_of(&[stuck])).with_config(config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let report = scheduler.run(cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert_eq!(report.unfinished, vec![TaskId::from("a"), TaskId::from("b")]);
}

/// Test: Status snapshot
/// Given a finished run
/// When a task's status is queried
/// Then the snapshot carries its agent, times, attempts and result
#[tokio::test]
async fn test_task_status_snapshot() {
    let agent = ScriptedAgent::new("backend")
        .then(Step::Succeed(serde_json::json!({"files": 2})))
        .build();
    let graph = shared_graph(vec![Task::new("a", "backend", "t")]);
    let mut scheduler = Scheduler::new(graph, registry_of(&[agent]));
    scheduler.run(CancellationToken::new()).await.unwrap();

    let snapshot = scheduler.task_status(&TaskId::from("a")).await.unwrap();
    assert_eq!(snapshot.agent_id, "backend");
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.attempts, 1);
    assert!(snapshot.start_time.is_some() && snapshot.end_time.is_some());
    assert!(snapshot.lane.is_none());
    assert!(scheduler.task_status(&TaskId::from("zzz")).await.is_none());
}
