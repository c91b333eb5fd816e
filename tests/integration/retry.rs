//! Retry and failure-handling integration tests.
//!
//! These tests verify backoff timing on a paused clock, error
//! classification, deadlines, blocked propagation and attempt metrics.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use cadence::core::{Task, TaskId, TaskResult, TaskStatus};
use cadence::orchestration::{
    Agent, AgentRegistry, AttemptStatus, Backoff, ErrorClass, ErrorRule, MemoryMetrics,
    MetricsSink, RetryPolicy, RetryStrategy, Scheduler, SchedulerConfig,
};

use crate::fixtures::{shared_graph, ScriptedAgent, Step};

fn gaps(agent: &ScriptedAgent) -> Vec<Duration> {
    agent
        .call_times()
        .windows(2)
        .map(|w| w[1].duration_since(w[0]))
        .collect()
}

fn assert_gaps(actual: &[Duration], expected_secs: &[u64]) {
    assert_eq!(actual.len(), expected_secs.len(), "gaps: {:?}", actual);
    for (gap, secs) in actual.iter().zip(expected_secs) {
        let expected = Duration::from_secs(*secs);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(50),
            "gap {:?} should be about {:?}",
            gap,
            expected
        );
    }
}

/// Test: Retry exhaustion
/// Given max_retries=3, base_delay=1, exponential backoff
/// When a task always fails transiently
/// Then it is attempted 4 times with delays [1, 2, 4] and then marked Failed
#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_schedule() {
    let flaky = ScriptedAgent::failing("flaky", "connection");
    let graph = shared_graph(vec![Task::new("a", "flaky", "t")]);
    let registry = AgentRegistry::new().with_agent(Arc::clone(&flaky) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(Arc::clone(&graph), registry);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(flaky.call_count(), 4);
    assert_gaps(&gaps(&flaky), &[1, 2, 4]);

    let failed = report.failed_task(&TaskId::from("a")).unwrap();
    assert_eq!(failed.error_type, "max_retries_exceeded");
    assert_eq!(failed.error_class, ErrorClass::Transient);
    assert_eq!(failed.cause, "connection");
    assert_eq!(failed.attempts, 4);

    let graph = graph.read().await;
    let task = graph.get_task(&TaskId::from("a")).unwrap();
    assert!(matches!(task.status, TaskStatus::Failed { .. }));
    match &task.result {
        Some(TaskResult::Error {
            error_type,
            attempts,
            retry_strategy,
            ..
        }) => {
            assert_eq!(error_type, "max_retries_exceeded");
            assert_eq!(*attempts, 4);
            assert_eq!(retry_strategy, "exponential");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

/// Test: Fatal errors stop immediately
/// Given an agent that returns a fatal error from execute
/// When the task runs
/// Then there is exactly one attempt and the result is typed fatal
#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let agent = ScriptedAgent::new("strict").otherwise(Step::Fatal).build();
    let graph = shared_graph(vec![Task::new("a", "strict", "t")]);
    let registry = AgentRegistry::new().with_agent(Arc::clone(&agent) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(graph, registry);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(agent.call_count(), 1);
    let failed = report.failed_task(&TaskId::from("a")).unwrap();
    assert_eq!(failed.error_type, "fatal");
    assert_eq!(failed.error_class, ErrorClass::Fatal);
    assert_eq!(failed.attempts, 1);
}

/// Test: Unknown error types default to fatal
#[tokio::test]
async fn test_unregistered_error_type_is_fatal() {
    let agent = ScriptedAgent::failing("odd", "cosmic_ray");
    let graph = shared_graph(vec![Task::new("a", "odd", "t")]);
    let registry = AgentRegistry::new().with_agent(Arc::clone(&agent) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(graph, registry);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(agent.call_count(), 1);
    assert_eq!(report.failed_task(&TaskId::from("a")).unwrap().cause, "cosmic_ray");
}

/// Test: Per-agent strategy and rule overrides
/// Given a fixed 2s strategy with one retry for one agent, and a custom
/// transient rule
/// When the agent keeps failing with that error type
/// Then it is attempted twice, 2s apart
#[tokio::test(start_paused = true)]
async fn test_agent_strategy_override() {
    let agent = ScriptedAgent::failing("quota_bound", "quota");
    let policy = RetryPolicy::default()
        .with_agent_strategy(
            "quota_bound",
            RetryStrategy {
                max_retries: 1,
                base_delay: 2.0,
                max_delay: 2.0,
                backoff: Backoff::Fixed,
            },
        )
        .with_rule("quota", ErrorRule::transient(5));
    let graph = shared_graph(vec![Task::new("a", "quota_bound", "t")]);
    let registry = AgentRegistry::new().with_agent(Arc::clone(&agent) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(graph, registry).with_policy(policy);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(agent.call_count(), 2);
    assert_gaps(&gaps(&agent), &[2]);
    let failed = report.failed_task(&TaskId::from("a")).unwrap();
    assert_eq!(failed.error_type, "max_retries_exceeded");
}

/// Test: Recovery after transient crashes
/// Given an agent that errors twice and then succeeds
/// When the task runs
/// Then it completes, and metrics record two FAIL attempts and one PASS
#[tokio::test(start_paused = true)]
async fn test_transient_crashes_recover() {
    let agent = ScriptedAgent::new("shaky")
        .then(Step::Crash)
        .then(Step::Fail("rate_limit"))
        .build();
    let metrics = Arc::new(MemoryMetrics::new());
    let graph = shared_graph(vec![Task::new("a", "shaky", "build")]);
    let registry = AgentRegistry::new().with_agent(Arc::clone(&agent) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(graph, registry)
        .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(agent.call_count(), 3);

    let attempts = metrics.attempts_for(&TaskId::from("a"));
    let statuses: Vec<_> = attempts.iter().map(|m| m.status).collect();
    assert_eq!(
        statuses,
        vec![AttemptStatus::Fail, AttemptStatus::Fail, AttemptStatus::Pass]
    );
    assert_eq!(attempts[0].error_type.as_deref(), Some("transient"));
    assert_eq!(attempts[1].error_type.as_deref(), Some("rate_limit"));
    assert_eq!(attempts[2].task_type, "build");
    assert_eq!(attempts[2].retry_success, Some(true));
    assert_eq!(attempts[2].retry_strategy.as_deref(), Some("exponential"));

    let completions = metrics.completions();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
}

/// Test: Deadline
/// Given an agent that hangs on its first call
/// When the per-attempt deadline is 2s
/// Then the hang is treated as a transient timeout and the retry succeeds
#[tokio::test(start_paused = true)]
async fn test_deadline_feeds_retry() {
    let agent = ScriptedAgent::new("slow").then(Step::Hang).build();
    let metrics = Arc::new(MemoryMetrics::new());
    let graph = shared_graph(vec![Task::new("a", "slow", "t")]);
    let registry = AgentRegistry::new().with_agent(Arc::clone(&agent) as Arc<dyn Agent>);
    let config = SchedulerConfig {
        task_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let mut scheduler = Scheduler::new(graph, registry)
        .with_config(config)
        .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(agent.call_count(), 2);
    // 2s deadline plus the 1s first backoff.
    assert_gaps(&gaps(&agent), &[3]);
    assert_eq!(metrics.attempts()[0].error_type.as_deref(), Some("timeout"));
}

/// Test: Blocked propagation
/// Given a -> b -> c with a failing fatally, and an independent d
/// When the run finishes
/// Then b and c are Blocked, never dispatched, and d still completes
#[tokio::test]
async fn test_blocked_propagates_through_descendants() {
    let broken = ScriptedAgent::failing("broken", "permission");
    let worker = ScriptedAgent::ok("worker");
    let graph = shared_graph(vec![
        Task::new("a", "broken", "t"),
        Task::new("b", "worker", "t").depends_on(["a"]),
        Task::new("c", "worker", "t").depends_on(["b"]),
        Task::new("d", "worker", "t"),
    ]);
    let registry = AgentRegistry::new()
        .with_agent(Arc::clone(&broken) as Arc<dyn Agent>)
        .with_agent(Arc::clone(&worker) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(Arc::clone(&graph), registry);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_blocked(&TaskId::from("b")));
    assert!(report.is_blocked(&TaskId::from("c")));
    assert_eq!(report.completed, vec![TaskId::from("d")]);
    assert_eq!(worker.called_tasks(), vec![TaskId::from("d")]);
    assert!(report.blocked.iter().all(|b| b.reason == "upstream task a failed"));

    let graph = graph.read().await;
    assert!(graph.ready_tasks().is_empty());
    assert!(graph.is_drained());
}

/// Test: Backoff does not stall other agents
/// Given one agent retrying with a 10s delay and another with three 1s tasks
/// When both run
/// Then the second agent finishes all its work during the backoff
#[tokio::test(start_paused = true)]
async fn test_backoff_does_not_block_other_agents() {
    let flaky = ScriptedAgent::new("flaky").then(Step::Crash).build();
    let steady = ScriptedAgent::new("steady")
        .taking(Duration::from_secs(1))
        .build();
    let policy = RetryPolicy::new(RetryStrategy {
        base_delay: 10.0,
        ..RetryStrategy::default()
    });
    let graph = shared_graph(vec![
        Task::new("f", "flaky", "t"),
        Task::new("s1", "steady", "t"),
        Task::new("s2", "steady", "t"),
        Task::new("s3", "steady", "t"),
    ]);
    let registry = AgentRegistry::new()
        .with_agent(Arc::clone(&flaky) as Arc<dyn Agent>)
        .with_agent(Arc::clone(&steady) as Arc<dyn Agent>);
    let mut scheduler = Scheduler::new(graph, registry).with_policy(policy);

    let report = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    let retry_at = flaky.call_times()[1];
    assert!(steady.call_times().iter().all(|t| *t < retry_at));
    assert_eq!(report.completed.last(), Some(&TaskId::from("f")));
}
