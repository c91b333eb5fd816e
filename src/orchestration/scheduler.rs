//! Scheduler for dependency-ordered task execution.
//!
//! The Scheduler pulls ready tasks from the graph and dispatches them to
//! their agents, one in-flight task per agent. Each attempt runs on its own
//! tokio task under a deadline and reports back over a channel, so the loop
//! sleeps until something finishes instead of polling. Failed attempts go
//! through the retry policy; the backoff sleep happens inside the attempt
//! task and holds the agent's lane. Completions feed throughput statistics
//! and milestone progress before dependents are considered for dispatch.

use crate::core::graph::TaskGraph;
use crate::core::plan::TaskSpec;
use crate::core::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::error::{Error, GraphError, Result};
use crate::estimation::throughput::{DurationEstimator, TaskCompletion, ThroughputTracker};
use crate::milestone::{MilestoneEvent, MilestoneTracker};
use crate::orchestration::agent::{Agent, AgentRegistry, AgentRequest};
use crate::orchestration::metrics::{AttemptMetric, AttemptStatus, LogMetrics, MetricsSink};
use crate::orchestration::notify::{LogNotifier, Notifier};
use crate::orchestration::report::{BlockedTask, FailedTask, RejectedTask, RunReport};
use crate::orchestration::retry::{
    ErrorClass, RetryDecision, RetryPolicy, RetryTracker, FATAL, PANIC, ROUTING, TIMEOUT,
};
use crate::state::StateStore;
use crate::util::with_deadline;
use crate::{clog, clog_debug, clog_error, clog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default per-attempt deadline.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
const UNKNOWN_ERROR_TYPE: &str = "unknown";
const TRANSIENT: &str = "transient";

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow callers to follow a run without polling the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A task was handed to its agent for the first time.
    TaskStarted { task_id: TaskId, agent_id: String },
    /// An attempt failed and another is scheduled after `delay`.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
        error: String,
        error_type: String,
    },
    TaskCompleted { task_id: TaskId, agent_id: String },
    TaskFailed {
        task_id: TaskId,
        error: String,
        error_type: String,
    },
    TaskBlocked { task_id: TaskId, reason: String },
    /// An agent asked for a follow-up task and it was added.
    TaskInjected { task_id: TaskId, parent: TaskId },
    Milestone(MilestoneEvent),
    /// The graph drained.
    AllTasksComplete,
}

/// What an agent's lane is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LaneState {
    /// First attempt in flight.
    Running { attempt: u32 },
    /// Backing off before attempt `attempt`, or running it.
    Retrying { attempt: u32 },
}

#[derive(Debug, Clone)]
struct Lane {
    task_id: TaskId,
    state: LaneState,
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub agent_id: String,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub result: Option<TaskResult>,
    pub lane: Option<LaneState>,
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Deadline for a single attempt. `None` waits forever.
    pub task_timeout: Option<Duration>,
    /// Cap on in-flight attempts across all agents.
    pub max_concurrency: Option<usize>,
    /// How long a notifier may take before it is abandoned.
    pub notify_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Some(DEFAULT_TASK_TIMEOUT),
            max_concurrency: None,
            notify_timeout: NOTIFY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
struct AttemptFailure {
    error: String,
    error_type: String,
}

#[derive(Debug)]
struct AttemptOutcome {
    task_id: TaskId,
    agent_id: String,
    attempt: u32,
    duration_ms: f64,
    result: std::result::Result<serde_json::Value, AttemptFailure>,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "agent panicked".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Error type for an agent call that returned `Err`.
fn error_type_of(err: &Error) -> &'static str {
    match err {
        Error::Timeout(_) => TIMEOUT,
        Error::TaskJoin(_) => PANIC,
        Error::Fatal(_) => FATAL,
        Error::Routing { .. } => ROUTING,
        _ => TRANSIENT,
    }
}

/// One attempt: run the agent under the deadline, catching panics.
async fn run_attempt(
    agent: Arc<dyn Agent>,
    request: AgentRequest,
    deadline: Option<Duration>,
) -> (f64, std::result::Result<serde_json::Value, AttemptFailure>) {
    let clock = tokio::time::Instant::now();
    let handle = tokio::spawn(async move { agent.execute(request).await });
    let guard = AbortOnDrop(handle.abort_handle());

    let result = with_deadline(deadline, async move {
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::TaskJoin(panic_message(e))),
            Err(e) => Err(Error::Transient(e.to_string())),
        }
    })
    .await;
    // Stops an agent that outlived its deadline.
    drop(guard);

    let duration_ms = clock.elapsed().as_secs_f64() * 1000.0;
    let result = match result {
        Ok(response) if response.is_success() => Ok(response.details),
        Ok(response) => Err(AttemptFailure {
            error: response
                .error
                .unwrap_or_else(|| "agent reported an error".to_string()),
            error_type: response
                .error_type
                .unwrap_or_else(|| UNKNOWN_ERROR_TYPE.to_string()),
        }),
        Err(e) => Err(AttemptFailure {
            error_type: error_type_of(&e).to_string(),
            error: e.to_string(),
        }),
    };
    (duration_ms, result)
}

/// Drives a task graph to completion.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio::sync::RwLock;
/// use tokio_util::sync::CancellationToken;
/// use cadence::core::TaskGraph;
/// use cadence::orchestration::{AgentRegistry, Scheduler};
///
/// let graph = Arc::new(RwLock::new(TaskGraph::new()));
/// let registry = AgentRegistry::new().with_agent(my_agent);
/// let mut scheduler = Scheduler::new(graph, registry);
/// let report = scheduler.run(CancellationToken::new()).await?;
/// ```
pub struct Scheduler {
    graph: Arc<RwLock<TaskGraph>>,
    registry: AgentRegistry,
    policy: RetryPolicy,
    config: SchedulerConfig,
    throughput: Arc<RwLock<ThroughputTracker>>,
    milestones: Arc<RwLock<MilestoneTracker>>,
    metrics: Arc<dyn MetricsSink>,
    notifier: Arc<dyn Notifier>,
    store: Option<StateStore>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    /// Busy agents and what they are doing.
    lanes: HashMap<String, Lane>,
    in_flight: HashMap<TaskId, AbortHandle>,
    retries: RetryTracker,
    /// Estimated seconds, captured at first dispatch.
    estimates: HashMap<TaskId, f64>,
    /// Class and last error type of terminally failed tasks.
    failures: HashMap<TaskId, (ErrorClass, String)>,
    rejected: Vec<RejectedTask>,
}

impl Scheduler {
    pub fn new(graph: Arc<RwLock<TaskGraph>>, registry: AgentRegistry) -> Self {
        Self {
            graph,
            registry,
            policy: RetryPolicy::default(),
            config: SchedulerConfig::default(),
            throughput: Arc::new(RwLock::new(ThroughputTracker::new(
                DEFAULT_TASK_TIMEOUT.as_secs_f64(),
            ))),
            milestones: Arc::new(RwLock::new(MilestoneTracker::default())),
            metrics: Arc::new(LogMetrics),
            notifier: Arc::new(LogNotifier),
            store: None,
            event_tx: None,
            lanes: HashMap::new(),
            in_flight: HashMap::new(),
            retries: RetryTracker::new(),
            estimates: HashMap::new(),
            failures: HashMap::new(),
            rejected: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_throughput(mut self, throughput: Arc<RwLock<ThroughputTracker>>) -> Self {
        self.throughput = throughput;
        self
    }

    pub fn with_milestones(mut self, milestones: Arc<RwLock<MilestoneTracker>>) -> Self {
        self.milestones = milestones;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Persist completion records and agent history under `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Add a task, filling in its agent from the routing table when it
    /// names none, and attaching it to its tagged milestone.
    pub async fn add_task(&self, mut task: Task) -> Result<()> {
        if task.agent_id.is_empty() {
            if let Ok(agent_id) = self.registry.route(&task) {
                clog_debug!("Routed {} ({}) to {}", task.task_id, task.task_type, agent_id);
                task.agent_id = agent_id;
            }
        }

        let task_id = task.task_id.clone();
        let milestone_id = task.metadata.milestone_id.clone();
        self.graph.write().await.add_task(task)?;

        if let Some(milestone_id) = milestone_id {
            if let Err(e) = self
                .milestones
                .write()
                .await
                .attach_task(&milestone_id, task_id.clone())
            {
                clog_warn!("Task {} not attached to milestone: {}", task_id, e);
            }
        }
        Ok(())
    }

    /// Snapshot of one task, including what its agent lane is doing.
    pub async fn task_status(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        let graph = self.graph.read().await;
        let task = graph.get_task(task_id)?;
        let lane = self
            .lanes
            .get(&task.agent_id)
            .filter(|l| &l.task_id == task_id)
            .map(|l| l.state);
        Some(TaskSnapshot {
            task_id: task.task_id.clone(),
            agent_id: task.agent_id.clone(),
            status: task.status.clone(),
            start_time: task.start_time,
            end_time: task.end_time,
            attempts: task.attempts,
            result: task.result.clone(),
            lane,
        })
    }

    pub fn lane_state(&self, agent_id: &str) -> Option<LaneState> {
        self.lanes.get(agent_id).map(|l| l.state)
    }

    /// Number of in-flight attempts (including ones backing off).
    pub fn active_count(&self) -> usize {
        self.lanes.len()
    }

    /// Run until the graph drains, a deadlock is found, or `cancel` fires.
    ///
    /// # Errors
    /// - `Validation` for an unusable configuration or routing table
    /// - `Graph(Deadlock)` when pending tasks can never become ready
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        if self.config.max_concurrency == Some(0) {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        self.registry.validate()?;

        {
            let graph = self.graph.read().await;
            clog!(
                "Run {} starting: {} task(s), {} agent(s)",
                run_id,
                graph.task_count(),
                self.registry.len()
            );
        }

        self.fail_unroutable().await;
        self.check_milestones().await;

        let (tx, mut rx) = mpsc::unbounded_channel::<AttemptOutcome>();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.dispatch_ready(&tx).await;

            if self.lanes.is_empty() {
                let graph = self.graph.read().await;
                if graph.is_drained() {
                    break;
                }
                let pending = graph.pending_ids();
                clog_error!(
                    "Deadlock: {} pending task(s) can never run, unresolved: {:?}",
                    pending.len(),
                    graph.unresolved_dependencies()
                );
                return Err(GraphError::Deadlock { pending }.into());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                outcome = rx.recv() => match outcome {
                    Some(outcome) => self.handle_outcome(outcome, &tx).await,
                    None => break,
                },
            }
        }

        if cancelled {
            clog_warn!("Run {} cancelled with {} attempt(s) in flight", run_id, self.in_flight.len());
            for (_, handle) in self.in_flight.drain() {
                handle.abort();
            }
            self.lanes.clear();
        } else {
            self.check_milestones().await;
            self.emit(SchedulerEvent::AllTasksComplete);
        }

        if let Err(e) = self.milestones.read().await.persist() {
            clog_error!("{}", e);
        }

        let report = self.build_report(run_id, started_at, cancelled).await;
        clog!(
            "Run {} finished: {} completed, {} failed, {} blocked",
            run_id,
            report.completed.len(),
            report.failed.len(),
            report.blocked.len()
        );
        Ok(report)
    }

    /// Fail every pending task whose agent is unknown before anything runs.
    async fn fail_unroutable(&mut self) {
        let unroutable: Vec<(TaskId, String)> = {
            let graph = self.graph.read().await;
            graph
                .tasks()
                .filter(|t| t.is_pending() && !self.registry.contains(&t.agent_id))
                .map(|t| (t.task_id.clone(), t.agent_id.clone()))
                .collect()
        };
        for (task_id, agent_id) in unroutable {
            self.fail_routing(&task_id, &agent_id).await;
        }
    }

    async fn fail_routing(&mut self, task_id: &TaskId, agent_id: &str) {
        let err = Error::Routing {
            task_id: task_id.clone(),
            agent_id: agent_id.to_string(),
        };
        clog_error!("{}", err);
        self.fail_task(
            task_id,
            agent_id,
            err.to_string(),
            ROUTING,
            ErrorClass::Fatal,
            ROUTING.to_string(),
            0,
        )
        .await;
    }

    async fn dispatch_ready(&mut self, tx: &mpsc::UnboundedSender<AttemptOutcome>) {
        let ready: Vec<Task> = {
            let graph = self.graph.read().await;
            graph.ready_tasks().into_iter().cloned().collect()
        };

        for task in ready {
            if let Some(cap) = self.config.max_concurrency {
                if self.lanes.len() >= cap {
                    break;
                }
            }
            if self.lanes.contains_key(&task.agent_id) {
                continue;
            }
            let Some(agent) = self.registry.get(&task.agent_id) else {
                self.fail_routing(&task.task_id, &task.agent_id).await;
                continue;
            };

            let events = {
                let mut graph = self.graph.write().await;
                if let Err(e) = graph.mark_running(&task.task_id) {
                    clog_error!("Cannot start {}: {}", task.task_id, e);
                    continue;
                }
                self.milestones
                    .write()
                    .await
                    .on_task_started(&task.task_id, &graph)
            };

            let estimate = match task.metadata.estimated_duration {
                Some(secs) if secs > 0.0 => secs,
                _ => self.throughput.read().await.estimate_duration(&task),
            };
            self.estimates.insert(task.task_id.clone(), estimate);

            clog!("Dispatching {} to {}", task.task_id, task.agent_id);
            self.emit(SchedulerEvent::TaskStarted {
                task_id: task.task_id.clone(),
                agent_id: task.agent_id.clone(),
            });
            self.publish(events).await;

            self.start_attempt(agent, &task, 1, Duration::ZERO, tx).await;
        }
    }

    /// Spawn attempt number `attempt` after `delay`, holding the agent's lane.
    async fn start_attempt(
        &mut self,
        agent: Arc<dyn Agent>,
        task: &Task,
        attempt: u32,
        delay: Duration,
        tx: &mpsc::UnboundedSender<AttemptOutcome>,
    ) {
        if let Err(e) = self.graph.write().await.record_attempt(&task.task_id) {
            clog_error!("Cannot count attempt for {}: {}", task.task_id, e);
        }

        let state = if attempt <= 1 {
            LaneState::Running { attempt }
        } else {
            LaneState::Retrying { attempt }
        };
        self.lanes.insert(
            task.agent_id.clone(),
            Lane {
                task_id: task.task_id.clone(),
                state,
            },
        );

        let request = AgentRequest::from(task);
        let task_id = task.task_id.clone();
        let agent_id = task.agent_id.clone();
        let deadline = self.config.task_timeout;
        let tx = tx.clone();

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let (duration_ms, result) = run_attempt(agent, request, deadline).await;
            let _ = tx.send(AttemptOutcome {
                task_id,
                agent_id,
                attempt,
                duration_ms,
                result,
            });
        });
        self.in_flight
            .insert(task.task_id.clone(), handle.abort_handle());
    }

    async fn handle_outcome(
        &mut self,
        outcome: AttemptOutcome,
        tx: &mpsc::UnboundedSender<AttemptOutcome>,
    ) {
        self.in_flight.remove(&outcome.task_id);
        match outcome.result.clone() {
            Ok(details) => self.on_success(&outcome, details).await,
            Err(failure) => self.on_failure(&outcome, failure, tx).await,
        }
    }

    fn record_attempt_metric(
        &self,
        outcome: &AttemptOutcome,
        task_type: &str,
        status: AttemptStatus,
        retry_success: Option<bool>,
        error_type: Option<String>,
    ) {
        let retried = outcome.attempt > 1;
        self.metrics.record_attempt(&AttemptMetric {
            timestamp: Utc::now(),
            agent_id: outcome.agent_id.clone(),
            task_id: outcome.task_id.clone(),
            task_type: task_type.to_string(),
            status,
            duration_ms: outcome.duration_ms,
            retries_attempted: self.retries.get_retries(&outcome.task_id),
            retry_success,
            retry_strategy: retried
                .then(|| self.policy.strategy_for(&outcome.agent_id).backoff.to_string()),
            error_type,
        });
    }

    async fn on_success(&mut self, outcome: &AttemptOutcome, details: serde_json::Value) {
        self.lanes.remove(&outcome.agent_id);

        let (task, events) = {
            let mut graph = self.graph.write().await;
            if let Err(e) = graph.mark_completed(&outcome.task_id, details.clone()) {
                clog_error!("Cannot complete {}: {}", outcome.task_id, e);
                return;
            }
            let Some(task) = graph.get_task(&outcome.task_id).cloned() else {
                return;
            };
            let now = task.end_time.unwrap_or_else(Utc::now);
            let events = self
                .milestones
                .write()
                .await
                .on_task_terminal(&outcome.task_id, &graph, now);
            (task, events)
        };

        clog!(
            "Task {} completed on attempt {} ({:.0}ms)",
            outcome.task_id,
            outcome.attempt,
            outcome.duration_ms
        );
        self.record_attempt_metric(
            outcome,
            &task.task_type,
            AttemptStatus::Pass,
            (outcome.attempt > 1).then_some(true),
            None,
        );

        let completion = self.completion_for(&task, true, "Task completed successfully".to_string());
        self.throughput.write().await.record(&completion);
        if let Some(store) = &self.store {
            if let Err(e) = store.record_agent_history(&completion) {
                clog_error!("Failed to update history for {}: {}", completion.agent_id, e);
            }
        }
        self.record_completion(&completion);

        self.emit(SchedulerEvent::TaskCompleted {
            task_id: task.task_id.clone(),
            agent_id: task.agent_id.clone(),
        });
        self.publish(events).await;
        self.inject_follow_ups(&task.task_id, &details).await;
    }

    async fn on_failure(
        &mut self,
        outcome: &AttemptOutcome,
        failure: AttemptFailure,
        tx: &mpsc::UnboundedSender<AttemptOutcome>,
    ) {
        let task = {
            let graph = self.graph.read().await;
            graph.get_task(&outcome.task_id).cloned()
        };
        let Some(task) = task else {
            self.lanes.remove(&outcome.agent_id);
            return;
        };

        match self
            .policy
            .decide(&outcome.agent_id, &failure.error_type, outcome.attempt)
        {
            RetryDecision::Retry {
                delay,
                next_attempt,
            } => {
                self.record_attempt_metric(
                    outcome,
                    &task.task_type,
                    AttemptStatus::Fail,
                    None,
                    Some(failure.error_type.clone()),
                );
                self.retries.increment(&task.task_id);
                clog_warn!(
                    "Task {} failed on attempt {}: {}. Retrying in {:.1}s (error type: {}, strategy: {})",
                    task.task_id,
                    outcome.attempt,
                    failure.error,
                    delay.as_secs_f64(),
                    failure.error_type,
                    self.policy.strategy_for(&task.agent_id).backoff
                );
                self.emit(SchedulerEvent::TaskRetrying {
                    task_id: task.task_id.clone(),
                    attempt: next_attempt,
                    delay,
                    error: failure.error,
                    error_type: failure.error_type,
                });
                match self.registry.get(&task.agent_id) {
                    Some(agent) => {
                        self.start_attempt(agent, &task, next_attempt, delay, tx)
                            .await
                    }
                    None => {
                        self.lanes.remove(&task.agent_id);
                        self.fail_routing(&task.task_id, &task.agent_id).await;
                    }
                }
            }
            RetryDecision::GiveUp { class, error_type } => {
                self.lanes.remove(&outcome.agent_id);
                self.record_attempt_metric(
                    outcome,
                    &task.task_type,
                    AttemptStatus::Fail,
                    (outcome.attempt > 1).then_some(false),
                    Some(failure.error_type.clone()),
                );
                clog_error!(
                    "Task {} failed after {} attempt(s): {} ({})",
                    task.task_id,
                    outcome.attempt,
                    failure.error,
                    error_type
                );
                self.fail_task(
                    &task.task_id,
                    &task.agent_id,
                    failure.error,
                    error_type,
                    class,
                    failure.error_type,
                    outcome.attempt,
                )
                .await;
            }
        }
    }

    /// Terminal failure: mark failed, block dependents, record once.
    #[allow(clippy::too_many_arguments)]
    async fn fail_task(
        &mut self,
        task_id: &TaskId,
        agent_id: &str,
        error: String,
        error_type: &str,
        class: ErrorClass,
        cause: String,
        attempts: u32,
    ) {
        let result = TaskResult::Error {
            error: error.clone(),
            error_type: error_type.to_string(),
            attempts,
            retry_strategy: self.policy.strategy_for(agent_id).backoff.to_string(),
        };

        let (task, blocked, events) = {
            let mut graph = self.graph.write().await;
            let blocked = match graph.mark_failed(task_id, result) {
                Ok(blocked) => blocked,
                Err(e) => {
                    clog_error!("Cannot fail {}: {}", task_id, e);
                    return;
                }
            };
            let Some(task) = graph.get_task(task_id).cloned() else {
                return;
            };
            let now = task.end_time.unwrap_or_else(Utc::now);
            let mut tracker = self.milestones.write().await;
            let mut events = tracker.on_task_terminal(task_id, &graph, now);
            let mut blocked_rows = Vec::new();
            for id in &blocked {
                events.extend(tracker.on_task_terminal(id, &graph, now));
                let reason = match graph.get_task(id).map(|t| &t.status) {
                    Some(TaskStatus::Blocked { reason }) => reason.clone(),
                    _ => String::new(),
                };
                blocked_rows.push((id.clone(), reason));
            }
            (task, blocked_rows, events)
        };

        self.failures.insert(task_id.clone(), (class, cause));
        let completion = self.completion_for(&task, false, error.clone());
        self.record_completion(&completion);

        self.emit(SchedulerEvent::TaskFailed {
            task_id: task_id.clone(),
            error,
            error_type: error_type.to_string(),
        });
        for (id, reason) in blocked {
            clog_warn!("Task {} blocked: {}", id, reason);
            self.emit(SchedulerEvent::TaskBlocked { task_id: id, reason });
        }
        self.publish(events).await;
    }

    fn completion_for(&mut self, task: &Task, success: bool, notes: String) -> TaskCompletion {
        let end_time = task.end_time.unwrap_or_else(Utc::now);
        let start_time = task.start_time.unwrap_or(end_time);
        TaskCompletion {
            task_id: task.task_id.clone(),
            agent_id: task.agent_id.clone(),
            estimated_duration: self.estimates.remove(&task.task_id).unwrap_or(0.0),
            actual_duration: crate::util::elapsed_secs(start_time, end_time),
            start_time,
            end_time,
            complexity: task.complexity(),
            dependencies: task.depends_on.clone(),
            success,
            notes,
        }
    }

    fn record_completion(&self, completion: &TaskCompletion) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_completion(completion) {
                clog_error!("Failed to save completion for {}: {}", completion.task_id, e);
            }
        }
        self.metrics.record_completion(completion);
    }

    /// Add tasks an agent returned under `details.tasks`.
    async fn inject_follow_ups(&mut self, parent: &TaskId, details: &serde_json::Value) {
        let Some(items) = details.get("tasks").and_then(|v| v.as_array()) else {
            return;
        };

        for item in items {
            let spec: TaskSpec = match serde_json::from_value(item.clone()) {
                Ok(spec) => spec,
                Err(e) => {
                    let task_id = item
                        .get("task_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<invalid>");
                    clog_warn!("Ignoring malformed follow-up from {}: {}", parent, e);
                    self.rejected.push(RejectedTask {
                        task_id: TaskId::from(task_id),
                        parent: parent.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let task_id = spec.task_id.clone();
            let finished_before = self.graph.read().await.finished_ids().len();
            match self.add_task(spec.into_task()).await {
                Ok(()) => {
                    clog!("Task {} added follow-up {}", parent, task_id);
                    self.emit(SchedulerEvent::TaskInjected {
                        task_id,
                        parent: parent.clone(),
                    });
                    self.report_blocked_since(finished_before).await;
                }
                Err(e) => {
                    clog_warn!("Rejected follow-up {} from {}: {}", task_id, parent, e);
                    self.rejected.push(RejectedTask {
                        task_id,
                        parent: parent.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // Follow-ups may name agents nobody registered.
        self.fail_unroutable().await;
    }

    /// Emit and account for tasks that an insertion left Blocked, i.e. a
    /// follow-up added under a dependency that already failed.
    async fn report_blocked_since(&mut self, finished_before: usize) {
        let (blocked, events) = {
            let graph = self.graph.read().await;
            let mut tracker = self.milestones.write().await;
            let mut events = Vec::new();
            let mut blocked = Vec::new();
            for id in graph.finished_ids().iter().skip(finished_before) {
                let Some(task) = graph.get_task(id) else {
                    continue;
                };
                if let TaskStatus::Blocked { reason } = &task.status {
                    let now = task.end_time.unwrap_or_else(Utc::now);
                    events.extend(tracker.on_task_terminal(id, &graph, now));
                    blocked.push((id.clone(), reason.clone()));
                }
            }
            (blocked, events)
        };

        for (id, reason) in blocked {
            clog_warn!("Task {} blocked: {}", id, reason);
            self.emit(SchedulerEvent::TaskBlocked { task_id: id, reason });
        }
        self.publish(events).await;
    }

    async fn check_milestones(&mut self) {
        let events = {
            let graph = self.graph.read().await;
            self.milestones
                .write()
                .await
                .check_delays(&graph, Utc::now())
        };
        self.publish(events).await;
    }

    /// Notify, emit and persist milestone transitions.
    async fn publish(&self, events: Vec<MilestoneEvent>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            let notifier = Arc::clone(&self.notifier);
            let delivered = with_deadline(Some(self.config.notify_timeout), async {
                Ok(notifier.notify(&event).await)
            })
            .await;
            match delivered {
                Ok(true) => {}
                Ok(false) => clog_warn!("Notification for {} not delivered", event.milestone_id()),
                Err(e) => clog_warn!("Notification for {} failed: {}", event.milestone_id(), e),
            }
            self.emit(SchedulerEvent::Milestone(event));
        }
        if let Err(e) = self.milestones.read().await.persist() {
            clog_error!("{}", e);
        }
    }

    async fn build_report(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cancelled: bool,
    ) -> RunReport {
        let graph = self.graph.read().await;
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut blocked = Vec::new();

        for id in graph.finished_ids() {
            let Some(task) = graph.get_task(id) else {
                continue;
            };
            match &task.status {
                TaskStatus::Completed => completed.push(id.clone()),
                TaskStatus::Failed { error } => {
                    let (error_type, attempts) = match &task.result {
                        Some(TaskResult::Error {
                            error_type,
                            attempts,
                            ..
                        }) => (error_type.clone(), *attempts),
                        _ => (FATAL.to_string(), task.attempts),
                    };
                    let (error_class, cause) = self
                        .failures
                        .get(id)
                        .cloned()
                        .unwrap_or((ErrorClass::Fatal, error_type.clone()));
                    failed.push(FailedTask {
                        task_id: id.clone(),
                        agent_id: task.agent_id.clone(),
                        error: error.clone(),
                        error_type,
                        error_class,
                        cause,
                        attempts,
                    });
                }
                TaskStatus::Blocked { reason } => blocked.push(BlockedTask {
                    task_id: id.clone(),
                    reason: reason.clone(),
                }),
                _ => {}
            }
        }

        let mut unfinished = graph.running_ids();
        unfinished.extend(graph.pending_ids());

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            completed,
            failed,
            blocked,
            unfinished,
            rejected: self.rejected.clone(),
            milestones: self.milestones.read().await.milestones().to_vec(),
            cancelled,
        }
    }
}
