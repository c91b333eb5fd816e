//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted agents with per-call outcomes and virtual durations
//! - A shared gauge for observing concurrency
//! - A notifier that records milestone events
//! - Predefined task graphs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use cadence::core::{Task, TaskGraph, TaskId};
use cadence::milestone::MilestoneEvent;
use cadence::orchestration::{
    Agent, AgentRequest, AgentResponse, Notifier, SchedulerEvent,
};
use cadence::{Error, Result};

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(serde_json::Value),
    /// Answer with an error response of this type.
    Fail(&'static str),
    /// Return `Err(Error::Fatal)` from `execute`.
    Fatal,
    /// Return `Err(Error::Transient)` from `execute`.
    Crash,
    /// Never answer.
    Hang,
}

/// Tracks how many calls are in flight and the highest count seen.
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Agent that plays back a script, then repeats `fallback`.
pub struct ScriptedAgent {
    id: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    /// Virtual time each call takes before answering.
    work: Duration,
    calls: Mutex<Vec<(TaskId, Instant)>>,
    own: Arc<Gauge>,
    shared: Option<Arc<Gauge>>,
}

impl ScriptedAgent {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Succeed(serde_json::Value::Null),
            work: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            own: Gauge::new(),
            shared: None,
        }
    }

    /// Agent that always succeeds.
    pub fn ok(id: &str) -> Arc<Self> {
        Arc::new(Self::new(id))
    }

    /// Agent that always answers with an error of `error_type`.
    pub fn failing(id: &str, error_type: &'static str) -> Arc<Self> {
        Arc::new(Self::new(id).otherwise(Step::Fail(error_type)))
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn otherwise(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn taking(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn sharing(mut self, gauge: Arc<Gauge>) -> Self {
        self.shared = Some(gauge);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn called_tasks(&self) -> Vec<TaskId> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.own.peak()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((request.task_id.clone(), Instant::now()));
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.own.enter();
        if let Some(shared) = &self.shared {
            shared.enter();
        }
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.own.leave();
        if let Some(shared) = &self.shared {
            shared.leave();
        }

        match step {
            Step::Succeed(details) => Ok(AgentResponse::success(details)),
            Step::Fail(error_type) => Ok(AgentResponse::error(
                &format!("{} failure", error_type),
                error_type,
            )),
            Step::Fatal => Err(Error::Fatal("refused".to_string())),
            Step::Crash => Err(Error::Transient("connection dropped".to_string())),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Notifier that keeps every event it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<MilestoneEvent>>,
    deliver: bool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            deliver: true,
        })
    }

    /// A notifier whose deliveries always fail.
    pub fn broken() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MilestoneEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &MilestoneEvent) -> bool {
        self.events.lock().unwrap().push(event.clone());
        self.deliver
    }
}

pub fn shared_graph(tasks: Vec<Task>) -> Arc<RwLock<TaskGraph>> {
    Arc::new(RwLock::new(
        TaskGraph::from_tasks(tasks).expect("valid test graph"),
    ))
}

/// a -> {b, c} -> d, spread over three agents.
pub fn diamond() -> Vec<Task> {
    vec![
        Task::new("a", "backend", "schema"),
        Task::new("b", "backend", "api").depends_on(["a"]),
        Task::new("c", "frontend", "component").depends_on(["a"]),
        Task::new("d", "qa", "integration_test").depends_on(["b", "c"]),
    ]
}

/// Drain everything currently queued on an event channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn position(events: &[SchedulerEvent], wanted: impl Fn(&SchedulerEvent) -> bool) -> usize {
    events
        .iter()
        .position(wanted)
        .expect("event should have been emitted")
}
