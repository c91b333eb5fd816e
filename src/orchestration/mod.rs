//! Orchestration layer for cadence.
//!
//! This module provides the dispatch loop that drives a task graph to
//! completion, the retry policy it consults on failure, the agent
//! contract and registry it dispatches through, and the metrics and
//! notification seams it reports to.

pub mod agent;
pub mod metrics;
pub mod notify;
pub mod report;
pub mod retry;
pub mod scheduler;

pub use crate::milestone::MilestoneEvent;
pub use agent::{Agent, AgentRegistry, AgentRequest, AgentResponse, CommandAgent, ResponseStatus};
pub use metrics::{AttemptMetric, AttemptStatus, LogMetrics, MemoryMetrics, MetricsSink};
pub use notify::{LogNotifier, Notifier};
pub use report::{BlockedTask, FailedTask, RejectedTask, RunReport};
pub use retry::{
    default_rules, Backoff, ErrorClass, ErrorRule, RetryDecision, RetryPolicy, RetryStrategy,
    RetryTracker, MAX_RETRIES_EXCEEDED,
};
pub use scheduler::{
    LaneState, Scheduler, SchedulerConfig, SchedulerEvent, TaskSnapshot, DEFAULT_TASK_TIMEOUT,
};
