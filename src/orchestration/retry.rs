//! Retry policy: error classification and backoff.
//!
//! The policy is table driven. Each error type maps to an [`ErrorRule`]
//! (class plus retry ceiling); the backoff curve comes from the
//! [`RetryStrategy`] configured for the agent, or the global default.

use crate::core::task::TaskId;
use crate::clog_warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Error type recorded when a fatal error ends a task.
pub const FATAL: &str = "fatal";
/// Error type recorded when a transient error runs out of retries.
pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";
/// Error type recorded when no agent can take a task.
pub const ROUTING: &str = "routing";
/// Error type of an attempt that hit its deadline.
pub const TIMEOUT: &str = "timeout";
/// Error type of an agent that panicked mid-attempt.
pub const PANIC: &str = "panic";

const DEFAULT_TRANSIENT_CEILING: u32 = 3;

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Backoff {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

impl Backoff {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "exponential" => Some(Backoff::Exponential),
            "linear" => Some(Backoff::Linear),
            "fixed" => Some(Backoff::Fixed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backoff::Exponential => "exponential",
            Backoff::Linear => "linear",
            Backoff::Fixed => "fixed",
        }
    }
}

impl From<String> for Backoff {
    fn from(name: String) -> Self {
        Backoff::parse(&name).unwrap_or_else(|| {
            clog_warn!("Unknown backoff strategy '{}', using exponential", name);
            Backoff::Exponential
        })
    }
}

impl From<Backoff> for String {
    fn from(backoff: Backoff) -> Self {
        backoff.as_str().to_string()
    }
}

impl std::fmt::Display for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff configuration for one agent (or the global default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    #[serde(alias = "retries")]
    pub max_retries: u32,
    /// Seconds.
    #[serde(alias = "delay")]
    pub base_delay: f64,
    /// Seconds.
    pub max_delay: f64,
    #[serde(alias = "backoff_strategy")]
    pub backoff: Backoff,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 32.0,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryStrategy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let secs = match self.backoff {
            Backoff::Exponential => {
                let exp = (attempt - 1).min(1023) as i32;
                (self.base_delay * 2f64.powi(exp)).min(self.max_delay)
            }
            Backoff::Linear => (self.base_delay * attempt as f64).min(self.max_delay),
            Backoff::Fixed => self.base_delay,
        };
        secs_to_duration(secs)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Classification of one error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRule {
    pub class: ErrorClass,
    /// Upper bound on retries for this error type, on top of the strategy's own.
    #[serde(default)]
    pub ceiling: u32,
}

impl ErrorRule {
    pub fn transient(ceiling: u32) -> Self {
        Self {
            class: ErrorClass::Transient,
            ceiling,
        }
    }

    pub fn fatal() -> Self {
        Self {
            class: ErrorClass::Fatal,
            ceiling: 0,
        }
    }
}

/// Built-in classification table.
pub fn default_rules() -> HashMap<String, ErrorRule> {
    let mut rules = HashMap::new();
    for name in ["transient", "connection", TIMEOUT, "rate_limit", "unavailable", PANIC] {
        rules.insert(name.to_string(), ErrorRule::transient(DEFAULT_TRANSIENT_CEILING));
    }
    for name in [FATAL, "permission", "resource", "validation", "not_found", ROUTING] {
        rules.insert(name.to_string(), ErrorRule::fatal());
    }
    rules
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep `delay`, then run attempt number `next_attempt`.
    Retry { delay: Duration, next_attempt: u32 },
    /// Stop. `error_type` is what the task's final result records.
    GiveUp {
        class: ErrorClass,
        error_type: &'static str,
    },
}

/// Classifies errors and decides between retry and terminal failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    default_strategy: RetryStrategy,
    agent_strategies: HashMap<String, RetryStrategy>,
    rules: HashMap<String, ErrorRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryStrategy::default())
    }
}

impl RetryPolicy {
    pub fn new(default_strategy: RetryStrategy) -> Self {
        Self {
            default_strategy,
            agent_strategies: HashMap::new(),
            rules: default_rules(),
        }
    }

    /// Override the strategy for one agent.
    pub fn with_agent_strategy(mut self, agent_id: &str, strategy: RetryStrategy) -> Self {
        self.agent_strategies.insert(agent_id.to_string(), strategy);
        self
    }

    /// Register or replace the rule for an error type.
    pub fn with_rule(mut self, error_type: &str, rule: ErrorRule) -> Self {
        self.rules.insert(error_type.to_ascii_lowercase(), rule);
        self
    }

    pub fn strategy_for(&self, agent_id: &str) -> &RetryStrategy {
        self.agent_strategies
            .get(agent_id)
            .unwrap_or(&self.default_strategy)
    }

    /// Rule for an error type. Unregistered types are fatal.
    pub fn rule(&self, error_type: &str) -> ErrorRule {
        self.rules
            .get(&error_type.to_ascii_lowercase())
            .copied()
            .unwrap_or_else(ErrorRule::fatal)
    }

    pub fn classify(&self, error_type: &str) -> ErrorClass {
        self.rule(error_type).class
    }

    /// Retries allowed for this agent and error type.
    pub fn retry_budget(&self, agent_id: &str, error_type: &str) -> u32 {
        let rule = self.rule(error_type);
        match rule.class {
            ErrorClass::Fatal => 0,
            ErrorClass::Transient => self.strategy_for(agent_id).max_retries.min(rule.ceiling),
        }
    }

    /// Decide after attempt number `attempt` (1-based) failed with `error_type`.
    pub fn decide(&self, agent_id: &str, error_type: &str, attempt: u32) -> RetryDecision {
        let class = self.classify(error_type);
        if class == ErrorClass::Fatal {
            let error_type = if error_type.eq_ignore_ascii_case(ROUTING) {
                ROUTING
            } else {
                FATAL
            };
            return RetryDecision::GiveUp { class, error_type };
        }

        if attempt > self.retry_budget(agent_id, error_type) {
            return RetryDecision::GiveUp {
                class,
                error_type: MAX_RETRIES_EXCEEDED,
            };
        }

        RetryDecision::Retry {
            delay: self.strategy_for(agent_id).delay(attempt),
            next_attempt: attempt + 1,
        }
    }
}

/// Counts retries per task.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new retry count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}
