use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::orchestration::{
    AgentRegistry, CommandAgent, ErrorRule, RetryPolicy, RetryStrategy, SchedulerConfig,
};
use crate::state::StateStore;
use crate::{clog_debug, Error, Result};

/// How to start one command-backed agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retry: RetryStrategy,
    pub agent_retry: BTreeMap<String, RetryStrategy>,
    pub error_rules: BTreeMap<String, ErrorRule>,
    /// 0 disables the per-attempt deadline.
    pub task_timeout_secs: u64,
    pub max_concurrency: Option<usize>,
    pub default_task_duration_secs: f64,
    pub simulation_tick_secs: f64,
    pub delay_margin: f64,
    pub data_dir: Option<String>,
    pub agents: BTreeMap<String, AgentCommand>,
    /// Task type prefix to agent id.
    pub routes: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryStrategy::default(),
            agent_retry: BTreeMap::new(),
            error_rules: BTreeMap::new(),
            task_timeout_secs: 300,
            max_concurrency: None,
            default_task_duration_secs: 300.0,
            simulation_tick_secs: 1.0,
            delay_margin: 0.5,
            data_dir: None,
            agents: BTreeMap::new(),
            routes: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn cadence_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadence_dir()?.join("cadence.toml"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadence_dir()?.join("data")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: {} agent(s), {} route(s), timeout={}s",
            config.agents.len(),
            config.routes.len(),
            config.task_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                clog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if !(self.simulation_tick_secs.is_finite() && self.simulation_tick_secs > 0.0) {
            return Err(Error::Validation(format!(
                "simulation_tick_secs must be positive, got {}",
                self.simulation_tick_secs
            )));
        }
        if self.delay_margin.is_nan() || self.delay_margin < 0.0 {
            return Err(Error::Validation(format!(
                "delay_margin must be non-negative, got {}",
                self.delay_margin
            )));
        }
        for (prefix, agent_id) in &self.routes {
            if !self.agents.contains_key(agent_id) {
                return Err(Error::Validation(format!(
                    "route '{}' points at unknown agent '{}'",
                    prefix, agent_id
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(self.retry.clone());
        for (agent_id, strategy) in &self.agent_retry {
            policy = policy.with_agent_strategy(agent_id, strategy.clone());
        }
        for (error_type, rule) in &self.error_rules {
            policy = policy.with_rule(error_type, *rule);
        }
        policy
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            task_timeout: (self.task_timeout_secs > 0)
                .then(|| Duration::from_secs(self.task_timeout_secs)),
            max_concurrency: self.max_concurrency,
            ..SchedulerConfig::default()
        }
    }

    /// Registry of command-backed agents plus the configured routes.
    pub fn registry(&self) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for (agent_id, agent) in &self.agents {
            registry.register(Arc::new(CommandAgent::new(
                agent_id,
                &agent.command,
                agent.args.clone(),
            )));
        }
        for (prefix, agent_id) in &self.routes {
            registry = registry.with_route(prefix, agent_id);
        }
        registry
    }

    pub fn store(&self) -> Result<StateStore> {
        Ok(StateStore::new(self.data_dir()?))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
