//! Agent execution contract and the typed agent registry.
//!
//! An agent takes one task at a time and answers with a success payload
//! or a classified error. The registry maps agent ids to implementations
//! and resolves tasks that name no agent by task-type prefix.

use crate::core::task::{Task, TaskId, TaskMetadata};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};

/// What an agent receives for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub task_type: String,
    pub description: String,
    pub metadata: TaskMetadata,
}

impl From<&Task> for AgentRequest {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            description: task.description.clone(),
            metadata: task.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// What an agent answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl AgentResponse {
    pub fn success(details: serde_json::Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            details,
            error: None,
            error_type: None,
        }
    }

    pub fn error(error: &str, error_type: &str) -> Self {
        Self {
            status: ResponseStatus::Error,
            details: serde_json::Value::Null,
            error: Some(error.to_string()),
            error_type: Some(error_type.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// An executor for tasks.
///
/// `execute` may be called more than once for the same task after a
/// transient failure. Returning `Err(Error::Fatal(_))` stops retries; any
/// other `Err` is treated as transient.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse>;
}

/// Agents by id, plus task-type prefix routes.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    /// (task type prefix, agent id)
    routes: Vec<(String, String)>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        clog_debug!("Registering agent {}", agent.id());
        self.agents.insert(agent.id().to_string(), agent);
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    /// Route tasks with no agent whose type starts with `prefix`.
    pub fn with_route(mut self, prefix: &str, agent_id: &str) -> Self {
        self.routes.push((prefix.to_string(), agent_id.to_string()));
        self
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Resolve the agent for a task.
    ///
    /// A named agent must be registered. Otherwise the longest matching
    /// task-type prefix wins.
    pub fn route(&self, task: &Task) -> Result<String> {
        if !task.agent_id.is_empty() {
            if self.contains(&task.agent_id) {
                return Ok(task.agent_id.clone());
            }
            return Err(Error::Routing {
                task_id: task.task_id.clone(),
                agent_id: task.agent_id.clone(),
            });
        }

        self.routes
            .iter()
            .filter(|(prefix, agent_id)| {
                task.task_type.starts_with(prefix.as_str()) && self.contains(agent_id)
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, agent_id)| agent_id.clone())
            .ok_or_else(|| Error::Routing {
                task_id: task.task_id.clone(),
                agent_id: format!("<unrouted {}>", task.task_type),
            })
    }

    /// Every route must point at a registered agent.
    pub fn validate(&self) -> Result<()> {
        for (prefix, agent_id) in &self.routes {
            if !self.contains(agent_id) {
                return Err(Error::Validation(format!(
                    "route '{}' points at unknown agent '{}'",
                    prefix, agent_id
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agent_ids())
            .field("routes", &self.routes)
            .finish()
    }
}

/// Agent backed by an external command.
///
/// The request is written to the command's stdin as JSON; the response
/// is read from its stdout as JSON. A non-zero exit is a transient error.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    id: String,
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(id: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            args,
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
        clog_debug!("CommandAgent {} running {} for {}", self.id, self.command, request.task_id);
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Fatal(format!("failed to start {}: {}", self.command, e)))?;

        let payload = serde_json::to_vec(&request)?;
        if let Some(stdin) = child.stdin.take() {
            feed_stdin(stdin, &payload, &self.id).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            clog_warn!("CommandAgent {} exited with {}", self.id, output.status);
            return Err(Error::Transient(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Fatal(format!("invalid response from {}: {}", self.command, e)))
    }
}

/// Write the request and close stdin. A command may answer without
/// reading its input; its exit status and stdout still decide the outcome.
async fn feed_stdin(mut stdin: ChildStdin, payload: &[u8], agent_id: &str) -> Result<()> {
    let written = match stdin.write_all(payload).await {
        Ok(()) => stdin.shutdown().await,
        Err(e) => Err(e),
    };
    match written {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            clog_debug!("CommandAgent {} closed stdin early", agent_id);
            Ok(())
        }
        other => other.map_err(Error::from),
    }
}
