//! JSON persistence for completions, agent history and milestones.
//!
//! Layout under the data directory:
//! - `completion_<task_id>.json` per terminal task
//! - `agent_metrics_<agent_id>.json` per agent
//! - `milestones.json` holding every milestone, replaced atomically

use crate::estimation::throughput::{AgentHistory, TaskCompletion};
use crate::milestone::Milestone;
use crate::{clog_debug, clog_warn, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const COMPLETION_PREFIX: &str = "completion_";
const AGENT_METRICS_PREFIX: &str = "agent_metrics_";
const MILESTONES_FILE: &str = "milestones.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

/// Percent-encode an id into a file name component. Distinct ids always
/// give distinct stems.
fn file_stem(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            clog_debug!("Creating data directory: {}", self.dir.display());
            fs::create_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Write to a sibling temp file, then rename over the target.
    fn write_atomic<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self.dir.join(format!(".{}.tmp", name));
        fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn completion_path(&self, task_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", COMPLETION_PREFIX, file_stem(task_id)))
    }

    pub fn agent_metrics_path(&self, agent_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", AGENT_METRICS_PREFIX, file_stem(agent_id)))
    }

    pub fn milestones_path(&self) -> PathBuf {
        self.dir.join(MILESTONES_FILE)
    }

    pub fn save_completion(&self, completion: &TaskCompletion) -> Result<()> {
        let path = self.completion_path(completion.task_id.as_str());
        self.write_atomic(&path, completion)?;
        clog_debug!("Saved completion for {}", completion.task_id);
        Ok(())
    }

    /// All saved completions, ordered by end time.
    pub fn load_completions(&self) -> Result<Vec<TaskCompletion>> {
        let mut completions = Vec::new();
        for path in self.files_with_prefix(COMPLETION_PREFIX)? {
            let completion: TaskCompletion = serde_json::from_str(&fs::read_to_string(&path)?)?;
            completions.push(completion);
        }
        completions.sort_by_key(|c| c.end_time);
        Ok(completions)
    }

    pub fn load_agent_history(&self, agent_id: &str) -> Result<AgentHistory> {
        let path = self.agent_metrics_path(agent_id);
        if !path.exists() {
            return Ok(AgentHistory::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// Fold a completion into the agent's persisted history.
    pub fn record_agent_history(&self, completion: &TaskCompletion) -> Result<AgentHistory> {
        let mut history = self.load_agent_history(&completion.agent_id)?;
        history.record(completion);
        self.write_atomic(&self.agent_metrics_path(&completion.agent_id), &history)?;
        Ok(history)
    }

    /// Every agent history on disk, keyed by agent id. Older files carry
    /// no id and fall back to the decoded file name.
    pub fn load_agent_histories(&self) -> Result<HashMap<String, AgentHistory>> {
        let mut histories = HashMap::new();
        for path in self.files_with_prefix(AGENT_METRICS_PREFIX)? {
            let mut history: AgentHistory = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if history.agent_id.is_empty() {
                let decoded = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix(AGENT_METRICS_PREFIX))
                    .and_then(|s| urlencoding::decode(s).ok())
                    .map(|s| s.into_owned());
                match decoded {
                    Some(agent_id) => history.agent_id = agent_id,
                    None => {
                        clog_warn!("Skipping agent history with no id: {}", path.display());
                        continue;
                    }
                }
            }
            histories.insert(history.agent_id.clone(), history);
        }
        Ok(histories)
    }

    pub fn save_milestones(&self, milestones: &[Milestone]) -> Result<()> {
        self.write_atomic(&self.milestones_path(), milestones)
    }

    pub fn load_milestones(&self) -> Result<Vec<Milestone>> {
        let path = self.milestones_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    fn files_with_prefix(&self, prefix: &str) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix) && n.ends_with(".json"))
                .unwrap_or(false);
            if matches {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
