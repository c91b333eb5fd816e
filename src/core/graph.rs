//! Task dependency graph.
//!
//! `TaskGraph` owns every task and the edges implied by their `depends_on`
//! lists. Edges point from a dependency to its dependent. The graph is an
//! arena: node indices follow insertion order and nodes are never removed,
//! so index order doubles as the deterministic tie-break for scheduling.

use crate::core::task::{Task, TaskId, TaskResult, TaskStatus};
use crate::error::GraphError;
use crate::{clog_debug, clog_warn};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

type GraphResult<T> = std::result::Result<T, GraphError>;

/// The task dependency graph.
#[derive(Clone)]
pub struct TaskGraph {
    /// The underlying directed graph (dependency -> dependent).
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Dependents whose dependency id has not been added yet.
    unresolved: HashMap<TaskId, Vec<NodeIndex>>,
    /// Terminal tasks, in the order they reached a terminal state.
    finished: Vec<TaskId>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            unresolved: HashMap::new(),
            finished: Vec::new(),
        }
    }

    /// Build a graph from tasks, adding them in order.
    pub fn from_tasks<I: IntoIterator<Item = Task>>(tasks: I) -> GraphResult<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        Ok(graph)
    }

    /// Add a task and the edges implied by its `depends_on` list.
    ///
    /// Dependencies that are not in the graph yet are remembered and wired
    /// up when the named task arrives. The cycle check runs against the
    /// prospective graph, so a rejected task leaves the graph untouched.
    ///
    /// # Errors
    /// - `DuplicateId` if a task with the same id exists
    /// - `CycleDetected` if the new edges would close a cycle
    pub fn add_task(&mut self, mut task: Task) -> GraphResult<NodeIndex> {
        if self.task_index.contains_key(&task.task_id) {
            return Err(GraphError::DuplicateId(task.task_id));
        }

        let mut seen = HashSet::new();
        task.depends_on.retain(|dep| seen.insert(dep.clone()));

        if task.depends_on.contains(&task.task_id) {
            return Err(GraphError::CycleDetected {
                via: vec![task.task_id.clone()],
                task_id: task.task_id,
            });
        }

        if let Some(via) = self.find_cycle(&task) {
            return Err(GraphError::CycleDetected {
                task_id: task.task_id,
                via,
            });
        }

        let id = task.task_id.clone();
        let deps = task.depends_on.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);

        for dep in &deps {
            match self.task_index.get(dep) {
                Some(&dep_index) => {
                    self.graph.add_edge(dep_index, index, ());
                }
                None => {
                    clog_debug!("Task {} waits on unknown dependency {}", id, dep);
                    self.unresolved.entry(dep.clone()).or_default().push(index);
                }
            }
        }

        if let Some(waiters) = self.unresolved.remove(&id) {
            for waiter in waiters {
                self.graph.add_edge(index, waiter, ());
            }
        }

        // A task added below an already-failed dependency can never run.
        if let Some(dead) = deps.iter().find(|dep| self.is_dead(dep)) {
            let reason = format!("dependency {} did not complete", dead);
            self.block_node(index, &reason);
            self.propagate_block(index, &id);
        }

        Ok(index)
    }

    /// Search for a path that would close a cycle through `task`.
    ///
    /// A cycle exists when some existing task already waiting on `task`
    /// is reachable by walking dependencies from `task`'s own dependencies.
    /// Iterative DFS with an explicit stack and visited set.
    fn find_cycle(&self, task: &Task) -> Option<Vec<TaskId>> {
        let waiters: HashSet<NodeIndex> = self
            .unresolved
            .get(&task.task_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();
        if waiters.is_empty() {
            return None;
        }

        let mut parent: HashMap<NodeIndex, Option<NodeIndex>> = HashMap::new();
        let mut stack: Vec<NodeIndex> = Vec::new();
        for dep in &task.depends_on {
            if let Some(&start) = self.task_index.get(dep) {
                if !parent.contains_key(&start) {
                    parent.insert(start, None);
                    stack.push(start);
                }
            }
        }

        while let Some(node) = stack.pop() {
            if waiters.contains(&node) {
                // Walk parents back to the dependency we started from.
                let mut path = vec![self.graph[node].task_id.clone()];
                let mut cursor = node;
                while let Some(Some(prev)) = parent.get(&cursor) {
                    path.push(self.graph[*prev].task_id.clone());
                    cursor = *prev;
                }
                return Some(path);
            }
            for next in self.graph.neighbors_directed(node, Direction::Incoming) {
                if !parent.contains_key(&next) {
                    parent.insert(next, Some(node));
                    stack.push(next);
                }
            }
            // Dangling references also count as edges for the prospective graph.
            for dep in &self.graph[node].depends_on {
                if dep == &task.task_id {
                    let mut path = vec![self.graph[node].task_id.clone()];
                    let mut cursor = node;
                    while let Some(Some(prev)) = parent.get(&cursor) {
                        path.push(self.graph[*prev].task_id.clone());
                        cursor = *prev;
                    }
                    return Some(path);
                }
            }
        }

        None
    }

    fn is_dead(&self, id: &TaskId) -> bool {
        self.get_task(id)
            .map(|t| {
                matches!(
                    t.status,
                    TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
                )
            })
            .unwrap_or(false)
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    fn node(&self, id: &TaskId) -> GraphResult<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of resolved dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |i| &self.graph[i])
    }

    /// Tasks the given task depends on (resolved dependencies only).
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Dependency references that name tasks never added.
    pub fn unresolved_dependencies(&self) -> Vec<(TaskId, TaskId)> {
        let mut missing: Vec<(TaskId, TaskId)> = self
            .unresolved
            .iter()
            .flat_map(|(dep, waiters)| {
                waiters
                    .iter()
                    .map(move |&w| (self.graph[w].task_id.clone(), dep.clone()))
            })
            .collect();
        missing.sort();
        missing
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose every dependency is Completed.
    ///
    /// Ordered by descending priority, then insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks()
            .filter(|task| task.is_pending() && self.dependencies_completed(task))
            .collect();
        // Stable sort keeps insertion order within a priority.
        ready.sort_by(|a, b| b.priority().cmp(&a.priority()));
        ready
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.get_task(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Transition a Pending task whose dependencies are complete to Running.
    pub fn mark_running(&mut self, id: &TaskId) -> GraphResult<()> {
        let index = self.node(id)?;
        let task = &self.graph[index];
        if !task.is_pending() || !self.dependencies_completed(task) {
            return Err(GraphError::InvalidTransition {
                task_id: id.clone(),
                from: task.status.name().to_string(),
                to: "running".to_string(),
            });
        }
        self.graph[index].start();
        Ok(())
    }

    /// Count one more dispatch attempt for a task. Returns the new total.
    pub fn record_attempt(&mut self, id: &TaskId) -> GraphResult<u32> {
        let index = self.node(id)?;
        let task = &mut self.graph[index];
        task.attempts += 1;
        Ok(task.attempts)
    }

    /// Transition a Running task to Completed.
    pub fn mark_completed(&mut self, id: &TaskId, details: serde_json::Value) -> GraphResult<()> {
        let index = self.node(id)?;
        if self.graph[index].status != TaskStatus::Running {
            return Err(GraphError::InvalidTransition {
                task_id: id.clone(),
                from: self.graph[index].status.name().to_string(),
                to: "completed".to_string(),
            });
        }
        self.graph[index].complete(details);
        self.finished.push(id.clone());
        Ok(())
    }

    /// Transition a Pending or Running task to Failed and block everything
    /// downstream of it.
    ///
    /// Returns the ids newly moved to Blocked, in the order they were reached.
    pub fn mark_failed(&mut self, id: &TaskId, result: TaskResult) -> GraphResult<Vec<TaskId>> {
        let index = self.node(id)?;
        if self.graph[index].is_finished() {
            return Err(GraphError::InvalidTransition {
                task_id: id.clone(),
                from: self.graph[index].status.name().to_string(),
                to: "failed".to_string(),
            });
        }
        self.graph[index].fail(result);
        self.finished.push(id.clone());
        Ok(self.propagate_block(index, id))
    }

    fn block_node(&mut self, index: NodeIndex, reason: &str) {
        let id = self.graph[index].task_id.clone();
        self.graph[index].block(reason);
        self.finished.push(id);
    }

    /// Worklist over direct dependents: each Pending dependent is re-checked
    /// and blocked, then its own dependents are queued.
    fn propagate_block(&mut self, from: NodeIndex, root: &TaskId) -> Vec<TaskId> {
        let mut blocked = Vec::new();
        let mut worklist: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(from, Direction::Outgoing)
            .collect();
        worklist.reverse();

        while let Some(node) = worklist.pop() {
            let task = &self.graph[node];
            if !task.is_pending() {
                continue;
            }
            let has_dead_dep = task.depends_on.iter().any(|dep| self.is_dead(dep));
            if !has_dead_dep {
                continue;
            }
            let reason = format!("upstream task {} failed", root);
            clog_warn!("Blocking task {}: {}", self.graph[node].task_id, reason);
            self.block_node(node, &reason);
            blocked.push(self.graph[node].task_id.clone());

            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            next.reverse();
            worklist.extend(next);
        }

        blocked
    }

    /// True when no task is Pending or Running.
    pub fn is_drained(&self) -> bool {
        self.tasks()
            .all(|t| !matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
    }

    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.ids_where(|t| t.status == TaskStatus::Pending)
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.ids_where(|t| t.status == TaskStatus::Running)
    }

    fn ids_where<F: Fn(&Task) -> bool>(&self, pred: F) -> Vec<TaskId> {
        self.tasks()
            .filter(|t| pred(t))
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Terminal tasks in the order they finished.
    pub fn finished_ids(&self) -> &[TaskId] {
        &self.finished
    }

    /// Tasks in topological order (every task after its dependencies).
    pub fn topological_order(&self) -> GraphResult<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].task_id.clone();
            GraphError::CycleDetected {
                via: vec![id.clone()],
                task_id: id,
            }
        })?;
        Ok(sorted.into_iter().map(|i| &self.graph[i]).collect())
    }

    /// Transitive dependencies of a task followed by the task itself,
    /// dependencies first.
    pub fn dependency_chain(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };

        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        // (node, children already pushed)
        let mut stack = vec![(start, false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                chain.push(self.graph[node].task_id.clone());
                continue;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.push((node, true));
            let mut deps: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|d| !visited.contains(d))
                .collect();
            deps.sort();
            for dep in deps.into_iter().rev() {
                stack.push((dep, false));
            }
        }

        chain
    }

    /// One chain per terminal task (no dependents) that has dependencies.
    pub fn dependency_chains(&self) -> Vec<Vec<TaskId>> {
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Outgoing)
                    .next()
                    .is_none()
                    && self
                        .graph
                        .neighbors_directed(i, Direction::Incoming)
                        .next()
                        .is_some()
            })
            .map(|i| self.dependency_chain(&self.graph[i].task_id))
            .collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("unresolved", &self.unresolved.len())
            .finish()
    }
}
