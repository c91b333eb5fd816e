//! Core domain models for cadence.
//!
//! This module contains the task model, the dependency graph that owns
//! tasks, and the plan format used to build a graph from JSON.

pub mod graph;
pub mod plan;
pub mod task;

pub use graph::TaskGraph;
pub use plan::{MilestoneSpec, Plan, TaskSpec};
pub use task::{Priority, Task, TaskId, TaskMetadata, TaskResult, TaskStatus};
