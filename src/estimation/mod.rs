//! Duration estimation: per-agent throughput, critical path, and the
//! execution simulator that projects a calendar timeline.

pub mod critical_path;
pub mod simulator;
pub mod throughput;

pub use critical_path::{analyze_queue, critical_path, earliest_completion, CriticalPath, QueueAnalysis};
pub use simulator::{
    identify_risks, simulate, Checkpoint, CriticalPathEstimator, RiskFactor, ScheduledTask,
    Severity, Simulation, TaskWindow, Timeline, TimelineEstimate,
};
pub use throughput::{
    AgentHistory, AgentThroughput, CompletionSample, DurationEstimator, TaskCompletion,
    ThroughputTracker,
};
