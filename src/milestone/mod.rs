//! Milestones: named task groups tracked against an expected date.

mod tracker;

pub use tracker::{DelayRule, Milestone, MilestoneEvent, MilestoneStatus, MilestoneTracker};
