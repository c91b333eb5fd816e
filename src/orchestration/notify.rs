//! Milestone notification delivery.
//!
//! Delivery is best effort: a `false` return or a slow notifier is logged
//! and never fails the run.

use crate::milestone::MilestoneEvent;
use crate::{clog, clog_warn};
use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the event was delivered.
    async fn notify(&self, event: &MilestoneEvent) -> bool;
}

/// Writes milestone events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &MilestoneEvent) -> bool {
        match event {
            MilestoneEvent::Delay { .. } => clog_warn!("{}", event),
            MilestoneEvent::Update { .. } => clog!("{}", event),
        }
        true
    }
}
