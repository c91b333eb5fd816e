//! On-disk state for cadence runs.
//!
//! Completion records, per-agent history and milestone snapshots are kept
//! as JSON files under the configured data directory.

mod store;

pub use store::StateStore;
