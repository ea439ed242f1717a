//! Incremental sync engine and per-key serialization.
//!
//! Webhook deliveries and manual refreshes are two triggers into the same
//! engine; concurrency correctness comes from idempotent application plus
//! per-user serialization, not global locking.

pub mod engine;
mod gate;

pub use engine::{plan_change, pull_changes, sync, PulledChanges, RecordOp, SyncOutcome};
pub use gate::KeyedGate;
