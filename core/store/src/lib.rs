//! Embedded local store for Keel.
//!
//! Restart-durable SQLite storage for mirrored records, the pending-change
//! queue, per-collection sync metadata, recorded conflicts, and persisted
//! settings. Every public operation is atomic: multi-statement mutations run
//! inside a single transaction, so a crash never leaves a record and its
//! queue entry disagreeing.

pub mod model;
pub mod store;

pub use model::{Conflict, LocalRecord, PendingChange, SyncMetadata};
pub use store::{
    LocalStore, SETTING_FORCE_OFFLINE, SETTING_SYNC_ENABLED, SETTING_SYNC_INTERVAL_SECS,
};
