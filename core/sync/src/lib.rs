//! Keel Sync Core
//!
//! This module provides the offline-first synchronization machinery:
//! - Connectivity-aware data access with a durable local mirror
//! - A pending-change queue drained against the remote system of record
//! - Conflict detection with explicit resolution strategies
//! - Retry strategy with exponential backoff
//! - Interval/reconnect/manual scheduling of reconciliation passes

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod facade;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use conflict::ConflictResolver;
pub use connectivity::Connectivity;
pub use engine::{PassPhase, PassSummary, Reconciler, ReconcilerConfig};
pub use facade::{DataAccess, Freshness, ReadResult};
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SyncScheduler};
