//! Remote collaborator abstraction for Keel.
//!
//! This module defines the trait boundary the sync core talks to: any system
//! of record that can fetch rows and apply row mutations is usable. Transport,
//! authentication, and server-side schema live behind the trait.
//!
//! # Design Principles
//! - Backend isolation: no transport-specific logic in the store or sync crates
//! - Async operations: every call is a suspension point
//! - Explicit outcomes: conflicts are data, not errors; failures are classified
//!   transient or permanent at this boundary

pub mod backend;
pub mod memory;

pub use backend::{ApplyOutcome, ChangeRequest, Filter, RemoteBackend, RemoteRecord};
pub use memory::MemoryBackend;
