//! Conflict resolution surface.
//!
//! Lists recorded divergences and applies a resolution strategy to one of
//! them. The state flip itself is transactional inside the store: either the
//! whole strategy lands or nothing changes.

use std::sync::Arc;
use tracing::info;

use keel_common::{Error, Payload, Resolution, Result};
use keel_store::{Conflict, LocalStore};

/// Resolution API consumed by whatever presents conflicts to a user.
pub struct ConflictResolver {
    store: Arc<LocalStore>,
}

impl ConflictResolver {
    /// Create a resolver over the local store.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// All conflicts awaiting resolution, oldest first.
    pub fn open(&self) -> Result<Vec<Conflict>> {
        self.store.open_conflicts()
    }

    /// Resolve one conflict.
    ///
    /// - `LocalWins` re-enqueues the local side; the next pass pushes it.
    /// - `RemoteWins` installs the remote side locally and drops the queued
    ///   change.
    /// - `ManualMerge` requires `merged` and enqueues it.
    ///
    /// # Errors
    /// - `NotFound` for an unknown conflict id
    /// - `InvalidInput` for an already-resolved conflict, a missing merge
    ///   payload, or `Resolution::Unresolved`
    pub fn resolve(
        &self,
        conflict_id: i64,
        strategy: Resolution,
        merged: Option<Payload>,
    ) -> Result<()> {
        if strategy == Resolution::Unresolved {
            return Err(Error::InvalidInput(
                "Pick local-wins, remote-wins, or manual-merge".to_string(),
            ));
        }
        if strategy == Resolution::ManualMerge && merged.is_none() {
            return Err(Error::InvalidInput(
                "manual-merge requires a merged payload".to_string(),
            ));
        }

        self.store
            .resolve_conflict(conflict_id, strategy, merged.as_ref())?;
        info!("Conflict {} resolved as {}", conflict_id, strategy.as_str());
        Ok(())
    }
}
