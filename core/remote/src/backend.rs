//! Remote backend trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_common::{Collection, ConflictKind, Operation, Payload, RecordId, Result};

/// A row as the remote system of record sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Stable id, unique within the collection.
    pub id: RecordId,
    /// Schema-defined attribute map.
    pub payload: Payload,
    /// Opaque revision tag, replaced on every remote write. Used for
    /// concurrent-edit detection.
    pub revision: String,
    /// Last remote modification time.
    pub modified: DateTime<Utc>,
    /// Tombstone marker: the row was deleted remotely. Tombstones flow
    /// through delta pulls so mirrors can drop the row.
    pub deleted: bool,
    /// Optional tenant/base partition key.
    pub scope: Option<String>,
}

/// A single row mutation to apply remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub record_id: RecordId,
    pub operation: Operation,
    /// Full payload to install. `None` for deletes.
    pub payload: Option<Payload>,
    /// The remote revision this change was based on. `None` for inserts of
    /// rows the client has never seen synced.
    pub base_revision: Option<String>,
    /// Optional tenant/base partition key (inserts only).
    pub scope: Option<String>,
}

/// Result of applying a change that reached the remote.
///
/// Transient and permanent failures travel as errors
/// ([`Error::Transient`] / [`Error::Permanent`]), not as outcomes.
///
/// [`Error::Transient`]: keel_common::Error::Transient
/// [`Error::Permanent`]: keel_common::Error::Permanent
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The change landed. Carries the resulting row for inserts/updates,
    /// `None` for deletes.
    Applied(Option<RemoteRecord>),
    /// The remote row diverged from the change's base. Carries the current
    /// remote row, or `None` when the row was deleted remotely.
    Conflict {
        kind: ConflictKind,
        remote: Option<RemoteRecord>,
    },
}

/// Read filter for remote queries. Mirrors the façade's read scoping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    /// Restrict to one tenant/base partition.
    pub scope: Option<String>,
}

impl Filter {
    /// Match everything in the collection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one partition.
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
        }
    }
}

/// Remote system-of-record trait.
///
/// Implementations must make `apply` idempotent: re-applying a change that
/// already landed (a crash-induced retry) reports success rather than
/// duplicating the effect. Conflicts are detected by comparing the change's
/// `base_revision` against the current remote revision.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Backend name (e.g. "memory", "http").
    fn name(&self) -> &str;

    /// Fetch live rows matching the filter.
    ///
    /// # Errors
    /// - `Transient` when the backend is unreachable
    /// - `Permanent` on authorization failure
    async fn fetch(&self, collection: &Collection, filter: &Filter) -> Result<Vec<RemoteRecord>>;

    /// Apply one row mutation.
    ///
    /// # Postconditions
    /// - `Applied` means the effect is durable remotely
    /// - `Conflict` means nothing was changed remotely
    ///
    /// # Errors
    /// - `Transient` on timeout/network failure (nothing may or may not have
    ///   landed; safe to re-apply because apply is idempotent)
    /// - `Permanent` on validation or authorization rejection
    async fn apply(&self, collection: &Collection, change: &ChangeRequest) -> Result<ApplyOutcome>;

    /// Rows (including tombstones) modified since the given instant; all rows
    /// when `None`.
    async fn changed_since(
        &self,
        collection: &Collection,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>>;
}
