//! Row types stored by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_common::{Collection, ConflictKind, Operation, Payload, RecordId, Resolution, SyncStatus};

/// A mirrored row of a remote entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Stable id, unique within the collection.
    pub id: RecordId,
    /// Owning collection.
    pub collection: Collection,
    /// Schema-defined attribute map.
    pub payload: Payload,
    /// Current sync status.
    pub sync_status: SyncStatus,
    /// Last local modification time.
    pub last_modified: DateTime<Utc>,
    /// Optional tenant/base partition key.
    pub scope: Option<String>,
    /// Last revision observed from the remote, if the row has ever synced.
    /// Seeds the base revision of queued changes.
    pub remote_revision: Option<String>,
}

/// A queued local mutation awaiting remote confirmation.
///
/// At most one effective change exists per `(collection, record_id)`;
/// consecutive local writes coalesce into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    /// Monotonic queue sequence number (creation order).
    pub id: i64,
    /// Bumped every time a later local write coalesces into this entry.
    /// Confirmation of a remote apply is conditional on it, so a write that
    /// lands mid-flight is never silently confirmed away.
    pub seq: i64,
    pub collection: Collection,
    pub record_id: RecordId,
    pub operation: Operation,
    /// Full payload to apply remotely. `None` for deletes.
    pub snapshot: Option<Payload>,
    /// Remote revision the change was based on, for concurrent-edit detection.
    pub base_revision: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Failed sync attempts so far.
    pub retry_count: u32,
    /// Message from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Terminally failed (quarantined); skipped by drains, kept for operator
    /// visibility until vacuumed.
    pub failed: bool,
}

/// Per-collection sync bookkeeping. Written only by the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub collection: Collection,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: u32,
}

/// A recorded divergence between local and remote state for one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub collection: Collection,
    pub record_id: RecordId,
    /// Local side at detection time. `None` when the local row was deleted.
    pub local_payload: Option<Payload>,
    /// Remote side at detection time. `None` when the remote row was deleted.
    pub remote_payload: Option<Payload>,
    /// Remote revision at detection time, used to base re-enqueued changes.
    pub remote_revision: Option<String>,
    pub kind: ConflictKind,
    pub resolution: Resolution,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    /// Whether this conflict still awaits resolution.
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
