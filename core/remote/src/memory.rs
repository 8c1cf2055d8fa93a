//! In-memory remote backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use keel_common::{Collection, ConflictKind, Error, Operation, Payload, RecordId, Result};

use crate::backend::{ApplyOutcome, ChangeRequest, Filter, RemoteBackend, RemoteRecord};

#[derive(Debug, Clone)]
struct StoredRow {
    payload: Payload,
    revision: String,
    modified: DateTime<Utc>,
    deleted: bool,
    scope: Option<String>,
}

impl StoredRow {
    fn to_record(&self, id: &RecordId) -> RemoteRecord {
        RemoteRecord {
            id: id.clone(),
            payload: self.payload.clone(),
            revision: self.revision.clone(),
            modified: self.modified,
            deleted: self.deleted,
            scope: self.scope.clone(),
        }
    }
}

/// In-memory remote backend.
///
/// Useful for tests and development. Implements the same conflict and
/// idempotence semantics a production backend must provide, plus failure
/// injection so unreachable-network behavior can be exercised.
pub struct MemoryBackend {
    collections: Arc<RwLock<HashMap<String, HashMap<String, StoredRow>>>>,
    /// Expected payload schema version per collection; unlisted collections
    /// accept any version.
    schemas: Arc<RwLock<HashMap<String, u32>>>,
    unreachable: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            schemas: Arc::new(RwLock::new(HashMap::new())),
            unreachable: Arc::new(AtomicBool::new(false)),
            fail_next: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Simulate losing (or regaining) the network. While unreachable every
    /// call fails with a transient error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient error, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Require payloads of a collection to carry this schema version;
    /// mismatches are rejected as permanent failures.
    pub fn set_schema(&self, collection: &Collection, version: u32) {
        self.schemas
            .write()
            .unwrap()
            .insert(collection.as_str().to_string(), version);
    }

    /// Seed a row directly, bypassing the apply path (acts as another actor
    /// writing to the system of record). Returns the stored row.
    pub fn seed(
        &self,
        collection: &Collection,
        id: &RecordId,
        payload: Payload,
        scope: Option<&str>,
    ) -> RemoteRecord {
        let row = StoredRow {
            payload,
            revision: Uuid::new_v4().to_string(),
            modified: Utc::now(),
            deleted: false,
            scope: scope.map(String::from),
        };
        let record = row.to_record(id);
        self.collections
            .write()
            .unwrap()
            .entry(collection.as_str().to_string())
            .or_default()
            .insert(id.as_str().to_string(), row);
        record
    }

    /// Overwrite a row's payload directly (another actor's concurrent edit).
    pub fn edit_directly(&self, collection: &Collection, id: &RecordId, payload: Payload) {
        let mut collections = self.collections.write().unwrap();
        if let Some(row) = collections
            .get_mut(collection.as_str())
            .and_then(|rows| rows.get_mut(id.as_str()))
        {
            row.payload = payload;
            row.revision = Uuid::new_v4().to_string();
            row.modified = Utc::now();
            row.deleted = false;
        }
    }

    /// Tombstone a row directly (another actor's concurrent delete).
    pub fn delete_directly(&self, collection: &Collection, id: &RecordId) {
        let mut collections = self.collections.write().unwrap();
        if let Some(row) = collections
            .get_mut(collection.as_str())
            .and_then(|rows| rows.get_mut(id.as_str()))
        {
            row.deleted = true;
            row.revision = Uuid::new_v4().to_string();
            row.modified = Utc::now();
        }
    }

    /// Current live (non-tombstoned) row for a record, if any.
    pub fn get(&self, collection: &Collection, id: &RecordId) -> Option<RemoteRecord> {
        self.collections
            .read()
            .unwrap()
            .get(collection.as_str())
            .and_then(|rows| rows.get(id.as_str()))
            .filter(|row| !row.deleted)
            .map(|row| row.to_record(id))
    }

    /// Number of live rows in a collection.
    pub fn live_count(&self, collection: &Collection) -> usize {
        self.collections
            .read()
            .unwrap()
            .get(collection.as_str())
            .map(|rows| rows.values().filter(|r| !r.deleted).count())
            .unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Transient("backend unreachable".to_string()));
        }
        loop {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(());
            }
            if self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(Error::Transient("injected transient failure".to_string()));
            }
        }
    }

    fn check_schema(&self, collection: &Collection, payload: Option<&Payload>) -> Result<()> {
        let Some(payload) = payload else {
            return Ok(());
        };
        if let Some(expected) = self.schemas.read().unwrap().get(collection.as_str()) {
            if payload.schema != *expected {
                return Err(Error::Permanent(format!(
                    "schema version {} rejected for {} (expected {})",
                    payload.schema, collection, expected
                )));
            }
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, collection: &Collection, filter: &Filter) -> Result<Vec<RemoteRecord>> {
        self.check_reachable()?;
        let collections = self.collections.read().unwrap();
        let Some(rows) = collections.get(collection.as_str()) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<RemoteRecord> = rows
            .iter()
            .filter(|(_, row)| !row.deleted)
            .filter(|(_, row)| match &filter.scope {
                Some(scope) => row.scope.as_deref() == Some(scope.as_str()),
                None => true,
            })
            .map(|(id, row)| {
                RecordId::new(id.clone()).map(|id| row.to_record(&id))
            })
            .collect::<Result<_>>()?;
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(out)
    }

    async fn apply(&self, collection: &Collection, change: &ChangeRequest) -> Result<ApplyOutcome> {
        self.check_reachable()?;
        self.check_schema(collection, change.payload.as_ref())?;

        let mut collections = self.collections.write().unwrap();
        let rows = collections
            .entry(collection.as_str().to_string())
            .or_default();
        let key = change.record_id.as_str().to_string();
        let current = rows.get(&key);

        match change.operation {
            Operation::Insert => {
                let payload = change.payload.clone().ok_or_else(|| {
                    Error::Permanent("insert without a payload".to_string())
                })?;
                match current {
                    None => {}
                    Some(row) if row.deleted => {}
                    // Crash-induced retry of an insert that already landed.
                    Some(row) if row.payload == payload => {
                        return Ok(ApplyOutcome::Applied(Some(row.to_record(&change.record_id))));
                    }
                    Some(row) => {
                        return Ok(ApplyOutcome::Conflict {
                            kind: ConflictKind::UpdateUpdate,
                            remote: Some(row.to_record(&change.record_id)),
                        });
                    }
                }
                let row = StoredRow {
                    payload,
                    revision: Uuid::new_v4().to_string(),
                    modified: Utc::now(),
                    deleted: false,
                    scope: change.scope.clone(),
                };
                let record = row.to_record(&change.record_id);
                rows.insert(key, row);
                debug!("Applied insert of {}/{}", collection, change.record_id);
                Ok(ApplyOutcome::Applied(Some(record)))
            }
            Operation::Update => {
                let payload = change.payload.clone().ok_or_else(|| {
                    Error::Permanent("update without a payload".to_string())
                })?;
                match current {
                    None => Ok(ApplyOutcome::Conflict {
                        kind: ConflictKind::UpdateDelete,
                        remote: None,
                    }),
                    Some(row) if row.deleted => Ok(ApplyOutcome::Conflict {
                        kind: ConflictKind::UpdateDelete,
                        remote: None,
                    }),
                    Some(row) => {
                        let base_matches =
                            change.base_revision.as_deref() == Some(row.revision.as_str());
                        // Re-applying an update that already landed succeeds.
                        if row.payload == payload {
                            return Ok(ApplyOutcome::Applied(Some(
                                row.to_record(&change.record_id),
                            )));
                        }
                        if !base_matches {
                            return Ok(ApplyOutcome::Conflict {
                                kind: ConflictKind::UpdateUpdate,
                                remote: Some(row.to_record(&change.record_id)),
                            });
                        }
                        let row = StoredRow {
                            payload,
                            revision: Uuid::new_v4().to_string(),
                            modified: Utc::now(),
                            deleted: false,
                            scope: row.scope.clone(),
                        };
                        let record = row.to_record(&change.record_id);
                        rows.insert(key, row);
                        debug!("Applied update of {}/{}", collection, change.record_id);
                        Ok(ApplyOutcome::Applied(Some(record)))
                    }
                }
            }
            Operation::Delete => {
                match current {
                    // Already gone: deleting is idempotent.
                    None => Ok(ApplyOutcome::Applied(None)),
                    Some(row) if row.deleted => Ok(ApplyOutcome::Applied(None)),
                    Some(row) => {
                        let base_matches =
                            change.base_revision.as_deref() == Some(row.revision.as_str());
                        if !base_matches {
                            return Ok(ApplyOutcome::Conflict {
                                kind: ConflictKind::DeleteUpdate,
                                remote: Some(row.to_record(&change.record_id)),
                            });
                        }
                        let tombstone = StoredRow {
                            payload: row.payload.clone(),
                            revision: Uuid::new_v4().to_string(),
                            modified: Utc::now(),
                            deleted: true,
                            scope: row.scope.clone(),
                        };
                        rows.insert(key, tombstone);
                        debug!("Applied delete of {}/{}", collection, change.record_id);
                        Ok(ApplyOutcome::Applied(None))
                    }
                }
            }
        }
    }

    async fn changed_since(
        &self,
        collection: &Collection,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>> {
        self.check_reachable()?;
        let collections = self.collections.read().unwrap();
        let Some(rows) = collections.get(collection.as_str()) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<RemoteRecord> = rows
            .iter()
            .filter(|(_, row)| match since {
                Some(since) => row.modified > since,
                None => true,
            })
            .map(|(id, row)| RecordId::new(id.clone()).map(|id| row.to_record(&id)))
            .collect::<Result<_>>()?;
        out.sort_by(|a, b| a.modified.cmp(&b.modified));
        Ok(out)
    }
}
