//! Connectivity-aware data access.
//!
//! One read/write API per collection, agnostic to connectivity. Reads prefer
//! the remote and fall back to the local mirror; writes land locally first
//! and push opportunistically. Callers never wait on the network for a write
//! to take local effect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use keel_common::{Collection, Error, Payload, RecordId, Result, SyncStatus};
use keel_remote::{ApplyOutcome, ChangeRequest, Filter, RemoteBackend, RemoteRecord};
use keel_store::{LocalRecord, LocalStore, PendingChange};

use crate::connectivity::Connectivity;

/// Where a read's rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Straight from the remote.
    Remote,
    /// Local mirror, read while offline.
    Local,
    /// Local mirror served because the remote read failed or looked wrong;
    /// stale but available.
    Stale,
}

/// Result of a façade read.
#[derive(Debug)]
pub struct ReadResult {
    pub records: Vec<LocalRecord>,
    pub freshness: Freshness,
}

/// Per-collection read/write API over the local store and a remote backend.
pub struct DataAccess<B: RemoteBackend + 'static> {
    store: Arc<LocalStore>,
    backend: Arc<B>,
    connectivity: Arc<Connectivity>,
    /// Serializes writers within one collection; collections are independent.
    write_locks: StdMutex<HashMap<Collection, Arc<AsyncMutex<()>>>>,
    /// Errors from detached cache refreshes end up here, never in a read's
    /// call stack.
    refresh_error_tx: mpsc::UnboundedSender<Error>,
    refresh_error_rx: StdMutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl<B: RemoteBackend + 'static> DataAccess<B> {
    /// Create a new façade.
    pub fn new(store: Arc<LocalStore>, backend: Arc<B>, connectivity: Arc<Connectivity>) -> Self {
        let (refresh_error_tx, refresh_error_rx) = mpsc::unbounded_channel();
        Self {
            store,
            backend,
            connectivity,
            write_locks: StdMutex::new(HashMap::new()),
            refresh_error_tx,
            refresh_error_rx: StdMutex::new(Some(refresh_error_rx)),
        }
    }

    /// Take the receiver for background refresh errors. Yields `None` after
    /// the first call.
    pub fn take_refresh_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.refresh_error_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Read a collection through the effective connectivity state.
    ///
    /// Online, the remote answers and the mirror refreshes in the background;
    /// a failed or suspiciously empty remote response degrades to the last
    /// known-good local rows instead of wiping them.
    pub async fn read(&self, collection: &Collection, filter: &Filter) -> Result<ReadResult> {
        if !self.connectivity.effective_online() {
            let records = self.store.find_all(collection, filter.scope.as_deref())?;
            return Ok(ReadResult {
                records,
                freshness: Freshness::Local,
            });
        }

        match self.backend.fetch(collection, filter).await {
            Ok(rows) => {
                let cached = self.store.find_all(collection, filter.scope.as_deref())?;
                if rows.is_empty() && !cached.is_empty() {
                    warn!(
                        "Remote returned no {} rows while {} are mirrored; serving mirror",
                        collection,
                        cached.len()
                    );
                    return Ok(ReadResult {
                        records: cached,
                        freshness: Freshness::Stale,
                    });
                }

                self.spawn_cache_refresh(collection.clone(), rows.clone());
                let records = rows
                    .into_iter()
                    .map(|row| remote_to_local(collection, row))
                    .collect();
                Ok(ReadResult {
                    records,
                    freshness: Freshness::Remote,
                })
            }
            Err(err) if err.is_transient() || err.is_permanent() => {
                warn!(
                    "Remote read of {} failed ({}); serving mirror",
                    collection, err
                );
                let records = self.store.find_all(collection, filter.scope.as_deref())?;
                Ok(ReadResult {
                    records,
                    freshness: Freshness::Stale,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Read one record, local mirror only.
    pub fn get(&self, collection: &Collection, id: &RecordId) -> Result<Option<LocalRecord>> {
        self.store.find_by_id(collection, id)
    }

    /// Create a record: mirror it as pending, then push if online.
    ///
    /// Returns the assigned id. Transient push failures stay silent (the
    /// queue covers them); permanent rejections surface while the change
    /// stays queued for visibility.
    pub async fn create(
        &self,
        collection: &Collection,
        payload: Payload,
        scope: Option<&str>,
    ) -> Result<RecordId> {
        let lock = self.write_lock(collection)?;
        let _guard = lock.lock().await;

        let id = self.store.insert(collection, payload, scope)?;
        self.push_opportunistically(collection, &id).await?;
        Ok(id)
    }

    /// Merge a partial payload into a record, then push if online.
    pub async fn update(
        &self,
        collection: &Collection,
        id: &RecordId,
        partial: &Payload,
    ) -> Result<()> {
        let lock = self.write_lock(collection)?;
        let _guard = lock.lock().await;

        self.store.update(collection, id, partial)?;
        self.push_opportunistically(collection, id).await
    }

    /// Delete a record locally (immediate) and queue/push the remote delete.
    pub async fn delete(&self, collection: &Collection, id: &RecordId) -> Result<()> {
        let lock = self.write_lock(collection)?;
        let _guard = lock.lock().await;

        self.store.delete(collection, id)?;
        self.push_opportunistically(collection, id).await
    }

    fn write_lock(&self, collection: &Collection) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|_| Error::Storage("write lock table poisoned".to_string()))?;
        Ok(locks
            .entry(collection.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// Try to apply the queued change for a record right now.
    ///
    /// No-op while offline or when the change already drained. Transient
    /// failures leave the change queued for the reconciliation engine.
    async fn push_opportunistically(&self, collection: &Collection, id: &RecordId) -> Result<()> {
        if !self.connectivity.effective_online() {
            return Ok(());
        }
        let Some(change) = self.store.pending_change_for(collection, id)? else {
            return Ok(());
        };

        let scope = self
            .store
            .find_by_id(collection, id)?
            .and_then(|record| record.scope);
        let request = change_to_request(&change, scope);

        match self.backend.apply(collection, &request).await {
            Ok(ApplyOutcome::Applied(applied)) => {
                let (revision, modified) = match &applied {
                    Some(row) => (Some(row.revision.as_str()), row.modified),
                    None => (None, Utc::now()),
                };
                self.store
                    .confirm_applied(collection, id, change.id, change.seq, revision, modified)?;
                debug!("Pushed {}/{} inline", collection, id);
                Ok(())
            }
            Ok(ApplyOutcome::Conflict { kind, remote }) => {
                let (remote_payload, remote_revision) = split_remote(remote);
                self.store.upsert_conflict(
                    collection,
                    id,
                    change.snapshot.as_ref(),
                    remote_payload.as_ref(),
                    remote_revision.as_deref(),
                    kind,
                )?;
                Ok(())
            }
            Err(err) if err.is_transient() => {
                debug!(
                    "Inline push of {}/{} deferred to next pass: {}",
                    collection, id, err
                );
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                self.store.record_change_failure(change.id, &err.to_string())?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn spawn_cache_refresh(&self, collection: Collection, rows: Vec<RemoteRecord>) {
        if rows.is_empty() {
            return;
        }
        let store = self.store.clone();
        let error_tx = self.refresh_error_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = refresh_mirror(&store, &collection, rows) {
                warn!("Background refresh of {} failed: {}", collection, err);
                let _ = error_tx.send(err);
            }
        });
    }
}

/// Upsert freshly fetched rows into the mirror, leaving locally touched
/// records alone.
fn refresh_mirror(
    store: &LocalStore,
    collection: &Collection,
    rows: Vec<RemoteRecord>,
) -> Result<()> {
    for row in rows {
        if store.is_locally_touched(collection, &row.id)? {
            continue;
        }
        store.upsert_synced(
            collection,
            &row.id,
            &row.payload,
            &row.revision,
            row.modified,
            row.scope.as_deref(),
        )?;
    }
    Ok(())
}

fn change_to_request(change: &PendingChange, scope: Option<String>) -> ChangeRequest {
    ChangeRequest {
        record_id: change.record_id.clone(),
        operation: change.operation,
        payload: change.snapshot.clone(),
        base_revision: change.base_revision.clone(),
        scope,
    }
}

fn split_remote(remote: Option<RemoteRecord>) -> (Option<Payload>, Option<String>) {
    match remote {
        Some(row) => (Some(row.payload), Some(row.revision)),
        None => (None, None),
    }
}

fn remote_to_local(collection: &Collection, row: RemoteRecord) -> LocalRecord {
    LocalRecord {
        id: row.id,
        collection: collection.clone(),
        payload: row.payload,
        sync_status: SyncStatus::Synced,
        last_modified: row.modified,
        scope: row.scope,
        remote_revision: Some(row.revision),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_remote::MemoryBackend;
    use serde_json::json;
    use std::time::Duration;

    fn tasks() -> Collection {
        Collection::new("tasks").unwrap()
    }

    fn payload(title: &str) -> Payload {
        Payload::empty(1).with_field("title", json!(title))
    }

    fn facade() -> (Arc<LocalStore>, Arc<MemoryBackend>, DataAccess<MemoryBackend>) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let connectivity = Arc::new(Connectivity::new(store.clone()).unwrap());
        let access = DataAccess::new(store.clone(), backend.clone(), connectivity);
        (store, backend, access)
    }

    fn facade_offline() -> (Arc<LocalStore>, Arc<MemoryBackend>, DataAccess<MemoryBackend>) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let connectivity = Arc::new(Connectivity::new(store.clone()).unwrap());
        connectivity.set_network_reachable(false);
        let access = DataAccess::new(store.clone(), backend.clone(), connectivity);
        (store, backend, access)
    }

    #[tokio::test]
    async fn test_offline_create_queues_without_touching_remote() {
        let (store, backend, access) = facade_offline();

        let id = access.create(&tasks(), payload("offline"), None).await.unwrap();

        assert_eq!(backend.live_count(&tasks()), 0);
        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);
        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_online_create_pushes_and_confirms() {
        let (store, backend, access) = facade();

        let id = access.create(&tasks(), payload("online"), None).await.unwrap();

        assert_eq!(backend.live_count(&tasks()), 1);
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(record.remote_revision.is_some());
    }

    #[tokio::test]
    async fn test_transient_push_failure_is_silent() {
        let (store, backend, access) = facade();
        backend.fail_next(1);

        let id = access.create(&tasks(), payload("later"), None).await.unwrap();

        assert_eq!(backend.live_count(&tasks()), 0);
        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);
        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_permanent_push_failure_surfaces_and_stays_queued() {
        let (store, backend, access) = facade();
        backend.set_schema(&tasks(), 2);

        let err = access
            .create(&tasks(), payload("wrong shape"), None)
            .await
            .unwrap_err();
        assert!(err.is_permanent());

        let queue = store.pending_changes(&tasks()).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].retry_count, 1);
        assert!(queue[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_offline_read_serves_mirror() {
        let (store, _backend, access) = facade_offline();
        store.insert(&tasks(), payload("cached"), None).unwrap();

        let result = access.read(&tasks(), &Filter::all()).await.unwrap();
        assert_eq!(result.freshness, Freshness::Local);
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test]
    async fn test_online_read_returns_remote_and_refreshes_mirror() {
        let (store, backend, access) = facade();
        let id = RecordId::generate();
        backend.seed(&tasks(), &id, payload("from remote"), None);

        let result = access.read(&tasks(), &Filter::all()).await.unwrap();
        assert_eq!(result.freshness, Freshness::Remote);
        assert_eq!(result.records.len(), 1);

        // The detached refresh lands shortly after the read returns.
        let mut mirrored = None;
        for _ in 0..50 {
            mirrored = store.find_by_id(&tasks(), &id).unwrap();
            if mirrored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mirrored = mirrored.expect("mirror refresh never landed");
        assert_eq!(mirrored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_empty_remote_response_keeps_known_good_rows() {
        let (store, _backend, access) = facade();
        store.insert(&tasks(), payload("precious"), None).unwrap();

        // Remote is reachable but has nothing for this collection.
        let result = access.read(&tasks(), &Filter::all()).await.unwrap();
        assert_eq!(result.freshness, Freshness::Stale);
        assert_eq!(result.records.len(), 1);
        assert_eq!(store.find_all(&tasks(), None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_remote_read_falls_back_to_mirror() {
        let (store, backend, access) = facade();
        store.insert(&tasks(), payload("survivor"), None).unwrap();
        backend.set_unreachable(true);

        let result = access.read(&tasks(), &Filter::all()).await.unwrap();
        assert_eq!(result.freshness, Freshness::Stale);
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_skips_locally_touched_rows() {
        let (store, backend, access) = facade();
        let id = RecordId::generate();
        backend.seed(&tasks(), &id, payload("remote v1"), None);

        // Mirror the row, then edit it locally while a remote copy exists.
        store
            .upsert_synced(&tasks(), &id, &payload("remote v1"), "rev-1", Utc::now(), None)
            .unwrap();
        store.update(&tasks(), &id, &payload("local edit")).unwrap();

        let _ = access.read(&tasks(), &Filter::all()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.payload.get("title"), Some(&json!("local edit")));
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_online_delete_confirms_remote_tombstone() {
        let (store, backend, access) = facade();
        let id = access.create(&tasks(), payload("doomed"), None).await.unwrap();
        assert_eq!(backend.live_count(&tasks()), 1);

        access.delete(&tasks(), &id).await.unwrap();

        assert_eq!(backend.live_count(&tasks()), 0);
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
        assert!(store.find_by_id(&tasks(), &id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inline_push_conflict_is_recorded() {
        let (store, backend, access) = facade();
        let id = access.create(&tasks(), payload("v1"), None).await.unwrap();

        // Another actor edits the row remotely.
        backend.edit_directly(&tasks(), &id, payload("theirs"));

        access
            .update(&tasks(), &id, &payload("ours"))
            .await
            .unwrap();

        let conflicts = store.open_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Conflicted);
    }
}
