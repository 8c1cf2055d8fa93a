//! Reconciliation engine.
//!
//! Drains the pending-change queue against the remote system of record in
//! creation order, records conflicts, then pulls remote deltas into the
//! mirror. One pass runs at a time; starting a pass while one is running is
//! a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use keel_common::{Collection, Payload, Result};
use keel_remote::{ApplyOutcome, ChangeRequest, RemoteBackend, RemoteRecord};
use keel_store::{LocalStore, PendingChange};

use crate::retry::{RetryExecutor, RetryPolicy};

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Retry policy wrapped around individual remote calls.
    pub retry: RetryPolicy,
    /// Failed attempts after which a change is quarantined.
    pub quarantine_after: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            quarantine_after: 5,
        }
    }
}

/// Phase of the running (or idle) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Idle,
    Draining,
    Pulling,
}

/// Counters from one completed pass.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    /// Changes confirmed against the remote.
    pub applied: usize,
    /// Divergences recorded for explicit resolution.
    pub conflicts: usize,
    /// Changes left queued because their collection hit a transient failure.
    pub deferred: usize,
    /// Changes marked terminally failed this pass.
    pub quarantined: usize,
    /// Remote rows mirrored during the pull phase.
    pub pulled: usize,
    /// Wall-clock duration of the pass.
    pub duration: Duration,
}

/// Engine coordinating drain-then-pull reconciliation passes.
pub struct Reconciler<B: RemoteBackend + 'static> {
    store: Arc<LocalStore>,
    backend: Arc<B>,
    retry: RetryExecutor,
    config: ReconcilerConfig,
    /// Pass-level reentrancy lock. Held for the whole pass; `try_lock`
    /// failing means a pass is running and the request is dropped.
    pass_lock: AsyncMutex<()>,
    phase_tx: watch::Sender<PassPhase>,
    stop_requested: AtomicBool,
}

impl<B: RemoteBackend + 'static> Reconciler<B> {
    /// Create a new engine.
    pub fn new(store: Arc<LocalStore>, backend: Arc<B>, config: ReconcilerConfig) -> Self {
        let (phase_tx, _) = watch::channel(PassPhase::Idle);
        Self {
            store,
            backend,
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            pass_lock: AsyncMutex::new(()),
            phase_tx,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Observe the current pass phase.
    pub fn phase(&self) -> watch::Receiver<PassPhase> {
        self.phase_tx.subscribe()
    }

    /// Ask a running pass to wind down after its in-flight remote call.
    ///
    /// The current change finishes (or fails) cleanly; no further step
    /// starts. A stopped pass leaves nothing half-applied.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Run one reconciliation pass.
    ///
    /// Returns `None` when a pass is already running (the request is a
    /// no-op, not queued). Local storage failures abort the pass and
    /// propagate.
    pub async fn run_pass(&self) -> Result<Option<PassSummary>> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("Reconciliation pass already running; request dropped");
            return Ok(None);
        };
        self.stop_requested.store(false, Ordering::SeqCst);

        let start = Instant::now();
        let mut summary = PassSummary::default();
        info!("Starting reconciliation pass");

        let result = self.execute_pass(&mut summary).await;
        self.phase_tx.send_replace(PassPhase::Idle);

        summary.duration = start.elapsed();
        match result {
            Ok(()) => {
                info!(
                    "Pass completed in {:?}: {} applied, {} conflicts, {} deferred, {} quarantined, {} pulled",
                    summary.duration,
                    summary.applied,
                    summary.conflicts,
                    summary.deferred,
                    summary.quarantined,
                    summary.pulled
                );
                Ok(Some(summary))
            }
            Err(err) => Err(err),
        }
    }

    async fn execute_pass(&self, summary: &mut PassSummary) -> Result<()> {
        self.phase_tx.send_replace(PassPhase::Draining);
        for collection in self.store.collections_with_pending()? {
            if self.stopping() {
                info!("Pass stopped before draining {}", collection);
                return Ok(());
            }
            self.drain_collection(&collection, summary).await?;
        }

        self.phase_tx.send_replace(PassPhase::Pulling);
        for collection in self.store.known_collections()? {
            if self.stopping() {
                info!("Pass stopped before pulling {}", collection);
                return Ok(());
            }
            self.pull_collection(&collection, summary).await?;
        }
        Ok(())
    }

    /// Apply a collection's queued changes in creation order.
    ///
    /// A transient failure parks the whole collection for this pass so a
    /// later change never lands before an earlier one. Conflicts and
    /// permanent failures affect only their own record.
    async fn drain_collection(
        &self,
        collection: &Collection,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let changes = self.store.drainable_changes(collection)?;
        let total = changes.len();

        for (index, change) in changes.into_iter().enumerate() {
            if self.stopping() {
                return Ok(());
            }

            let request = self.build_request(collection, &change)?;
            let outcome = self
                .retry
                .execute(|| self.backend.apply(collection, &request))
                .await;

            match outcome {
                Ok(ApplyOutcome::Applied(applied)) => {
                    let (revision, modified) = match &applied {
                        Some(row) => (Some(row.revision.as_str()), row.modified),
                        None => (None, Utc::now()),
                    };
                    self.store.confirm_applied(
                        collection,
                        &change.record_id,
                        change.id,
                        change.seq,
                        revision,
                        modified,
                    )?;
                    summary.applied += 1;
                }
                Ok(ApplyOutcome::Conflict { kind, remote }) => {
                    let (remote_payload, remote_revision) = split_remote(remote);
                    self.store.upsert_conflict(
                        collection,
                        &change.record_id,
                        change.snapshot.as_ref(),
                        remote_payload.as_ref(),
                        remote_revision.as_deref(),
                        kind,
                    )?;
                    summary.conflicts += 1;
                }
                Err(err) if err.is_transient() => {
                    self.store
                        .record_change_failure(change.id, &err.to_string())?;
                    let parked = total - index;
                    summary.deferred += parked;
                    warn!(
                        "Transient failure draining {} ({}); {} changes parked until next pass",
                        collection, err, parked
                    );
                    return Ok(());
                }
                Err(err) if err.is_permanent() => {
                    let retries = self
                        .store
                        .record_change_failure(change.id, &err.to_string())?;
                    warn!(
                        "Permanent failure applying {}/{} (attempt {}): {}",
                        collection, change.record_id, retries, err
                    );
                    if retries >= self.config.quarantine_after
                        && self.store.quarantine_change(change.id, change.seq)?
                    {
                        summary.quarantined += 1;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn build_request(&self, collection: &Collection, change: &PendingChange) -> Result<ChangeRequest> {
        let scope = self
            .store
            .find_by_id(collection, &change.record_id)?
            .and_then(|record| record.scope);
        Ok(ChangeRequest {
            record_id: change.record_id.clone(),
            operation: change.operation,
            payload: change.snapshot.clone(),
            base_revision: change.base_revision.clone(),
            scope,
        })
    }

    /// Mirror remote deltas for one collection.
    ///
    /// Rows with local pending or conflicted state are left untouched; they
    /// either drain later or surface as conflicts. A failed pull skips the
    /// collection without failing the pass.
    async fn pull_collection(
        &self,
        collection: &Collection,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let since = self.store.metadata(collection)?.last_sync_at;
        let deltas = match self
            .retry
            .execute(|| self.backend.changed_since(collection, since))
            .await
        {
            Ok(deltas) => deltas,
            Err(err) if err.is_transient() || err.is_permanent() => {
                warn!("Skipping pull of {}: {}", collection, err);
                self.store.refresh_metadata(collection, None)?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for row in deltas {
            if self.store.is_locally_touched(collection, &row.id)? {
                debug!(
                    "Leaving {}/{} alone during pull: locally touched",
                    collection, row.id
                );
                continue;
            }
            if row.deleted {
                self.store.remove_mirrored(collection, &row.id)?;
            } else {
                self.store.upsert_synced(
                    collection,
                    &row.id,
                    &row.payload,
                    &row.revision,
                    row.modified,
                    row.scope.as_deref(),
                )?;
            }
            summary.pulled += 1;
        }

        self.store.refresh_metadata(collection, Some(Utc::now()))?;
        Ok(())
    }
}

fn split_remote(remote: Option<RemoteRecord>) -> (Option<Payload>, Option<String>) {
    match remote {
        Some(row) => (Some(row.payload), Some(row.revision)),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::{RecordId, Resolution, SyncStatus};
    use keel_remote::MemoryBackend;
    use serde_json::json;

    fn tasks() -> Collection {
        Collection::new("tasks").unwrap()
    }

    fn payload(title: &str) -> Payload {
        Payload::empty(1).with_field("title", json!(title))
    }

    fn make_engine() -> (Arc<LocalStore>, Arc<MemoryBackend>, Reconciler<MemoryBackend>) {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let config = ReconcilerConfig {
            retry: RetryPolicy::new(1)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            quarantine_after: 2,
        };
        let reconciler = Reconciler::new(store.clone(), backend.clone(), config);
        (store, backend, reconciler)
    }

    #[tokio::test]
    async fn test_offline_insert_drains_on_next_pass() {
        let (store, backend, engine) = make_engine();
        let id = store.insert(&tasks(), payload("queued"), None).unwrap();
        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);

        let summary = engine.run_pass().await.unwrap().unwrap();

        assert_eq!(summary.applied, 1);
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
        let remote = backend.get(&tasks(), &id).unwrap();
        assert_eq!(remote.payload.get("title"), Some(&json!("queued")));
        let local = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(store.metadata(&tasks()).unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_coalesced_updates_converge_to_latest() {
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("v0"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("v0"), &seeded.revision, Utc::now(), None)
            .unwrap();

        store.update(&tasks(), &id, &payload("v1")).unwrap();
        store.update(&tasks(), &id, &payload("v2")).unwrap();
        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);

        engine.run_pass().await.unwrap().unwrap();

        let remote = backend.get(&tasks(), &id).unwrap();
        assert_eq!(remote.payload.get("title"), Some(&json!("v2")));
    }

    #[tokio::test]
    async fn test_transient_failure_parks_collection_in_order() {
        let (store, backend, engine) = make_engine();
        let first = store.insert(&tasks(), payload("first"), None).unwrap();
        let second = store.insert(&tasks(), payload("second"), None).unwrap();

        // Exhaust the per-call retries too: nothing may land out of order.
        backend.fail_next(10);
        let summary = engine.run_pass().await.unwrap().unwrap();

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.deferred, 2);
        assert_eq!(backend.live_count(&tasks()), 0);
        let queue = store.pending_changes(&tasks()).unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue[0].retry_count > 0);
        // The second change was never attempted.
        assert_eq!(queue[1].retry_count, 0);

        // Connectivity restored: both drain, oldest first.
        backend.fail_next(0);
        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.applied, 2);
        assert!(backend.get(&tasks(), &first).is_some());
        assert!(backend.get(&tasks(), &second).is_some());
    }

    #[tokio::test]
    async fn test_other_collections_continue_past_failures() {
        let (store, backend, engine) = make_engine();
        let notes = Collection::new("notes").unwrap();

        // The tasks insert permanently fails (schema mismatch); notes drains.
        backend.set_schema(&tasks(), 9);
        store.insert(&tasks(), payload("rejected"), None).unwrap();
        let note_id = store.insert(&notes, payload("fine"), None).unwrap();

        let summary = engine.run_pass().await.unwrap().unwrap();

        assert_eq!(summary.applied, 1);
        assert!(backend.get(&notes, &note_id).is_some());
        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failures_quarantine_after_cap() {
        let (store, backend, engine) = make_engine();
        backend.set_schema(&tasks(), 9);
        store.insert(&tasks(), payload("never valid"), None).unwrap();

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.quarantined, 0);

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.quarantined, 1);

        assert!(store.drainable_changes(&tasks()).unwrap().is_empty());
        let quarantined = store.quarantined_changes(&tasks()).unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].retry_count, 2);

        // Quarantined changes stop consuming passes.
        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.applied + summary.quarantined, 0);
    }

    #[tokio::test]
    async fn test_update_update_conflict_and_local_wins() {
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("base"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("base"), &seeded.revision, Utc::now(), None)
            .unwrap();

        store.update(&tasks(), &id, &payload("ours")).unwrap();
        backend.edit_directly(&tasks(), &id, payload("theirs"));

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.conflicts, 1);

        let conflicts = store.open_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, keel_common::ConflictKind::UpdateUpdate);

        // The conflicted change is no longer drainable.
        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.conflicts, 0);

        store
            .resolve_conflict(conflicts[0].id, Resolution::LocalWins, None)
            .unwrap();
        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.applied, 1);

        let remote = backend.get(&tasks(), &id).unwrap();
        assert_eq!(remote.payload.get("title"), Some(&json!("ours")));
        let local = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_update_delete_conflict_both_resolutions() {
        // local-wins: the record is re-created remotely.
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("base"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("base"), &seeded.revision, Utc::now(), None)
            .unwrap();
        store.update(&tasks(), &id, &payload("ours")).unwrap();
        backend.delete_directly(&tasks(), &id);

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.conflicts, 1);
        let conflict = store.open_conflicts().unwrap().remove(0);
        assert_eq!(conflict.kind, keel_common::ConflictKind::UpdateDelete);
        assert!(conflict.remote_payload.is_none());

        store
            .resolve_conflict(conflict.id, Resolution::LocalWins, None)
            .unwrap();
        engine.run_pass().await.unwrap().unwrap();
        let remote = backend.get(&tasks(), &id).unwrap();
        assert_eq!(remote.payload.get("title"), Some(&json!("ours")));

        // remote-wins: the local row and queue entry disappear.
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("base"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("base"), &seeded.revision, Utc::now(), None)
            .unwrap();
        store.update(&tasks(), &id, &payload("ours")).unwrap();
        backend.delete_directly(&tasks(), &id);

        engine.run_pass().await.unwrap().unwrap();
        let conflict = store.open_conflicts().unwrap().remove(0);
        store
            .resolve_conflict(conflict.id, Resolution::RemoteWins, None)
            .unwrap();

        assert!(store.find_by_id(&tasks(), &id).unwrap().is_none());
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_update_conflict_remote_wins_restores_row() {
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("base"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("base"), &seeded.revision, Utc::now(), None)
            .unwrap();

        // Local delete races a remote edit.
        store.delete(&tasks(), &id).unwrap();
        backend.edit_directly(&tasks(), &id, payload("theirs"));

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.conflicts, 1);
        let conflict = store.open_conflicts().unwrap().remove(0);
        assert_eq!(conflict.kind, keel_common::ConflictKind::DeleteUpdate);

        // Remote wins: the optimistically deleted row comes back.
        store
            .resolve_conflict(conflict.id, Resolution::RemoteWins, None)
            .unwrap();
        let restored = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(restored.payload.get("title"), Some(&json!("theirs")));
        assert_eq!(restored.sync_status, SyncStatus::Synced);
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_mirrors_remote_rows_and_tombstones() {
        let (store, backend, engine) = make_engine();
        let keep = RecordId::generate();
        let gone = RecordId::generate();
        backend.seed(&tasks(), &keep, payload("keep"), None);
        backend.seed(&tasks(), &gone, payload("gone"), None);

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.pulled, 2);
        assert_eq!(store.find_all(&tasks(), None).unwrap().len(), 2);

        backend.delete_directly(&tasks(), &gone);
        engine.run_pass().await.unwrap().unwrap();

        assert!(store.find_by_id(&tasks(), &keep).unwrap().is_some());
        assert!(store.find_by_id(&tasks(), &gone).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_pass_loses_nothing() {
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("base"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("base"), &seeded.revision, Utc::now(), None)
            .unwrap();

        // The network dies before the pass: every change must stay queued
        // and unapplied, with the local edit intact.
        store.update(&tasks(), &id, &payload("local edit")).unwrap();
        backend.set_unreachable(true);
        engine.run_pass().await.unwrap().unwrap();
        backend.set_unreachable(false);

        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);
        let remote = backend.get(&tasks(), &id).unwrap();
        assert_eq!(remote.payload.get("title"), Some(&json!("base")));
        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.payload.get("title"), Some(&json!("local edit")));
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_pull_leaves_conflicted_rows_alone() {
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        let seeded = backend.seed(&tasks(), &id, payload("base"), None);
        store
            .upsert_synced(&tasks(), &id, &payload("base"), &seeded.revision, Utc::now(), None)
            .unwrap();

        store.update(&tasks(), &id, &payload("local edit")).unwrap();
        backend.edit_directly(&tasks(), &id, payload("theirs"));
        engine.run_pass().await.unwrap().unwrap();
        assert_eq!(store.open_conflicts().unwrap().len(), 1);

        // Another remote edit arrives; the pull must not overwrite the
        // conflicted local row.
        backend.edit_directly(&tasks(), &id, payload("theirs again"));
        engine.run_pass().await.unwrap().unwrap();

        let record = store.find_by_id(&tasks(), &id).unwrap().unwrap();
        assert_eq!(record.payload.get("title"), Some(&json!("local edit")));
        assert_eq!(record.sync_status, SyncStatus::Conflicted);
    }

    #[tokio::test]
    async fn test_crash_between_apply_and_confirm_is_idempotent() {
        let (store, backend, engine) = make_engine();
        let id = store.insert(&tasks(), payload("once"), None).unwrap();

        // Simulate a pass that died after the remote apply but before the
        // queue entry was removed.
        let change = store.pending_changes(&tasks()).unwrap().remove(0);
        let scope = None;
        let request = ChangeRequest {
            record_id: change.record_id.clone(),
            operation: change.operation,
            payload: change.snapshot.clone(),
            base_revision: change.base_revision.clone(),
            scope,
        };
        backend.apply(&tasks(), &request).await.unwrap();
        assert_eq!(backend.live_count(&tasks()), 1);
        assert_eq!(store.pending_changes(&tasks()).unwrap().len(), 1);

        // The restarted pass re-applies without duplicating.
        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(backend.live_count(&tasks()), 1);
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
        assert!(backend.get(&tasks(), &id).is_some());
    }

    #[tokio::test]
    async fn test_convergence_after_mixed_offline_batch() {
        let (store, backend, engine) = make_engine();
        let notes = Collection::new("notes").unwrap();

        let a = store.insert(&tasks(), payload("a"), None).unwrap();
        let b = store.insert(&tasks(), payload("b"), None).unwrap();
        store.update(&tasks(), &b, &payload("b2")).unwrap();
        let c = store.insert(&notes, payload("c"), None).unwrap();
        let d = store.insert(&tasks(), payload("d"), None).unwrap();
        store.delete(&tasks(), &d).unwrap();

        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.conflicts, 0);

        // Local and remote agree on every affected record.
        for (collection, id) in [(&tasks(), &a), (&tasks(), &b), (&notes, &c)] {
            let local = store.find_by_id(collection, id).unwrap().unwrap();
            let remote = backend.get(collection, id).unwrap();
            assert_eq!(local.payload, remote.payload);
            assert_eq!(local.sync_status, SyncStatus::Synced);
        }
        assert!(backend.get(&tasks(), &d).is_none());
        assert!(store.pending_changes(&tasks()).unwrap().is_empty());
        assert!(store.pending_changes(&notes).unwrap().is_empty());
        assert!(store.open_conflicts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_start_is_a_noop() {
        let (_store, _backend, engine) = make_engine();
        let _held = engine.pass_lock.try_lock().unwrap();

        let result = engine.run_pass().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stop_request_parks_remaining_work() {
        let (store, backend, engine) = make_engine();
        store.insert(&tasks(), payload("unsent"), None).unwrap();

        engine.request_stop();
        // A stop request set before the pass is cleared at pass start.
        let summary = engine.run_pass().await.unwrap().unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(backend.live_count(&tasks()), 1);
    }

    #[tokio::test]
    async fn test_pass_updates_sync_metadata() {
        let (store, backend, engine) = make_engine();
        let id = RecordId::generate();
        backend.seed(&tasks(), &id, payload("seen"), None);

        engine.run_pass().await.unwrap().unwrap();

        let metadata = store.metadata(&tasks()).unwrap();
        assert!(metadata.last_sync_at.is_some());
        assert_eq!(metadata.pending_count, 0);
    }
}
