//! SQLite-backed local store.
//!
//! Persists mirrored records, the pending-change queue, sync metadata,
//! conflicts, and settings in one database file. Mutations that touch a
//! record and its queue entry run in a single transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use keel_common::{
    Collection, ConflictKind, Error, Operation, Payload, RecordId, Resolution, Result, SyncStatus,
};

use crate::model::{Conflict, LocalRecord, PendingChange, SyncMetadata};

/// Persisted setting key: user "prefer offline" override.
pub const SETTING_FORCE_OFFLINE: &str = "force_offline";
/// Persisted setting key: scheduler enable/disable toggle.
pub const SETTING_SYNC_ENABLED: &str = "sync_enabled";
/// Persisted setting key: scheduler interval in seconds.
pub const SETTING_SYNC_INTERVAL_SECS: &str = "sync_interval_secs";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    scope TEXT,
    remote_revision TEXT,
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_records_scope ON records(collection, scope);

CREATE TABLE IF NOT EXISTS pending_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    snapshot TEXT,
    base_revision TEXT,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    failed INTEGER NOT NULL DEFAULT 0,
    seq INTEGER NOT NULL DEFAULT 0,
    UNIQUE (collection, record_id)
);

CREATE TABLE IF NOT EXISTS sync_metadata (
    collection TEXT PRIMARY KEY,
    last_sync_at TEXT,
    pending_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    record_id TEXT NOT NULL,
    local_payload TEXT,
    remote_payload TEXT,
    remote_revision TEXT,
    kind TEXT NOT NULL,
    resolution TEXT NOT NULL DEFAULT 'unresolved',
    detected_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_open
    ON conflicts(collection, record_id) WHERE resolved_at IS NULL;

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("bad timestamp {s}: {e}")))
}

fn opt_payload(json: Option<String>) -> Result<Option<Payload>> {
    json.map(|j| Payload::from_json(&j)).transpose()
}

/// Local store manager over a single SQLite connection.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Create or open the store database.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        info!("Local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("store connection mutex poisoned".to_string()))
    }

    // ---- record operations ----

    /// Insert a locally created record, assigning a fresh id.
    ///
    /// The row is stored as `pending` and an Insert is queued for the
    /// reconciliation engine.
    pub fn insert(
        &self,
        collection: &Collection,
        payload: Payload,
        scope: Option<&str>,
    ) -> Result<RecordId> {
        let id = RecordId::generate();
        self.insert_with_id(collection, &id, payload, scope)?;
        Ok(id)
    }

    /// Insert a locally created record under a caller-provided id.
    pub fn insert_with_id(
        &self,
        collection: &Collection,
        id: &RecordId,
        payload: Payload,
        scope: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        if exists.is_some() {
            return Err(Error::InvalidInput(format!(
                "Record already exists: {collection}/{id}"
            )));
        }

        let now = Utc::now();
        tx.execute(
            r#"
            INSERT INTO records (collection, id, payload, sync_status, last_modified, scope)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
            "#,
            params![
                collection.as_str(),
                id.as_str(),
                payload.to_json()?,
                ts(now),
                scope,
            ],
        )
        .map_err(sql_err)?;

        enqueue_coalesced(&tx, collection, id, Operation::Insert, Some(&payload), None)?;
        tx.commit().map_err(sql_err)?;
        debug!("Inserted {}/{}", collection, id);
        Ok(())
    }

    /// Merge `partial` into a stored record's payload.
    ///
    /// Re-stamps the row, marks it `pending`, and coalesces the queued change.
    pub fn update(
        &self,
        collection: &Collection,
        id: &RecordId,
        partial: &Payload,
    ) -> Result<Payload> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT payload, remote_revision FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)?;
        let (stored, remote_revision) = row.ok_or_else(|| {
            Error::NotFound(format!("Record not found: {collection}/{id}"))
        })?;

        let mut merged = Payload::from_json(&stored)?;
        merged.merge(partial);

        // A record with an open conflict stays conflicted until resolved.
        tx.execute(
            r#"
            UPDATE records SET payload = ?3,
                sync_status = CASE sync_status WHEN 'conflicted' THEN 'conflicted' ELSE 'pending' END,
                last_modified = ?4
            WHERE collection = ?1 AND id = ?2
            "#,
            params![collection.as_str(), id.as_str(), merged.to_json()?, ts(Utc::now())],
        )
        .map_err(sql_err)?;

        enqueue_coalesced(
            &tx,
            collection,
            id,
            Operation::Update,
            Some(&merged),
            remote_revision.as_deref(),
        )?;
        tx.commit().map_err(sql_err)?;
        debug!("Updated {}/{}", collection, id);
        Ok(merged)
    }

    /// Remove a record locally and queue the delete.
    ///
    /// The row disappears immediately; the remote delete is confirmed later
    /// by the reconciliation engine. An unsynced insert cancels outright.
    pub fn delete(&self, collection: &Collection, id: &RecordId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let remote_revision: Option<Option<String>> = tx
            .query_row(
                "SELECT remote_revision FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        let remote_revision = remote_revision.ok_or_else(|| {
            Error::NotFound(format!("Record not found: {collection}/{id}"))
        })?;

        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(sql_err)?;

        enqueue_coalesced(
            &tx,
            collection,
            id,
            Operation::Delete,
            None,
            remote_revision.as_deref(),
        )?;
        tx.commit().map_err(sql_err)?;
        debug!("Deleted {}/{}", collection, id);
        Ok(())
    }

    /// Fetch all records of a collection, optionally filtered by scope.
    ///
    /// An empty collection yields an empty list, not an error.
    pub fn find_all(&self, collection: &Collection, scope: Option<&str>) -> Result<Vec<LocalRecord>> {
        let conn = self.lock()?;
        let (sql, bind_scope) = match scope {
            Some(_) => (
                "SELECT id, payload, sync_status, last_modified, scope, remote_revision
                 FROM records WHERE collection = ?1 AND scope = ?2 ORDER BY id",
                true,
            ),
            None => (
                "SELECT id, payload, sync_status, last_modified, scope, remote_revision
                 FROM records WHERE collection = ?1 ORDER BY id",
                false,
            ),
        };
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;

        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RawRecord> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        };
        let rows: Vec<RawRecord> = if bind_scope {
            stmt.query_map(params![collection.as_str(), scope], map)
                .map_err(sql_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(sql_err)?
        } else {
            stmt.query_map(params![collection.as_str()], map)
                .map_err(sql_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(sql_err)?
        };

        rows.into_iter()
            .map(|raw| raw_to_record(collection, raw))
            .collect()
    }

    /// Fetch a single record by id.
    pub fn find_by_id(&self, collection: &Collection, id: &RecordId) -> Result<Option<LocalRecord>> {
        let conn = self.lock()?;
        let raw: Option<RawRecord> = conn
            .query_row(
                "SELECT id, payload, sync_status, last_modified, scope, remote_revision
                 FROM records WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(|raw| raw_to_record(collection, raw)).transpose()
    }

    /// Mirror a remote row as `synced`, preserving any existing scope.
    ///
    /// Never touches the queue; callers must check [`is_locally_touched`]
    /// first when applying pulled deltas.
    ///
    /// [`is_locally_touched`]: LocalStore::is_locally_touched
    pub fn upsert_synced(
        &self,
        collection: &Collection,
        id: &RecordId,
        payload: &Payload,
        revision: &str,
        modified: DateTime<Utc>,
        scope: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO records (collection, id, payload, sync_status, last_modified, scope, remote_revision)
            VALUES (?1, ?2, ?3, 'synced', ?4, ?5, ?6)
            ON CONFLICT (collection, id) DO UPDATE SET
                payload = excluded.payload,
                sync_status = 'synced',
                last_modified = excluded.last_modified,
                scope = COALESCE(excluded.scope, records.scope),
                remote_revision = excluded.remote_revision
            "#,
            params![
                collection.as_str(),
                id.as_str(),
                payload.to_json()?,
                ts(modified),
                scope,
                revision,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Drop a mirrored row without queueing anything (remote tombstone).
    pub fn remove_mirrored(&self, collection: &Collection, id: &RecordId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Whether a record has a queued change or an open conflict.
    ///
    /// Pulled remote deltas must leave such rows untouched.
    pub fn is_locally_touched(&self, collection: &Collection, id: &RecordId) -> Result<bool> {
        let conn = self.lock()?;
        let touched: Option<i64> = conn
            .query_row(
                r#"
                SELECT 1 WHERE EXISTS (
                    SELECT 1 FROM pending_changes
                    WHERE collection = ?1 AND record_id = ?2
                ) OR EXISTS (
                    SELECT 1 FROM conflicts
                    WHERE collection = ?1 AND record_id = ?2 AND resolved_at IS NULL
                )
                "#,
                params![collection.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(touched.is_some())
    }

    // ---- pending-change queue ----

    /// All queued changes for a collection, creation order, including
    /// quarantined ones.
    pub fn pending_changes(&self, collection: &Collection) -> Result<Vec<PendingChange>> {
        self.query_changes(
            "SELECT id, seq, record_id, operation, snapshot, base_revision, created_at,
                    retry_count, last_error, failed
             FROM pending_changes WHERE collection = ?1 ORDER BY id",
            collection,
            &[&collection.as_str() as &dyn rusqlite::ToSql],
        )
    }

    /// Queued changes a reconciliation pass should attempt: not quarantined
    /// and not referenced by an open conflict, in creation order.
    pub fn drainable_changes(&self, collection: &Collection) -> Result<Vec<PendingChange>> {
        self.query_changes(
            r#"
            SELECT p.id, p.seq, p.record_id, p.operation, p.snapshot, p.base_revision,
                   p.created_at, p.retry_count, p.last_error, p.failed
            FROM pending_changes p
            LEFT JOIN conflicts c
                ON c.collection = p.collection AND c.record_id = p.record_id
                AND c.resolved_at IS NULL
            WHERE p.collection = ?1 AND p.failed = 0 AND c.id IS NULL
            ORDER BY p.id
            "#,
            collection,
            &[&collection.as_str() as &dyn rusqlite::ToSql],
        )
    }

    /// The queued change for one record, if any.
    pub fn pending_change_for(
        &self,
        collection: &Collection,
        id: &RecordId,
    ) -> Result<Option<PendingChange>> {
        let found = self.query_changes(
            "SELECT id, seq, record_id, operation, snapshot, base_revision, created_at,
                    retry_count, last_error, failed
             FROM pending_changes WHERE collection = ?1 AND record_id = ?2",
            collection,
            &[&collection.as_str() as &dyn rusqlite::ToSql, &id.as_str()],
        )?;
        Ok(found.into_iter().next())
    }

    /// Quarantined (terminally failed) changes, for operator visibility.
    pub fn quarantined_changes(&self, collection: &Collection) -> Result<Vec<PendingChange>> {
        self.query_changes(
            "SELECT id, seq, record_id, operation, snapshot, base_revision, created_at,
                    retry_count, last_error, failed
             FROM pending_changes WHERE collection = ?1 AND failed = 1 ORDER BY id",
            collection,
            &[&collection.as_str() as &dyn rusqlite::ToSql],
        )
    }

    fn query_changes(
        &self,
        sql: &str,
        collection: &Collection,
        bind: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<PendingChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows: Vec<RawChange> = stmt
            .query_map(bind, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err)?;

        rows.into_iter()
            .map(|raw| raw_to_change(collection, raw))
            .collect()
    }

    /// Every collection the store has heard of: mirrored rows, queued
    /// changes, or sync bookkeeping.
    pub fn known_collections(&self) -> Result<Vec<Collection>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT collection FROM records
                 UNION SELECT collection FROM pending_changes
                 UNION SELECT collection FROM sync_metadata
                 ORDER BY collection",
            )
            .map_err(sql_err)?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err)?;
        names.into_iter().map(Collection::new).collect()
    }

    /// Collections that currently have non-quarantined queued changes.
    pub fn collections_with_pending(&self) -> Result<Vec<Collection>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT collection FROM pending_changes WHERE failed = 0")
            .map_err(sql_err)?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err)?;
        names.into_iter().map(Collection::new).collect()
    }

    /// Count of non-quarantined queued changes for a collection.
    pub fn pending_count(&self, collection: &Collection) -> Result<u32> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_changes WHERE collection = ?1 AND failed = 0",
                params![collection.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count as u32)
    }

    /// Confirm a remotely applied change: remove the queue entry and mark the
    /// record `synced`, as one transaction.
    ///
    /// The removal is conditional on `seq`: if a later local write coalesced
    /// into the entry while the apply was in flight, nothing is confirmed and
    /// the newer content drains on a later pass. Returns whether the change
    /// was confirmed.
    pub fn confirm_applied(
        &self,
        collection: &Collection,
        id: &RecordId,
        change_id: i64,
        seq: i64,
        new_revision: Option<&str>,
        modified: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let removed = tx
            .execute(
                "DELETE FROM pending_changes WHERE id = ?1 AND seq = ?2",
                params![change_id, seq],
            )
            .map_err(sql_err)?;
        if removed == 0 {
            debug!(
                "Skipping confirmation for {}/{}: queue entry superseded mid-flight",
                collection, id
            );
            return Ok(false);
        }

        if let Some(revision) = new_revision {
            tx.execute(
                r#"
                UPDATE records SET sync_status = 'synced', remote_revision = ?3, last_modified = ?4
                WHERE collection = ?1 AND id = ?2 AND sync_status = 'pending'
                "#,
                params![collection.as_str(), id.as_str(), revision, ts(modified)],
            )
            .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(true)
    }

    /// Record a failed sync attempt for a queued change.
    ///
    /// Returns the updated retry count.
    pub fn record_change_failure(&self, change_id: i64, error: &str) -> Result<u32> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE pending_changes SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
            params![change_id, error],
        )
        .map_err(sql_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT retry_count FROM pending_changes WHERE id = ?1",
                params![change_id],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count as u32)
    }

    /// Mark a queued change terminally failed. Conditional on `seq` so a
    /// fresh local write is never quarantined by a stale verdict.
    pub fn quarantine_change(&self, change_id: i64, seq: i64) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE pending_changes SET failed = 1 WHERE id = ?1 AND seq = ?2",
                params![change_id, seq],
            )
            .map_err(sql_err)?;
        if updated > 0 {
            warn!("Quarantined change {} after repeated failures", change_id);
        }
        Ok(updated > 0)
    }

    // ---- conflicts ----

    /// Record a divergence for a record, updating the open conflict in place
    /// if one exists. The local row, when present, is marked `conflicted`.
    pub fn upsert_conflict(
        &self,
        collection: &Collection,
        id: &RecordId,
        local: Option<&Payload>,
        remote: Option<&Payload>,
        remote_revision: Option<&str>,
        kind: ConflictKind,
    ) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        tx.execute(
            r#"
            INSERT INTO conflicts
                (collection, record_id, local_payload, remote_payload, remote_revision, kind, resolution, detected_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'unresolved', ?7)
            ON CONFLICT (collection, record_id) WHERE resolved_at IS NULL DO UPDATE SET
                local_payload = excluded.local_payload,
                remote_payload = excluded.remote_payload,
                remote_revision = excluded.remote_revision,
                kind = excluded.kind,
                detected_at = excluded.detected_at
            "#,
            params![
                collection.as_str(),
                id.as_str(),
                local.map(Payload::to_json).transpose()?,
                remote.map(Payload::to_json).transpose()?,
                remote_revision,
                kind.as_str(),
                ts(Utc::now()),
            ],
        )
        .map_err(sql_err)?;

        let conflict_id: i64 = tx
            .query_row(
                "SELECT id FROM conflicts
                 WHERE collection = ?1 AND record_id = ?2 AND resolved_at IS NULL",
                params![collection.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        tx.execute(
            "UPDATE records SET sync_status = 'conflicted' WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id.as_str()],
        )
        .map_err(sql_err)?;

        tx.commit().map_err(sql_err)?;
        info!("Recorded {} conflict for {}/{}", kind.as_str(), collection, id);
        Ok(conflict_id)
    }

    /// All unresolved conflicts, oldest first.
    pub fn open_conflicts(&self) -> Result<Vec<Conflict>> {
        self.query_conflicts(
            "SELECT id, collection, record_id, local_payload, remote_payload, remote_revision,
                    kind, resolution, detected_at, resolved_at
             FROM conflicts WHERE resolved_at IS NULL ORDER BY id",
            &[],
        )
    }

    /// A single conflict by id.
    pub fn get_conflict(&self, conflict_id: i64) -> Result<Option<Conflict>> {
        let found = self.query_conflicts(
            "SELECT id, collection, record_id, local_payload, remote_payload, remote_revision,
                    kind, resolution, detected_at, resolved_at
             FROM conflicts WHERE id = ?1",
            &[&conflict_id],
        )?;
        Ok(found.into_iter().next())
    }

    fn query_conflicts(
        &self,
        sql: &str,
        bind: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Conflict>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows: Vec<RawConflict> = stmt
            .query_map(bind, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err)?;

        rows.into_iter().map(raw_to_conflict).collect()
    }

    /// Apply a resolution strategy to an open conflict, transactionally.
    ///
    /// - `LocalWins`: re-enqueue the local side as a fresh change.
    /// - `RemoteWins`: install the remote side locally (or drop the row for a
    ///   remote tombstone) and discard the queued change.
    /// - `ManualMerge`: install `merged` locally and enqueue it.
    ///
    /// Either every effect lands or none does.
    pub fn resolve_conflict(
        &self,
        conflict_id: i64,
        resolution: Resolution,
        merged: Option<&Payload>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let raw: Option<RawConflict> = tx
            .query_row(
                "SELECT id, collection, record_id, local_payload, remote_payload, remote_revision,
                        kind, resolution, detected_at, resolved_at
                 FROM conflicts WHERE id = ?1",
                params![conflict_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;
        let conflict = raw
            .map(raw_to_conflict)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("Conflict not found: {conflict_id}")))?;
        if !conflict.is_open() {
            return Err(Error::InvalidInput(format!(
                "Conflict {conflict_id} is already resolved"
            )));
        }

        let collection = &conflict.collection;
        let id = &conflict.record_id;
        let now = Utc::now();

        match resolution {
            Resolution::Unresolved => {
                return Err(Error::InvalidInput(
                    "Cannot resolve a conflict to 'unresolved'".to_string(),
                ));
            }
            Resolution::LocalWins => {
                match (&conflict.local_payload, &conflict.remote_payload) {
                    // Both sides updated: push our payload over theirs.
                    (Some(local), Some(_)) => {
                        set_record(&tx, collection, id, local, SyncStatus::Pending, now)?;
                        replace_queue_entry(
                            &tx,
                            collection,
                            id,
                            Operation::Update,
                            Some(local),
                            conflict.remote_revision.as_deref(),
                        )?;
                    }
                    // Remote deleted: re-create the record remotely.
                    (Some(local), None) => {
                        set_record(&tx, collection, id, local, SyncStatus::Pending, now)?;
                        replace_queue_entry(
                            &tx,
                            collection,
                            id,
                            Operation::Insert,
                            Some(local),
                            None,
                        )?;
                    }
                    // Local deleted: push the delete over the remote update.
                    (None, _) => {
                        replace_queue_entry(
                            &tx,
                            collection,
                            id,
                            Operation::Delete,
                            None,
                            conflict.remote_revision.as_deref(),
                        )?;
                    }
                }
            }
            Resolution::RemoteWins => {
                tx.execute(
                    "DELETE FROM pending_changes WHERE collection = ?1 AND record_id = ?2",
                    params![collection.as_str(), id.as_str()],
                )
                .map_err(sql_err)?;
                match &conflict.remote_payload {
                    Some(remote) => {
                        upsert_record_synced(
                            &tx,
                            collection,
                            id,
                            remote,
                            conflict.remote_revision.as_deref(),
                            now,
                        )?;
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                            params![collection.as_str(), id.as_str()],
                        )
                        .map_err(sql_err)?;
                    }
                }
            }
            Resolution::ManualMerge => {
                let merged = merged.ok_or_else(|| {
                    Error::InvalidInput("manual-merge requires a merged payload".to_string())
                })?;
                set_record(&tx, collection, id, merged, SyncStatus::Pending, now)?;
                let (op, base) = if conflict.remote_payload.is_some() {
                    (Operation::Update, conflict.remote_revision.as_deref())
                } else {
                    (Operation::Insert, None)
                };
                replace_queue_entry(&tx, collection, id, op, Some(merged), base)?;
            }
        }

        tx.execute(
            "UPDATE conflicts SET resolution = ?2, resolved_at = ?3 WHERE id = ?1",
            params![conflict_id, resolution.as_str(), ts(now)],
        )
        .map_err(sql_err)?;

        tx.commit().map_err(sql_err)?;
        info!(
            "Resolved conflict {} for {}/{} as {}",
            conflict_id,
            collection,
            id,
            resolution.as_str()
        );
        Ok(())
    }

    // ---- sync metadata ----

    /// Bookkeeping for a collection. Defaults to empty when never synced.
    pub fn metadata(&self, collection: &Collection) -> Result<SyncMetadata> {
        let conn = self.lock()?;
        let row: Option<(Option<String>, i64)> = conn
            .query_row(
                "SELECT last_sync_at, pending_count FROM sync_metadata WHERE collection = ?1",
                params![collection.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)?;
        match row {
            Some((last, count)) => Ok(SyncMetadata {
                collection: collection.clone(),
                last_sync_at: last.as_deref().map(parse_ts).transpose()?,
                pending_count: count as u32,
            }),
            None => Ok(SyncMetadata {
                collection: collection.clone(),
                last_sync_at: None,
                pending_count: 0,
            }),
        }
    }

    /// Recompute `pending_count` (and optionally stamp `last_sync_at`) for a
    /// collection. Called by the reconciliation engine at pass end; nothing
    /// else writes this table.
    pub fn refresh_metadata(
        &self,
        collection: &Collection,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sync_metadata (collection, last_sync_at, pending_count)
            VALUES (
                ?1, ?2,
                (SELECT COUNT(*) FROM pending_changes WHERE collection = ?1 AND failed = 0)
            )
            ON CONFLICT (collection) DO UPDATE SET
                pending_count = excluded.pending_count,
                last_sync_at = COALESCE(excluded.last_sync_at, sync_metadata.last_sync_at)
            "#,
            params![collection.as_str(), synced_at.map(ts)],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ---- settings ----

    /// Get a persisted setting value.
    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)
    }

    /// Set a persisted setting value.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Get a boolean setting, defaulting when unset.
    pub fn bool_setting(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self
            .setting(key)?
            .map(|v| v == "true")
            .unwrap_or(default))
    }

    /// Set a boolean setting.
    pub fn set_bool_setting(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "true" } else { "false" })
    }

    // ---- maintenance ----

    /// Prune resolved conflicts and quarantined changes older than the
    /// retention window. Returns the number of rows removed.
    pub fn vacuum(&self, retention: Duration) -> Result<usize> {
        let cutoff = ts(Utc::now() - retention);
        let conn = self.lock()?;
        let conflicts = conn
            .execute(
                "DELETE FROM conflicts WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
                params![cutoff],
            )
            .map_err(sql_err)?;
        let changes = conn
            .execute(
                "DELETE FROM pending_changes WHERE failed = 1 AND created_at < ?1",
                params![cutoff],
            )
            .map_err(sql_err)?;
        if conflicts + changes > 0 {
            info!(
                "Vacuum pruned {} resolved conflicts, {} quarantined changes",
                conflicts, changes
            );
        }
        Ok(conflicts + changes)
    }
}

// ---- row plumbing ----

type RawRecord = (String, String, String, String, Option<String>, Option<String>);
type RawChange = (
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    i64,
    Option<String>,
    i64,
);
type RawConflict = (
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
);

fn raw_to_record(collection: &Collection, raw: RawRecord) -> Result<LocalRecord> {
    let (id, payload, status, modified, scope, revision) = raw;
    Ok(LocalRecord {
        id: RecordId::new(id)?,
        collection: collection.clone(),
        payload: Payload::from_json(&payload)?,
        sync_status: SyncStatus::parse(&status)?,
        last_modified: parse_ts(&modified)?,
        scope,
        remote_revision: revision,
    })
}

fn raw_to_change(collection: &Collection, raw: RawChange) -> Result<PendingChange> {
    let (id, seq, record_id, operation, snapshot, base, created, retries, last_error, failed) = raw;
    Ok(PendingChange {
        id,
        seq,
        collection: collection.clone(),
        record_id: RecordId::new(record_id)?,
        operation: Operation::parse(&operation)?,
        snapshot: opt_payload(snapshot)?,
        base_revision: base,
        created_at: parse_ts(&created)?,
        retry_count: retries as u32,
        last_error,
        failed: failed != 0,
    })
}

fn raw_to_conflict(raw: RawConflict) -> Result<Conflict> {
    let (id, collection, record_id, local, remote, revision, kind, resolution, detected, resolved) =
        raw;
    Ok(Conflict {
        id,
        collection: Collection::new(collection)?,
        record_id: RecordId::new(record_id)?,
        local_payload: opt_payload(local)?,
        remote_payload: opt_payload(remote)?,
        remote_revision: revision,
        kind: ConflictKind::parse(&kind)?,
        resolution: Resolution::parse(&resolution)?,
        detected_at: parse_ts(&detected)?,
        resolved_at: resolved.as_deref().map(parse_ts).transpose()?,
    })
}

/// Coalesce a new local mutation into the queue, keeping at most one
/// effective change per record.
///
/// Net-effect rules: Insert∘Update stays an Insert carrying the merged
/// payload; Update∘Update keeps the latest payload; anything followed by
/// Delete becomes a Delete; an unsynced Insert followed by Delete cancels
/// outright; Delete followed by re-Insert becomes an Update (the remote row
/// still exists). Coalescing resets retry bookkeeping and bumps `seq`.
fn enqueue_coalesced(
    tx: &Transaction<'_>,
    collection: &Collection,
    id: &RecordId,
    new_op: Operation,
    snapshot: Option<&Payload>,
    base_revision: Option<&str>,
) -> Result<()> {
    let existing: Option<(i64, String)> = tx
        .query_row(
            "SELECT id, operation FROM pending_changes WHERE collection = ?1 AND record_id = ?2",
            params![collection.as_str(), id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(sql_err)?;

    let Some((change_id, existing_op)) = existing else {
        tx.execute(
            r#"
            INSERT INTO pending_changes
                (collection, record_id, operation, snapshot, base_revision, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                collection.as_str(),
                id.as_str(),
                new_op.as_str(),
                snapshot.map(Payload::to_json).transpose()?,
                base_revision,
                ts(Utc::now()),
            ],
        )
        .map_err(sql_err)?;
        return Ok(());
    };

    let existing_op = Operation::parse(&existing_op)?;
    let effective = match (existing_op, new_op) {
        // Never-synced insert followed by delete: the pair cancels.
        (Operation::Insert, Operation::Delete) => {
            tx.execute(
                "DELETE FROM pending_changes WHERE id = ?1",
                params![change_id],
            )
            .map_err(sql_err)?;
            debug!("Cancelled unsynced insert of {}/{}", collection, id);
            return Ok(());
        }
        (_, Operation::Delete) => Operation::Delete,
        (Operation::Insert, Operation::Update) => Operation::Insert,
        (Operation::Update, Operation::Update) => Operation::Update,
        // Re-created while the delete is still queued: the remote row exists.
        (Operation::Delete, Operation::Insert) => Operation::Update,
        (a, b) => {
            return Err(Error::InvalidInput(format!(
                "Cannot queue {} over pending {} for {}/{}",
                b.as_str(),
                a.as_str(),
                collection,
                id
            )));
        }
    };

    tx.execute(
        r#"
        UPDATE pending_changes
        SET operation = ?2, snapshot = ?3, retry_count = 0, last_error = NULL,
            failed = 0, seq = seq + 1
        WHERE id = ?1
        "#,
        params![
            change_id,
            effective.as_str(),
            snapshot.map(Payload::to_json).transpose()?,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

/// Replace whatever is queued for a record with a fresh change (conflict
/// resolution path).
fn replace_queue_entry(
    tx: &Transaction<'_>,
    collection: &Collection,
    id: &RecordId,
    op: Operation,
    snapshot: Option<&Payload>,
    base_revision: Option<&str>,
) -> Result<()> {
    tx.execute(
        "DELETE FROM pending_changes WHERE collection = ?1 AND record_id = ?2",
        params![collection.as_str(), id.as_str()],
    )
    .map_err(sql_err)?;
    tx.execute(
        r#"
        INSERT INTO pending_changes
            (collection, record_id, operation, snapshot, base_revision, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            collection.as_str(),
            id.as_str(),
            op.as_str(),
            snapshot.map(Payload::to_json).transpose()?,
            base_revision,
            ts(Utc::now()),
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn set_record(
    tx: &Transaction<'_>,
    collection: &Collection,
    id: &RecordId,
    payload: &Payload,
    status: SyncStatus,
    modified: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO records (collection, id, payload, sync_status, last_modified)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (collection, id) DO UPDATE SET
            payload = excluded.payload,
            sync_status = excluded.sync_status,
            last_modified = excluded.last_modified
        "#,
        params![
            collection.as_str(),
            id.as_str(),
            payload.to_json()?,
            status.as_str(),
            ts(modified),
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn upsert_record_synced(
    tx: &Transaction<'_>,
    collection: &Collection,
    id: &RecordId,
    payload: &Payload,
    revision: Option<&str>,
    modified: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO records (collection, id, payload, sync_status, last_modified, remote_revision)
        VALUES (?1, ?2, ?3, 'synced', ?4, ?5)
        ON CONFLICT (collection, id) DO UPDATE SET
            payload = excluded.payload,
            sync_status = 'synced',
            last_modified = excluded.last_modified,
            remote_revision = excluded.remote_revision
        "#,
        params![
            collection.as_str(),
            id.as_str(),
            payload.to_json()?,
            ts(modified),
            revision,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}
