//! The local record store: one SQLite table per entity kind, each row a
//! [`Record`] with its sync/lifecycle metadata.
//!
//! Change tracking is built into the write path: every local write sets
//! `pending_sync` and bumps `updated_at`. Sensitive fields go through the
//! [`FieldCodec`] on the way in and out, so the at-rest form is also the
//! wire form the sync engine pushes.
//!
//! The connection sits behind a mutex, which serializes writes and gives the
//! single-writer-per-record discipline the sync bookkeeping relies on.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::codec::{FieldCodec, FieldDecodeFailure};
use crate::error::{CoreError, CoreResult};
use crate::record::{EntityKind, Record};

/// A decoded record together with any isolated field decode failures.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// The record with tokens decrypted where possible.
    pub record: Record,
    /// Fields that could not be decoded; their tokens are left in place.
    pub failures: Vec<FieldDecodeFailure>,
}

/// Keyed, indexed, transactional store of entity tables.
pub struct RecordStore {
    conn: Mutex<Connection>,
    codec: FieldCodec,
}

impl RecordStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>, codec: FieldCodec) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, codec)
    }

    /// Opens an in-memory store.
    pub fn open_in_memory(codec: FieldCodec) -> CoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, codec)
    }

    fn with_connection(conn: Connection, codec: FieldCodec) -> CoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            codec,
        })
    }

    /// Returns the field codec this store encodes through.
    pub fn codec(&self) -> &FieldCodec {
        &self.codec
    }

    /// Inserts a new record with a client-generated id, pending sync.
    ///
    /// # Errors
    ///
    /// Fails if the id already exists: ids are never reused.
    pub fn insert(
        &self,
        kind: EntityKind,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> CoreResult<Record> {
        let stored = self.codec.encode_fields(kind, &fields)?;
        let now = Utc::now();

        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (id, fields, updated_at, deleted_at, pending_sync, version) \
                 VALUES (?1, ?2, ?3, NULL, 1, NULL)",
                kind.table()
            ),
            params![id.to_string(), serde_json::to_string(&stored)?, micros(now)],
        )?;

        let mut record = Record::new(id, fields);
        record.updated_at = now;
        Ok(record)
    }

    /// Creates a new record with a fresh id.
    pub fn create(&self, kind: EntityKind, fields: Map<String, Value>) -> CoreResult<Record> {
        self.insert(kind, Uuid::new_v4(), fields)
    }

    /// Applies a field patch to a record: present keys are set, `null` values
    /// remove the key. Marks the record pending.
    pub fn mutate(&self, kind: EntityKind, id: Uuid, patch: Map<String, Value>) -> CoreResult<()> {
        let patch = self.codec.encode_fields(kind, &patch)?;

        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                &format!("SELECT fields FROM {} WHERE id = ?1", kind.table()),
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let fields = existing.ok_or(CoreError::RecordNotFound { kind, id })?;

        let mut merged: Map<String, Value> = serde_json::from_str(&fields)?;
        for (name, value) in patch {
            if value.is_null() {
                merged.remove(&name);
            } else {
                merged.insert(name, value);
            }
        }

        // MAX keeps updated_at strictly monotonic per record even when two
        // writes land in the same microsecond, which the mark_synced guard
        // depends on.
        conn.execute(
            &format!(
                "UPDATE {} SET fields = ?1, updated_at = MAX(?2, updated_at + 1), \
                 pending_sync = 1 WHERE id = ?3",
                kind.table()
            ),
            params![
                serde_json::to_string(&merged)?,
                micros(Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    /// Soft-deletes a record. Idempotent: deleting a tombstone is a no-op.
    pub fn soft_delete(&self, kind: EntityKind, id: Uuid) -> CoreResult<()> {
        let now = micros(Utc::now());
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET deleted_at = MAX(?1, updated_at + 1), \
                 updated_at = MAX(?1, updated_at + 1), pending_sync = 1 \
                 WHERE id = ?2 AND deleted_at IS NULL",
                kind.table()
            ),
            params![now, id.to_string()],
        )?;
        if changed == 0 && !exists(&conn, kind, id)? {
            return Err(CoreError::RecordNotFound { kind, id });
        }
        Ok(())
    }

    /// Restores a soft-deleted record. The explicit restore mutation is the
    /// only path that clears a tombstone.
    pub fn restore(&self, kind: EntityKind, id: Uuid) -> CoreResult<()> {
        let now = micros(Utc::now());
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET deleted_at = NULL, \
                 updated_at = MAX(?1, updated_at + 1), pending_sync = 1 \
                 WHERE id = ?2 AND deleted_at IS NOT NULL",
                kind.table()
            ),
            params![now, id.to_string()],
        )?;
        if changed == 0 && !exists(&conn, kind, id)? {
            return Err(CoreError::RecordNotFound { kind, id });
        }
        Ok(())
    }

    /// Fetches a record in its stored (tokenized) form.
    pub fn get_raw(&self, kind: EntityKind, id: Uuid) -> CoreResult<Option<Record>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", select_clause(kind)),
                params![id.to_string()],
                raw_row,
            )
            .optional()?;
        row.map(RawRow::into_record).transpose()
    }

    /// Fetches a record with its sensitive fields decoded.
    pub fn get(&self, kind: EntityKind, id: Uuid) -> CoreResult<Option<DecodedRecord>> {
        Ok(self.get_raw(kind, id)?.map(|record| self.decode(kind, record)))
    }

    /// Lists records of a kind in their stored form.
    pub fn list_raw(&self, kind: EntityKind, include_deleted: bool) -> CoreResult<Vec<Record>> {
        let filter = if include_deleted {
            ""
        } else {
            " WHERE deleted_at IS NULL"
        };
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{}{filter} ORDER BY updated_at", select_clause(kind)))?;
        let rows = stmt.query_map([], raw_row)?;
        rows.map(|row| RawRow::into_record(row?))
            .collect::<CoreResult<Vec<_>>>()
    }

    /// Lists non-deleted records of a kind, decoded.
    pub fn list(&self, kind: EntityKind) -> CoreResult<Vec<DecodedRecord>> {
        Ok(self
            .list_raw(kind, false)?
            .into_iter()
            .map(|record| self.decode(kind, record))
            .collect())
    }

    /// Records of a kind awaiting propagation, in their stored form.
    pub fn pending(&self, kind: EntityKind) -> CoreResult<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE pending_sync = 1 ORDER BY updated_at",
            select_clause(kind)
        ))?;
        let rows = stmt.query_map([], raw_row)?;
        rows.map(|row| RawRow::into_record(row?))
            .collect::<CoreResult<Vec<_>>>()
    }

    /// All pending records across all tables, in sync order.
    pub fn pending_all(&self) -> CoreResult<Vec<(EntityKind, Record)>> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            for record in self.pending(kind)? {
                out.push((kind, record));
            }
        }
        Ok(out)
    }

    /// Number of records whose local state awaits acknowledgement.
    pub fn pending_count(&self) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let mut total = 0u64;
        for kind in EntityKind::ALL {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE pending_sync = 1",
                    kind.table()
                ),
                [],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }

    /// Clears `pending_sync` after the authority acknowledged the pushed
    /// state, but only if no newer local mutation happened while the push
    /// was in flight.
    ///
    /// Returns false when the guard left the record pending.
    pub fn mark_synced(
        &self,
        kind: EntityKind,
        id: Uuid,
        pushed_updated_at: DateTime<Utc>,
        version: Option<i64>,
    ) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET pending_sync = 0, version = ?1 \
                 WHERE id = ?2 AND updated_at = ?3",
                kind.table()
            ),
            params![version, id.to_string(), micros(pushed_updated_at)],
        )?;
        if changed == 0 {
            debug!(kind = %kind, %id, "newer local mutation, record stays pending");
        }
        Ok(changed > 0)
    }

    /// Writes remote state for a record, clean (not pending).
    ///
    /// `seen` is the local `updated_at` snapshot the caller resolved the
    /// change against (`None` when no local record existed). The write lands
    /// only while that snapshot still holds, so a local mutation racing the
    /// reconcile is neither overwritten nor silently marked clean.
    ///
    /// Returns false when the snapshot no longer matches and nothing was
    /// written.
    pub fn write_remote(
        &self,
        kind: EntityKind,
        record: &Record,
        seen: Option<DateTime<Utc>>,
    ) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let changed = match seen {
            Some(snapshot) => conn.execute(
                &format!(
                    "UPDATE {} SET fields = ?2, updated_at = ?3, deleted_at = ?4, \
                     pending_sync = 0, version = ?5 WHERE id = ?1 AND updated_at = ?6",
                    kind.table()
                ),
                params![
                    record.id.to_string(),
                    serde_json::to_string(&record.fields)?,
                    micros(record.updated_at),
                    record.deleted_at.map(micros),
                    record.version,
                    micros(snapshot),
                ],
            )?,
            None => conn.execute(
                &format!(
                    "INSERT INTO {} (id, fields, updated_at, deleted_at, pending_sync, version) \
                     VALUES (?1, ?2, ?3, ?4, 0, ?5) ON CONFLICT(id) DO NOTHING",
                    kind.table()
                ),
                params![
                    record.id.to_string(),
                    serde_json::to_string(&record.fields)?,
                    micros(record.updated_at),
                    record.deleted_at.map(micros),
                    record.version,
                ],
            )?,
        };
        Ok(changed > 0)
    }

    /// The last remote cursor seen for a table.
    pub fn cursor(&self, kind: EntityKind) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let cursor: Option<i64> = conn
            .query_row(
                "SELECT cursor FROM sync_cursors WHERE entity = ?1",
                params![kind.table()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.unwrap_or(0) as u64)
    }

    /// Advances the remote cursor for a table.
    pub fn set_cursor(&self, kind: EntityKind, cursor: u64) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_cursors (entity, cursor) VALUES (?1, ?2)",
            params![kind.table(), cursor as i64],
        )?;
        Ok(())
    }

    /// Physically erases confirmed tombstones older than `cutoff`.
    ///
    /// The predicate re-checks `pending_sync` at delete time, so a record
    /// that became newly pending since any earlier scan is spared.
    pub fn purge(&self, kind: EntityKind, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let erased = conn.execute(
            &format!(
                "DELETE FROM {} WHERE deleted_at IS NOT NULL \
                 AND pending_sync = 0 AND deleted_at < ?1",
                kind.table()
            ),
            params![micros(cutoff)],
        )?;
        Ok(erased as u64)
    }

    fn decode(&self, kind: EntityKind, record: Record) -> DecodedRecord {
        let (record, failures) = self.codec.decode(kind, &record);
        DecodedRecord { record, failures }
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let mut sql = String::new();
    for kind in EntityKind::ALL {
        let table = kind.table();
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                pending_sync INTEGER NOT NULL DEFAULT 1,
                version INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_pending ON {table} (pending_sync);
            CREATE INDEX IF NOT EXISTS idx_{table}_deleted ON {table} (deleted_at);\n"
        ));
    }
    sql.push_str(
        "CREATE TABLE IF NOT EXISTS sync_cursors (
            entity TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL
        );",
    );
    conn.execute_batch(&sql)
}

fn select_clause(kind: EntityKind) -> String {
    format!(
        "SELECT id, fields, updated_at, deleted_at, pending_sync, version FROM {}",
        kind.table()
    )
}

fn exists(conn: &Connection, kind: EntityKind, id: Uuid) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", kind.table()),
        params![id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

struct RawRow {
    id: String,
    fields: String,
    updated_at: i64,
    deleted_at: Option<i64>,
    pending_sync: bool,
    version: Option<i64>,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        fields: row.get(1)?,
        updated_at: row.get(2)?,
        deleted_at: row.get(3)?,
        pending_sync: row.get(4)?,
        version: row.get(5)?,
    })
}

impl RawRow {
    fn into_record(self) -> CoreResult<Record> {
        Ok(Record {
            id: Uuid::parse_str(&self.id)
                .map_err(|_| CoreError::invalid_format(format!("bad record id: {}", self.id)))?,
            fields: serde_json::from_str(&self.fields)?,
            updated_at: from_micros(self.updated_at)?,
            deleted_at: self.deleted_at.map(from_micros).transpose()?,
            pending_sync: self.pending_sync,
            version: self.version,
        })
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> CoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| CoreError::invalid_format(format!("timestamp out of range: {value}")))
}
