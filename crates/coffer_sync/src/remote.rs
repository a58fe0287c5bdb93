//! The remote authority abstraction and wire types.
//!
//! The authority is the external system of record. It enforces its own
//! server-side invariants; the engine only learns about them through
//! per-record rejections. The trait abstracts the transport so tests and
//! loopback setups can run against [`MemoryAuthority`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coffer_core::{EntityKind, Record};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// A record as it travels to and from the authority.
///
/// Identical to the at-rest form: sensitive fields stay tokenized in
/// transit, and `pending_sync` is local bookkeeping the authority never
/// sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record id.
    pub id: Uuid,
    /// Field map, sensitive fields tokenized.
    pub fields: Map<String, Value>,
    /// Last mutation time of this state.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete tombstone, if any.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Revision assigned by the authority.
    pub version: Option<i64>,
}

impl From<&Record> for RemoteRecord {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id,
            fields: record.fields.clone(),
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            version: record.version,
        }
    }
}

impl RemoteRecord {
    /// Converts into a local record, clean (not pending).
    pub fn into_record(self) -> Record {
        Record {
            id: self.id,
            fields: self.fields,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            pending_sync: false,
            version: self.version,
        }
    }

    fn same_state(&self, other: &RemoteRecord) -> bool {
        self.fields == other.fields
            && self.updated_at == other.updated_at
            && self.deleted_at == other.deleted_at
    }
}

/// The authority's verdict on one pushed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushOutcome {
    /// The state was accepted and assigned a revision.
    Accepted {
        /// The revision assigned by the authority.
        version: i64,
    },
    /// The state violated a server-side invariant. Non-fatal: the record
    /// stays pending and the cycle continues with the next record.
    Rejected {
        /// The rejection reason, surfaced to the caller.
        reason: String,
    },
}

/// One page of remote changes for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    /// Changes since the requested cursor, oldest first.
    pub changes: Vec<RemoteRecord>,
    /// Cursor to persist after applying this batch.
    pub new_cursor: u64,
    /// Whether more changes are available.
    pub has_more: bool,
}

/// The external system of record consulted during sync.
pub trait RemoteAuthority: Send + Sync {
    /// Submits one record state for acceptance.
    fn push(&self, kind: EntityKind, record: &RemoteRecord) -> SyncResult<PushOutcome>;

    /// Fetches changes for a table since `cursor`.
    fn pull(&self, kind: EntityKind, cursor: u64) -> SyncResult<PullBatch>;
}

#[derive(Default)]
struct AuthorityInner {
    records: HashMap<(EntityKind, Uuid), RemoteRecord>,
    log: Vec<(u64, EntityKind, Uuid)>,
    next_seq: u64,
    offline: bool,
    lose_ack_at: Option<u64>,
    pushes_seen: u64,
    rejections: HashMap<Uuid, String>,
    batch_limit: usize,
}

/// An in-memory remote authority for tests and loopback use.
///
/// Clones share state, so a test can keep a handle for failure injection
/// after handing the authority to an engine.
#[derive(Clone)]
pub struct MemoryAuthority {
    inner: Arc<Mutex<AuthorityInner>>,
}

impl MemoryAuthority {
    /// Creates an empty, online authority.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuthorityInner {
                batch_limit: 100,
                ..AuthorityInner::default()
            })),
        }
    }

    /// Limits how many changes one pull returns.
    pub fn with_batch_limit(self, limit: usize) -> Self {
        self.inner.lock().batch_limit = limit.max(1);
        self
    }

    /// Simulates connectivity loss or restoration.
    pub fn set_online(&self, online: bool) {
        self.inner.lock().offline = !online;
    }

    /// Makes the nth future push (1-indexed) apply server-side but lose its
    /// acknowledgement, then drops the connection.
    pub fn lose_ack_at(&self, nth: u64) {
        let mut inner = self.inner.lock();
        inner.lose_ack_at = Some(inner.pushes_seen + nth);
    }

    /// Makes every push of `id` fail a server-side invariant.
    pub fn reject(&self, id: Uuid, reason: impl Into<String>) {
        self.inner.lock().rejections.insert(id, reason.into());
    }

    /// Seeds a change as if another device had pushed it.
    pub fn seed(&self, kind: EntityKind, mut record: RemoteRecord) -> i64 {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        record.version = Some(seq as i64);
        inner.log.push((seq, kind, record.id));
        inner.records.insert((kind, record.id), record);
        seq as i64
    }

    /// The authority's current state for a record.
    pub fn get(&self, kind: EntityKind, id: Uuid) -> Option<RemoteRecord> {
        self.inner.lock().records.get(&(kind, id)).cloned()
    }

    /// Number of distinct record states ever accepted.
    pub fn change_count(&self) -> u64 {
        self.inner.lock().next_seq
    }
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteAuthority for MemoryAuthority {
    fn push(&self, kind: EntityKind, record: &RemoteRecord) -> SyncResult<PushOutcome> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(SyncError::network_retryable("authority unreachable"));
        }
        inner.pushes_seen += 1;

        if let Some(reason) = inner.rejections.get(&record.id) {
            return Ok(PushOutcome::Rejected {
                reason: reason.clone(),
            });
        }

        // Idempotence: re-pushing an unchanged state re-acknowledges the
        // existing revision without a new change log entry.
        if let Some(existing) = inner.records.get(&(kind, record.id)) {
            if existing.same_state(record) {
                let version = existing.version.unwrap_or_default();
                return Ok(PushOutcome::Accepted { version });
            }
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        let mut accepted = record.clone();
        accepted.version = Some(seq as i64);
        inner.log.push((seq, kind, record.id));
        inner.records.insert((kind, record.id), accepted);

        if inner.lose_ack_at == Some(inner.pushes_seen) {
            // Applied server-side, but the acknowledgement never arrives and
            // the connection is gone afterwards.
            inner.lose_ack_at = None;
            inner.offline = true;
            return Err(SyncError::network_retryable(
                "connection lost before acknowledgement",
            ));
        }

        Ok(PushOutcome::Accepted {
            version: seq as i64,
        })
    }

    fn pull(&self, kind: EntityKind, cursor: u64) -> SyncResult<PullBatch> {
        let inner = self.inner.lock();
        if inner.offline {
            return Err(SyncError::network_retryable("authority unreachable"));
        }

        let mut changes = Vec::new();
        let mut new_cursor = cursor;
        let mut has_more = false;
        for &(seq, entry_kind, id) in &inner.log {
            if seq <= cursor || entry_kind != kind {
                continue;
            }
            if changes.len() == inner.batch_limit {
                has_more = true;
                break;
            }
            if let Some(record) = inner.records.get(&(kind, id)) {
                changes.push(record.clone());
            }
            new_cursor = seq;
        }

        Ok(PullBatch {
            changes,
            new_cursor,
            has_more,
        })
    }
}
