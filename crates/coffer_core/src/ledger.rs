//! The `Ledger` facade: the surface the UI/caller layer talks to.
//!
//! Sync triggering lives in the sync engine, which shares this ledger's
//! record store.

use std::path::Path;
use std::sync::Arc;

use chrono::Duration;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::audit::{FixStrategy, IntegrityAuditor, Issue};
use crate::codec::FieldCodec;
use crate::crypto::KeyProvider;
use crate::error::CoreResult;
use crate::record::{EntityKind, Record};
use crate::retention::{RetentionCollector, SweepReport};
use crate::store::{DecodedRecord, RecordStore};

/// A local-first finance ledger: encrypted record store, change tracking,
/// retention, and integrity auditing behind one handle.
pub struct Ledger {
    store: Arc<RecordStore>,
    collector: RetentionCollector,
    auditor: IntegrityAuditor,
}

impl Ledger {
    /// Opens (or creates) a ledger at `path`, encrypting sensitive fields
    /// with the provider's session key. A locked provider degrades to
    /// plaintext operation instead of failing.
    pub fn open(path: impl AsRef<Path>, provider: &dyn KeyProvider) -> CoreResult<Self> {
        let codec = FieldCodec::from_provider(provider)?;
        Self::from_store(RecordStore::open(path, codec)?)
    }

    /// Opens an in-memory ledger.
    pub fn open_in_memory(provider: &dyn KeyProvider) -> CoreResult<Self> {
        let codec = FieldCodec::from_provider(provider)?;
        Self::from_store(RecordStore::open_in_memory(codec)?)
    }

    fn from_store(store: RecordStore) -> CoreResult<Self> {
        let store = Arc::new(store);
        Ok(Self {
            collector: RetentionCollector::new(Arc::clone(&store)),
            auditor: IntegrityAuditor::new(Arc::clone(&store)),
            store,
        })
    }

    /// Overrides the tombstone retention window.
    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.collector = RetentionCollector::with_window(Arc::clone(&self.store), window);
        self
    }

    /// The shared record store, for wiring up a sync engine.
    pub fn store(&self) -> Arc<RecordStore> {
        Arc::clone(&self.store)
    }

    /// Creates a record with a fresh client-generated id.
    pub fn create(&self, kind: EntityKind, fields: Map<String, Value>) -> CoreResult<Record> {
        self.store.create(kind, fields)
    }

    /// Applies a field patch to a record.
    pub fn mutate(&self, kind: EntityKind, id: Uuid, patch: Map<String, Value>) -> CoreResult<()> {
        self.store.mutate(kind, id, patch)
    }

    /// Soft-deletes a record; it remains a tombstone until sync confirms the
    /// deletion and the retention window elapses.
    pub fn soft_delete(&self, kind: EntityKind, id: Uuid) -> CoreResult<()> {
        self.store.soft_delete(kind, id)
    }

    /// Restores a soft-deleted record.
    pub fn restore(&self, kind: EntityKind, id: Uuid) -> CoreResult<()> {
        self.store.restore(kind, id)
    }

    /// Fetches a record with sensitive fields decoded.
    pub fn get(&self, kind: EntityKind, id: Uuid) -> CoreResult<Option<DecodedRecord>> {
        self.store.get(kind, id)
    }

    /// Lists the non-deleted records of a kind, decoded.
    pub fn list(&self, kind: EntityKind) -> CoreResult<Vec<DecodedRecord>> {
        self.store.list(kind)
    }

    /// Number of records awaiting propagation to the remote authority.
    pub fn pending_count(&self) -> CoreResult<u64> {
        self.store.pending_count()
    }

    /// Scans for referential and temporal anomalies. Reporting only; nothing
    /// is fixed until [`apply_fix`](Self::apply_fix).
    pub fn run_integrity_checkup(&self) -> CoreResult<Vec<Issue>> {
        self.auditor.checkup()
    }

    /// Applies one explicit remediation.
    pub fn apply_fix(&self, issue: &Issue, strategy: &FixStrategy) -> CoreResult<()> {
        self.auditor.fix(issue, strategy)
    }

    /// Erases confirmed tombstones past the retention window.
    pub fn run_retention_sweep(&self) -> SweepReport {
        self.collector.sweep()
    }
}
