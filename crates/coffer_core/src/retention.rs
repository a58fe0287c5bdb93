//! The retention collector: permanent erasure of confirmed tombstones.
//!
//! A record may be physically erased only once it is soft-deleted, the
//! deletion has been acknowledged by the remote authority, and the tombstone
//! is older than the retention window. The precondition is re-checked inside
//! the delete statement itself, so a sweep running concurrently with a sync
//! cycle never erases a record that became newly pending mid-scan.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::record::EntityKind;
use crate::store::RecordStore;

/// Default retention window for tombstones, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Total records physically erased.
    pub erased: u64,
    /// Tables whose sweep failed; the others were still swept.
    pub failed_tables: u64,
}

/// Sweeps confirmed tombstones past the retention window.
pub struct RetentionCollector {
    store: Arc<RecordStore>,
    window: Duration,
}

impl RetentionCollector {
    /// Creates a collector with the default retention window.
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self::with_window(store, Duration::days(DEFAULT_RETENTION_DAYS))
    }

    /// Creates a collector with a custom retention window.
    pub fn with_window(store: Arc<RecordStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Erases eligible tombstones from every table.
    ///
    /// A failing table is logged and counted; remaining tables are still
    /// swept.
    pub fn sweep(&self) -> SweepReport {
        let cutoff = Utc::now() - self.window;
        let mut report = SweepReport::default();

        for kind in EntityKind::ALL {
            match self.store.purge(kind, cutoff) {
                Ok(erased) => {
                    if erased > 0 {
                        debug!(kind = %kind, erased, "retention sweep erased tombstones");
                    }
                    report.erased += erased;
                }
                Err(error) => {
                    warn!(kind = %kind, %error, "retention sweep failed for table");
                    report.failed_tables += 1;
                }
            }
        }
        report
    }
}
