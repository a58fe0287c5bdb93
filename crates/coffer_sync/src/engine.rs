//! The sync engine: reconciles the local record store with the remote
//! authority.
//!
//! A cycle runs `Pushing → Pulling → Reconciling` and returns to idle; a
//! failure at any step records the error and leaves every `pending_sync`
//! flag exactly as acknowledgements dictated, ready for the next trigger.
//! Cycles are not reentrant: a trigger while one is in flight is coalesced
//! into a follow-up cycle rather than run in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coffer_core::{EntityKind, RecordStore};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::conflict::{self, Resolution};
use crate::error::{SyncError, SyncResult};
use crate::remote::{PushOutcome, RemoteAuthority, RemoteRecord};
use crate::state::{SyncState, SyncStats};

/// A push the authority rejected during a cycle. Non-fatal; the record stays
/// pending for the next cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPush {
    /// Table of the rejected record.
    pub kind: EntityKind,
    /// Id of the rejected record.
    pub id: Uuid,
    /// The authority's rejection reason.
    pub reason: String,
}

/// Result of one completed sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleResult {
    /// Records pushed and acknowledged.
    pub pushed: u64,
    /// Remote changes applied locally.
    pub pulled: u64,
    /// Pushes the authority rejected.
    pub rejections: Vec<RejectedPush>,
    /// Pulled changes resolved in favor of local state.
    pub conflicts_kept_local: u64,
    /// Duration of the cycle.
    pub duration: Duration,
    /// Whether the cycle completed.
    pub success: bool,
}

/// Outcome of a sync trigger.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// A cycle (or several, if triggers were coalesced) completed; the last
    /// result is returned.
    Completed(CycleResult),
    /// A cycle was already in flight; this request runs after it.
    Coalesced,
}

/// Reconciles the local store with a remote authority.
///
/// Triggers are source-agnostic: connectivity events, timers, and manual
/// requests all funnel into [`trigger_sync`](Self::trigger_sync).
pub struct SyncEngine<A: RemoteAuthority> {
    store: Arc<RecordStore>,
    authority: Arc<A>,
    config: SyncConfig,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    last_cycle: RwLock<Option<CycleResult>>,
    cancelled: AtomicBool,
    queued: AtomicBool,
    cycle_guard: Mutex<()>,
}

impl<A: RemoteAuthority> SyncEngine<A> {
    /// Creates a new sync engine over a shared store.
    pub fn new(store: Arc<RecordStore>, authority: A, config: SyncConfig) -> Self {
        Self {
            store,
            authority: Arc::new(authority),
            config,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            last_cycle: RwLock::new(None),
            cancelled: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            cycle_guard: Mutex::new(()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the lifetime statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The result of the most recent cycle, kept for failed cycles too, so
    /// callers can see which records were acknowledged or rejected before an
    /// abort.
    pub fn last_cycle(&self) -> Option<CycleResult> {
        self.last_cycle.read().clone()
    }

    /// Cancels the ongoing cycle at the next record boundary. Record writes
    /// are atomic; cancellation never leaves a mixed per-record state.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs a sync cycle, or coalesces the request if one is in flight.
    ///
    /// Requests coalesced during a cycle run as one follow-up cycle after
    /// it, so two cycles never race to clear the same `pending_sync` flags.
    pub fn trigger_sync(&self) -> SyncResult<CycleOutcome> {
        loop {
            let Some(guard) = self.cycle_guard.try_lock() else {
                self.queued.store(true, Ordering::SeqCst);
                debug!("sync already in flight, request coalesced");
                return Ok(CycleOutcome::Coalesced);
            };

            self.reset_cancel();
            let result = loop {
                let result = self.run_cycle()?;
                if !self.queued.swap(false, Ordering::SeqCst) {
                    break result;
                }
                debug!("running coalesced sync request");
            };

            // A trigger racing the tail of the last cycle saw the guard still
            // held and queued itself; pick that request up instead of
            // dropping it.
            drop(guard);
            if !self.queued.swap(false, Ordering::SeqCst) {
                return Ok(CycleOutcome::Completed(result));
            }
        }
    }

    /// Triggers sync, retrying retryable failures per the retry config.
    pub fn sync_with_retry(&self) -> SyncResult<CycleOutcome> {
        let retry = self.config.retry.clone();
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_before(attempt));
                self.stats.write().retries += 1;
            }

            match self.trigger_sync() {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    if error.is_retryable() && attempt + 1 < retry.max_attempts {
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SyncError::network_fatal("no sync attempts made")))
    }

    fn run_cycle(&self) -> SyncResult<CycleResult> {
        let start = Instant::now();
        let mut result = CycleResult::default();

        self.set_state(SyncState::Pushing);
        if let Err(error) = self.push_phase(&mut result) {
            return Err(self.fail_cycle(error, &result, start));
        }

        if let Err(error) = self.pull_phase(&mut result) {
            return Err(self.fail_cycle(error, &result, start));
        }

        result.success = true;
        result.duration = start.elapsed();
        self.set_state(SyncState::Idle);
        *self.last_cycle.write() = Some(result.clone());

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.records_pushed += result.pushed;
            stats.records_pulled += result.pulled;
            stats.rejections += result.rejections.len() as u64;
            stats.conflicts_kept_local += result.conflicts_kept_local;
            stats.last_error = None;
        }

        info!(
            pushed = result.pushed,
            pulled = result.pulled,
            rejections = result.rejections.len(),
            "sync cycle complete"
        );
        Ok(result)
    }

    /// Records a failed cycle. Partial progress stays visible in the stats
    /// and in [`last_cycle`](Self::last_cycle), and acknowledged records keep
    /// their cleared flags; everything else is simply still pending.
    fn fail_cycle(
        &self,
        error: SyncError,
        partial: &CycleResult,
        start: Instant,
    ) -> SyncError {
        let partial = CycleResult {
            duration: start.elapsed(),
            success: false,
            ..partial.clone()
        };
        warn!(
            %error,
            pushed = partial.pushed,
            pulled = partial.pulled,
            duration = ?partial.duration,
            "sync cycle aborted"
        );
        self.set_state(SyncState::Error);
        {
            let mut stats = self.stats.write();
            stats.records_pushed += partial.pushed;
            stats.records_pulled += partial.pulled;
            stats.rejections += partial.rejections.len() as u64;
            stats.conflicts_kept_local += partial.conflicts_kept_local;
            stats.last_error = Some(error.to_string());
        }
        *self.last_cycle.write() = Some(partial);
        error
    }

    /// Submits every pending record, table by table. The at-rest form is
    /// already tokenized, so records go out without touching plaintext.
    fn push_phase(&self, result: &mut CycleResult) -> SyncResult<()> {
        let pending = self.store.pending_all()?;
        debug!(count = pending.len(), "pushing pending records");

        for (kind, record) in pending {
            self.check_cancelled()?;

            let snapshot = record.updated_at;
            let wire = RemoteRecord::from(&record);
            match self.authority.push(kind, &wire)? {
                PushOutcome::Accepted { version } => {
                    // The guard leaves the flag pending if a newer local
                    // mutation landed while the push was in flight.
                    if self
                        .store
                        .mark_synced(kind, record.id, snapshot, Some(version))?
                    {
                        result.pushed += 1;
                    }
                }
                PushOutcome::Rejected { reason } => {
                    warn!(kind = %kind, id = %record.id, %reason, "push rejected");
                    result.rejections.push(RejectedPush {
                        kind,
                        id: record.id,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Pulls and reconciles remote changes per table, paging through the
    /// authority's change cursor.
    fn pull_phase(&self, result: &mut CycleResult) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            loop {
                self.check_cancelled()?;
                self.set_state(SyncState::Pulling);
                let cursor = self.store.cursor(kind)?;
                let batch = self.authority.pull(kind, cursor)?;

                self.set_state(SyncState::Reconciling);
                for change in &batch.changes {
                    self.check_cancelled()?;
                    self.apply_change(kind, change, result)?;
                }
                self.store.set_cursor(kind, batch.new_cursor)?;

                if !batch.has_more {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Applies one pulled change by id, so re-applying it is a no-op.
    ///
    /// The store apply is guarded by the `updated_at` snapshot the conflict
    /// was resolved against; a local write racing the reconcile makes the
    /// guard miss and the change is resolved afresh rather than clobbering
    /// the newer, still-pending local state.
    fn apply_change(
        &self,
        kind: EntityKind,
        change: &RemoteRecord,
        result: &mut CycleResult,
    ) -> SyncResult<()> {
        loop {
            match self.store.get_raw(kind, change.id)? {
                None => {
                    if self
                        .store
                        .write_remote(kind, &change.clone().into_record(), None)?
                    {
                        result.pulled += 1;
                        return Ok(());
                    }
                    // The id appeared locally mid-apply; resolve against it.
                }
                // A revision we already hold acknowledged is our own push
                // coming back through the change feed; nothing to apply.
                Some(local) if local.version.is_some() && local.version == change.version => {
                    return Ok(());
                }
                Some(local) => match conflict::resolve(&local, change) {
                    Resolution::AcceptRemote => {
                        if self.store.write_remote(
                            kind,
                            &change.clone().into_record(),
                            Some(local.updated_at),
                        )? {
                            result.pulled += 1;
                            return Ok(());
                        }
                        debug!(kind = %kind, id = %change.id, "local write raced the apply, resolving again");
                    }
                    Resolution::KeepLocal => {
                        debug!(kind = %kind, id = %change.id, "kept local state over remote change");
                        result.conflicts_kept_local += 1;
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryAuthority, PullBatch};
    use coffer_core::FieldCodec;
    use std::sync::mpsc;

    fn engine() -> SyncEngine<MemoryAuthority> {
        let store = Arc::new(RecordStore::open_in_memory(FieldCodec::passthrough()).unwrap());
        SyncEngine::new(store, MemoryAuthority::new(), SyncConfig::new())
    }

    /// Wraps a [`MemoryAuthority`] so one push or pull blocks until the test
    /// releases it, holding a cycle mid-flight deterministically.
    struct GatedAuthority {
        inner: MemoryAuthority,
        gate_push: bool,
        armed: AtomicBool,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl GatedAuthority {
        fn new(gate_push: bool) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let authority = Self {
                inner: MemoryAuthority::new(),
                gate_push,
                armed: AtomicBool::new(true),
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            };
            (authority, entered_rx, release_tx)
        }

        fn hold_once(&self) {
            if self.armed.swap(false, Ordering::SeqCst) {
                let _ = self.entered.lock().send(());
                let _ = self.release.lock().recv();
            }
        }
    }

    impl RemoteAuthority for GatedAuthority {
        fn push(&self, kind: EntityKind, record: &RemoteRecord) -> SyncResult<PushOutcome> {
            if self.gate_push {
                self.hold_once();
            }
            self.inner.push(kind, record)
        }

        fn pull(&self, kind: EntityKind, cursor: u64) -> SyncResult<PullBatch> {
            if !self.gate_push {
                self.hold_once();
            }
            self.inner.pull(kind, cursor)
        }
    }

    #[test]
    fn initial_state_is_idle() {
        let engine = engine();
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(engine.stats().cycles_completed, 0);
    }

    #[test]
    fn empty_cycle_succeeds() {
        let engine = engine();
        let outcome = engine.trigger_sync().unwrap();
        let CycleOutcome::Completed(result) = outcome else {
            panic!("expected completed cycle");
        };
        assert!(result.success);
        assert_eq!(result.pushed, 0);
        assert_eq!(result.pulled, 0);
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[test]
    fn cancel_mid_cycle_stops_between_records_and_recovers() {
        let store = Arc::new(RecordStore::open_in_memory(FieldCodec::passthrough()).unwrap());
        for _ in 0..3 {
            store
                .create(EntityKind::Category, Default::default())
                .unwrap();
        }
        let (authority, entered, release) = GatedAuthority::new(true);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            authority,
            SyncConfig::new(),
        ));

        let runner = std::thread::spawn({
            let engine = Arc::clone(&engine);
            move || engine.trigger_sync()
        });

        // Cancel while the first push is in flight; the cycle must stop at
        // the next record boundary.
        entered.recv().unwrap();
        engine.cancel();
        release.send(()).unwrap();

        let err = runner.join().unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(engine.state(), SyncState::Error);

        // The in-flight record was acknowledged and cleared; the records the
        // cycle never reached are untouched and still pending.
        assert_eq!(store.pending_count().unwrap(), 2);

        let outcome = engine.trigger_sync().unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(r) if r.pushed == 2));
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn concurrent_trigger_coalesces_into_follow_up_cycle() {
        let store = Arc::new(RecordStore::open_in_memory(FieldCodec::passthrough()).unwrap());
        let (authority, entered, release) = GatedAuthority::new(false);
        let engine = Arc::new(SyncEngine::new(store, authority, SyncConfig::new()));

        let runner = std::thread::spawn({
            let engine = Arc::clone(&engine);
            move || engine.trigger_sync()
        });

        // The first cycle is held mid-pull; a second trigger must coalesce,
        // and the running call must pick it up before returning.
        entered.recv().unwrap();
        assert!(matches!(
            engine.trigger_sync().unwrap(),
            CycleOutcome::Coalesced
        ));
        release.send(()).unwrap();

        let outcome = runner.join().unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(r) if r.success));
        assert_eq!(engine.stats().cycles_completed, 2);
    }

    #[test]
    fn failed_cycle_records_error_and_allows_restart() {
        let engine = engine();
        let authority = engine.authority.as_ref().clone();
        engine
            .store
            .create(EntityKind::Category, Default::default())
            .unwrap();

        authority.set_online(false);
        let err = engine.trigger_sync().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.state(), SyncState::Error);
        assert!(engine.stats().last_error.is_some());
        assert_eq!(engine.store.pending_count().unwrap(), 1);

        authority.set_online(true);
        let outcome = engine.trigger_sync().unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(r) if r.pushed == 1));
        assert_eq!(engine.state(), SyncState::Idle);
        assert!(engine.stats().last_error.is_none());
    }

    #[test]
    fn sync_with_retry_recovers_after_transient_failure() {
        let engine = {
            let store =
                Arc::new(RecordStore::open_in_memory(FieldCodec::passthrough()).unwrap());
            let config = SyncConfig::new().with_retry(
                crate::config::RetryConfig::new(3).with_base_delay(Duration::from_millis(1)),
            );
            SyncEngine::new(store, MemoryAuthority::new(), config)
        };
        let authority = engine.authority.as_ref().clone();
        let record = engine
            .store
            .create(EntityKind::Category, Default::default())
            .unwrap();

        // First push applies but loses its ack and drops the connection;
        // bring it back for the retry.
        authority.lose_ack_at(1);
        std::thread::spawn({
            let authority = authority.clone();
            move || {
                std::thread::sleep(Duration::from_millis(2));
                authority.set_online(true);
            }
        });

        let outcome = engine.sync_with_retry().unwrap();
        let CycleOutcome::Completed(result) = outcome else {
            panic!("expected completed cycle");
        };
        assert!(result.success);
        assert!(engine.stats().retries >= 1);
        // The retry re-push was idempotent server-side.
        assert_eq!(authority.change_count(), 1);
        assert_eq!(engine.store.pending_count().unwrap(), 0);
        let _ = record;
    }
}
