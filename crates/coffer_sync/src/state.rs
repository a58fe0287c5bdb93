//! The sync state machine and cycle statistics.
//!
//! The state is owned by the engine instance and queried via its public
//! contract; there is no ambient global "is syncing" flag, so independent
//! engines (one per user session) stay deterministic and testable.

/// The current state of a sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Submitting pending local records to the remote authority.
    Pushing,
    /// Fetching remote changes since the last cursor.
    Pulling,
    /// Resolving pulled changes against local state.
    Reconciling,
    /// The last cycle failed; flags are untouched and a new cycle may start.
    Error,
}

impl SyncState {
    /// Returns true while a cycle is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pushing | SyncState::Pulling | SyncState::Reconciling
        )
    }

    /// Returns true if a new cycle can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Error)
    }
}

/// Statistics across the lifetime of an engine.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed sync cycles.
    pub cycles_completed: u64,
    /// Records pushed and acknowledged.
    pub records_pushed: u64,
    /// Remote changes applied locally.
    pub records_pulled: u64,
    /// Pushes the authority rejected.
    pub rejections: u64,
    /// Pulled changes resolved in favor of local state.
    pub conflicts_kept_local: u64,
    /// Retry attempts made.
    pub retries: u64,
    /// Message of the last failed cycle, if any.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(!SyncState::Pushing.can_start_sync());
        assert!(!SyncState::Reconciling.can_start_sync());

        assert!(SyncState::Pushing.is_active());
        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Reconciling.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Error.is_active());
    }
}
