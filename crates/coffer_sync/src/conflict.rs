//! Conflict resolution between local records and pulled remote changes.
//!
//! The policy is deliberately small and deterministic:
//!
//! 1. A local soft-delete always takes precedence over a remote update; a
//!    user's intent to delete is never silently undone by a stale edit.
//! 2. Otherwise whole-record last-writer-wins on `updated_at`.
//! 3. An exact tie goes to the remote authority.
//!
//! Concurrent edits to disjoint fields fall under rule 2 as well: no
//! field-level merge is attempted, the newer whole record wins.

use coffer_core::Record;

use crate::remote::RemoteRecord;

/// The outcome of resolving one pulled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Write the remote state over the local record.
    AcceptRemote,
    /// Keep the local record; the pulled change is dropped.
    KeepLocal,
}

/// Resolves a pulled remote change against the local record with the same id.
pub fn resolve(local: &Record, remote: &RemoteRecord) -> Resolution {
    if local.deleted_at.is_some() && remote.deleted_at.is_none() {
        return Resolution::KeepLocal;
    }
    if local.updated_at > remote.updated_at {
        return Resolution::KeepLocal;
    }
    Resolution::AcceptRemote
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Map;
    use uuid::Uuid;

    fn local(pending: bool) -> Record {
        let mut record = Record::new(Uuid::new_v4(), Map::new());
        record.pending_sync = pending;
        record
    }

    fn remote_for(record: &Record, offset: Duration) -> RemoteRecord {
        RemoteRecord {
            id: record.id,
            fields: Map::new(),
            updated_at: record.updated_at + offset,
            deleted_at: None,
            version: Some(1),
        }
    }

    #[test]
    fn local_tombstone_beats_remote_update() {
        let mut record = local(false);
        record.deleted_at = Some(Utc::now());
        // Even a much newer remote edit loses to the tombstone.
        let remote = remote_for(&record, Duration::days(1));
        assert_eq!(resolve(&record, &remote), Resolution::KeepLocal);
    }

    #[test]
    fn remote_delete_is_applied() {
        let record = local(false);
        let mut remote = remote_for(&record, Duration::seconds(5));
        remote.deleted_at = Some(remote.updated_at);
        assert_eq!(resolve(&record, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn newer_local_edit_wins() {
        let record = local(true);
        let remote = remote_for(&record, Duration::seconds(-5));
        assert_eq!(resolve(&record, &remote), Resolution::KeepLocal);
    }

    #[test]
    fn newer_remote_edit_wins() {
        let record = local(true);
        let remote = remote_for(&record, Duration::seconds(5));
        assert_eq!(resolve(&record, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn tie_goes_to_the_authority() {
        let record = local(false);
        let remote = remote_for(&record, Duration::zero());
        assert_eq!(resolve(&record, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn tombstones_on_both_sides_accept_remote() {
        let mut record = local(false);
        record.deleted_at = Some(Utc::now());
        let mut remote = remote_for(&record, Duration::seconds(5));
        remote.deleted_at = Some(remote.updated_at);
        assert_eq!(resolve(&record, &remote), Resolution::AcceptRemote);
    }
}
