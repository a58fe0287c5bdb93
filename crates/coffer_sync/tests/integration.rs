//! End-to-end sync scenarios over an in-memory authority.

use std::sync::Arc;

use chrono::Duration;
use coffer_core::{EncryptionKey, EntityKind, FieldCodec, RecordStore};
use coffer_sync::{
    CycleOutcome, MemoryAuthority, RemoteRecord, SyncConfig, SyncEngine, SyncState,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn store_with_key(key: EncryptionKey) -> Arc<RecordStore> {
    init_tracing();
    Arc::new(RecordStore::open_in_memory(FieldCodec::with_key(key)).unwrap())
}

fn plain_store() -> Arc<RecordStore> {
    init_tracing();
    Arc::new(RecordStore::open_in_memory(FieldCodec::passthrough()).unwrap())
}

fn run(engine: &SyncEngine<MemoryAuthority>) -> coffer_sync::CycleResult {
    match engine.trigger_sync().unwrap() {
        CycleOutcome::Completed(result) => result,
        CycleOutcome::Coalesced => panic!("no cycle should be in flight"),
    }
}

#[test]
fn push_clears_pending_and_fields_travel_tokenized() {
    let store = store_with_key(EncryptionKey::generate());
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    let record = store
        .create(
            EntityKind::Transaction,
            fields(&[("description", json!("rent")), ("amount", json!(950))]),
        )
        .unwrap();

    let result = run(&engine);
    assert!(result.success);
    assert_eq!(result.pushed, 1);
    assert_eq!(store.pending_count().unwrap(), 0);

    // The authority only ever sees tokens for sensitive fields.
    let remote = authority.get(EntityKind::Transaction, record.id).unwrap();
    let description = remote.fields["description"].as_str().unwrap();
    assert!(description.starts_with("enc$"));
    let amount = remote.fields["amount"].as_str().unwrap();
    assert!(amount.starts_with("enc$"));

    // The acknowledged revision is recorded locally.
    let raw = store.get_raw(EntityKind::Transaction, record.id).unwrap().unwrap();
    assert_eq!(raw.version, remote.version);
}

#[test]
fn pull_applies_remote_changes_clean() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    let id = Uuid::new_v4();
    authority.seed(
        EntityKind::Category,
        RemoteRecord {
            id,
            fields: fields(&[("name", json!("Utilities"))]),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
            version: None,
        },
    );

    let result = run(&engine);
    assert_eq!(result.pulled, 1);

    let raw = store.get_raw(EntityKind::Category, id).unwrap().unwrap();
    assert_eq!(raw.fields["name"], json!("Utilities"));
    assert!(!raw.pending_sync);
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn pull_pages_through_large_change_sets() {
    let store = plain_store();
    let authority = MemoryAuthority::new().with_batch_limit(2);
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    for i in 0..5 {
        authority.seed(
            EntityKind::Category,
            RemoteRecord {
                id: Uuid::new_v4(),
                fields: fields(&[("name", json!(format!("cat-{i}")))]),
                updated_at: chrono::Utc::now(),
                deleted_at: None,
                version: None,
            },
        );
    }

    let result = run(&engine);
    assert_eq!(result.pulled, 5);
    assert_eq!(store.list(EntityKind::Category).unwrap().len(), 5);
}

#[test]
fn local_tombstone_survives_concurrent_remote_edit() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    let record = store
        .create(EntityKind::Group, fields(&[("name", json!("Trip"))]))
        .unwrap();
    run(&engine);
    store.soft_delete(EntityKind::Group, record.id).unwrap();
    run(&engine);

    // An edit from another device arrives after the delete, with a newer
    // timestamp.
    authority.seed(
        EntityKind::Group,
        RemoteRecord {
            id: record.id,
            fields: fields(&[("name", json!("Trip 2026"))]),
            updated_at: chrono::Utc::now() + Duration::seconds(30),
            deleted_at: None,
            version: None,
        },
    );

    let result = run(&engine);
    assert!(result.success);
    assert_eq!(result.conflicts_kept_local, 1);
    assert_eq!(result.pulled, 0);

    // Deletion intent wins regardless of timestamps.
    let raw = store.get_raw(EntityKind::Group, record.id).unwrap().unwrap();
    assert!(raw.is_deleted());
}

#[test]
fn newer_local_edit_prevails_over_older_remote_change() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    let record = store
        .create(EntityKind::Category, fields(&[("name", json!("Food"))]))
        .unwrap();
    run(&engine);

    // Local edit at T2; a remote change stamped just before it arrives in
    // the same cycle.
    store
        .mutate(
            EntityKind::Category,
            record.id,
            fields(&[("name", json!("Groceries"))]),
        )
        .unwrap();
    let t2 = store
        .get_raw(EntityKind::Category, record.id)
        .unwrap()
        .unwrap()
        .updated_at;
    authority.seed(
        EntityKind::Category,
        RemoteRecord {
            id: record.id,
            fields: fields(&[("name", json!("Dining"))]),
            updated_at: t2 - Duration::microseconds(1),
            deleted_at: None,
            version: None,
        },
    );

    let result = run(&engine);
    assert!(result.success);

    let raw = store.get_raw(EntityKind::Category, record.id).unwrap().unwrap();
    assert_eq!(raw.fields["name"], json!("Groceries"));
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn older_local_state_yields_to_newer_remote_change() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    let record = store
        .create(EntityKind::Category, fields(&[("name", json!("Food"))]))
        .unwrap();
    run(&engine);

    authority.seed(
        EntityKind::Category,
        RemoteRecord {
            id: record.id,
            fields: fields(&[("name", json!("Dining"))]),
            updated_at: chrono::Utc::now() + Duration::seconds(30),
            deleted_at: None,
            version: None,
        },
    );

    let result = run(&engine);
    assert_eq!(result.pulled, 1);
    let raw = store.get_raw(EntityKind::Category, record.id).unwrap().unwrap();
    assert_eq!(raw.fields["name"], json!("Dining"));
}

#[test]
fn unacknowledged_push_stays_pending_and_recovers() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    for i in 0..3 {
        store
            .create(EntityKind::Context, fields(&[("name", json!(format!("ctx-{i}")))]))
            .unwrap();
    }

    // The second push applies server-side but its acknowledgement is lost
    // and the connection drops.
    authority.lose_ack_at(2);
    let err = engine.trigger_sync().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(engine.state(), SyncState::Error);

    // One acknowledged record is clean; the unacknowledged one and the
    // never-attempted one are still pending.
    assert_eq!(store.pending_count().unwrap(), 2);
    assert_eq!(authority.change_count(), 2);

    // The aborted cycle still reports its partial progress.
    let partial = engine.last_cycle().unwrap();
    assert!(!partial.success);
    assert_eq!(partial.pushed, 1);
    assert!(partial.rejections.is_empty());

    authority.set_online(true);
    let result = run(&engine);
    assert!(result.success);
    assert_eq!(store.pending_count().unwrap(), 0);
    // Re-pushing the already-applied state created no duplicate change.
    assert_eq!(authority.change_count(), 3);
}

#[test]
fn rejected_push_is_not_fatal() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    let bad = store
        .create(EntityKind::Budget, fields(&[("amount", json!(-1))]))
        .unwrap();
    let good = store
        .create(EntityKind::Budget, fields(&[("amount", json!(100))]))
        .unwrap();
    authority.reject(bad.id, "amount must be positive");

    let result = run(&engine);
    assert!(result.success);
    assert_eq!(result.rejections.len(), 1);
    assert_eq!(result.rejections[0].id, bad.id);
    assert_eq!(result.rejections[0].reason, "amount must be positive");

    // The rejected record stays pending; the rest of the cycle went through.
    assert_eq!(store.pending_count().unwrap(), 1);
    assert!(authority.get(EntityKind::Budget, good.id).is_some());
    assert!(authority.get(EntityKind::Budget, bad.id).is_none());
}

#[test]
fn repeated_sync_is_a_no_op() {
    let store = plain_store();
    let authority = MemoryAuthority::new();
    let engine = SyncEngine::new(store.clone(), authority.clone(), SyncConfig::new());

    store
        .create(EntityKind::Transaction, fields(&[("amount", json!(20))]))
        .unwrap();
    run(&engine);

    let again = run(&engine);
    assert!(again.success);
    assert_eq!(again.pushed, 0);
    assert_eq!(again.pulled, 0);
    assert!(again.rejections.is_empty());
    assert_eq!(engine.stats().cycles_completed, 2);
}

#[test]
fn two_devices_converge_and_decrypt_with_a_shared_key() {
    let key = EncryptionKey::generate();
    let authority = MemoryAuthority::new();

    let device_a = store_with_key(key.clone());
    let engine_a = SyncEngine::new(device_a.clone(), authority.clone(), SyncConfig::new());
    let device_b = store_with_key(key);
    let engine_b = SyncEngine::new(device_b.clone(), authority.clone(), SyncConfig::new());

    let record = device_a
        .create(
            EntityKind::Transaction,
            fields(&[("description", json!("salary")), ("amount", json!(3000))]),
        )
        .unwrap();

    run(&engine_a);
    let result = run(&engine_b);
    assert_eq!(result.pulled, 1);

    let decoded = device_b
        .get(EntityKind::Transaction, record.id)
        .unwrap()
        .unwrap();
    assert!(decoded.failures.is_empty());
    assert_eq!(decoded.record.fields["description"], json!("salary"));
    assert_eq!(decoded.record.fields["amount"], json!(3000));
    assert!(!decoded.record.pending_sync);

    // A third cycle on either side moves nothing.
    let settle = run(&engine_a);
    assert_eq!(settle.pushed, 0);
    assert_eq!(settle.pulled, 0);
}

#[test]
fn deletion_propagates_between_devices() {
    let authority = MemoryAuthority::new();
    let device_a = plain_store();
    let engine_a = SyncEngine::new(device_a.clone(), authority.clone(), SyncConfig::new());
    let device_b = plain_store();
    let engine_b = SyncEngine::new(device_b.clone(), authority.clone(), SyncConfig::new());

    let record = device_a
        .create(EntityKind::RecurringRule, fields(&[("amount", json!(9.99))]))
        .unwrap();
    run(&engine_a);
    run(&engine_b);
    assert!(device_b
        .get_raw(EntityKind::RecurringRule, record.id)
        .unwrap()
        .is_some());

    device_a.soft_delete(EntityKind::RecurringRule, record.id).unwrap();
    run(&engine_a);
    run(&engine_b);

    let raw = device_b
        .get_raw(EntityKind::RecurringRule, record.id)
        .unwrap()
        .unwrap();
    assert!(raw.is_deleted());
    assert!(device_b.list(EntityKind::RecurringRule).unwrap().is_empty());
}
