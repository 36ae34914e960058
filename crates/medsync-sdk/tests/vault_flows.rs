//! Integration tests for record operations across two devices.
//!
//! Tests cover:
//! - A record saved on one device appears on another after sync
//! - Deletes propagate as tombstones and are not resurrected by later pulls
//! - The same record created offline on two devices ends up stored once
//! - Sharing and the audit trail survive a sync round trip
//! - An offline edit or delete racing a later edit elsewhere converges on the later one

use chrono::{NaiveDate, Utc};
use std::time::Duration;
use medsync_sdk::{
    quick, AuditAction, ClientConfig, ClientConfigBuilder, EntityId, MemoryBackend, NewRecord,
    SharePermission, SyncConfigBuilder, User, UserRole,
};

fn config() -> ClientConfig {
    ClientConfigBuilder::new()
        .sync(SyncConfigBuilder::new().background_sync(false).build())
        .build()
}

fn user() -> User {
    User {
        id: EntityId::from("u1"),
        email: "pat@example.org".to_string(),
        display_name: "Pat".to_string(),
        role: UserRole::Patient,
        updated_at: Utc::now(),
    }
}

fn lab() -> NewRecord {
    NewRecord::new("Lipid panel", "lab_result", NaiveDate::from_ymd_opt(2024, 4, 2).unwrap())
        .notes("fasting")
}

async fn device(backend: &std::sync::Arc<MemoryBackend>) -> quick::MemorySetup {
    let setup = quick::memory_client_on(backend.clone(), config());
    setup.client.start().await.unwrap();
    setup.client.vault().login(user()).await.unwrap();
    setup
}

fn go_offline(setup: &quick::MemorySetup) {
    setup.host.set_online(false);
    setup.client.coordinator().handle_host_offline();
}

async fn go_online(setup: &quick::MemorySetup) {
    setup.host.set_online(true);
    assert!(setup.client.coordinator().test_connection().await);
}

#[tokio::test]
async fn test_record_reaches_second_device() {
    let backend = MemoryBackend::new();
    let phone = device(&backend).await;
    let laptop = device(&backend).await;

    let saved = phone.client.vault().save_record(lab()).await.unwrap();
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();

    let seen = laptop.client.vault().list_records(None).unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, saved.id);
    assert_eq!(seen[0].notes, "fasting");
    assert_eq!(laptop.client.vault().get_record(&saved.id).await.unwrap().title, "Lipid panel");
}

#[tokio::test]
async fn test_delete_propagates_as_tombstone() {
    let backend = MemoryBackend::new();
    let phone = device(&backend).await;
    let laptop = device(&backend).await;

    let saved = phone.client.vault().save_record(lab()).await.unwrap();
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();
    assert_eq!(laptop.client.vault().list_records(None).unwrap().len(), 1);

    phone.client.vault().delete_record(&saved.id).await.unwrap();
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();
    assert!(laptop.client.vault().list_records(None).unwrap().is_empty());

    // pulling again on the phone keeps it deleted
    phone.client.sync_now().await.unwrap();
    assert!(phone.client.vault().list_records(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_duplicate_is_stored_once() {
    let backend = MemoryBackend::new();
    let phone = device(&backend).await;
    let original = phone.client.vault().save_record(lab()).await.unwrap();
    phone.client.sync_now().await.unwrap();

    // never started, so it works offline
    let laptop = quick::memory_client_on(backend.clone(), config());
    laptop.client.vault().login(user()).await.unwrap();
    let offline_copy = laptop.client.vault().save_record(lab()).await.unwrap();
    assert_ne!(offline_copy.id, original.id);

    laptop.client.start().await.unwrap();
    let report = laptop.client.sync_now().await.unwrap();

    assert_eq!(report.flush.duplicates, 1);
    assert_eq!(backend.documents("records").len(), 1);
    let kept = laptop.client.vault().list_records(None).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].id, original.id);
    assert_eq!(laptop.notifier.count_titled("Duplicate skipped"), 1);
}

#[tokio::test]
async fn test_shares_and_audit_round_trip() {
    let backend = MemoryBackend::new();
    let phone = device(&backend).await;
    let laptop = device(&backend).await;

    let saved = phone.client.vault().save_record(lab()).await.unwrap();
    phone
        .client
        .vault()
        .share_record(&saved.id, "dr.lee@clinic.org", SharePermission::Read, None)
        .await
        .unwrap();
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();

    let grants = laptop.client.vault().shares_for_record(&saved.id).unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].grantee_email, "dr.lee@clinic.org");

    let actions: Vec<_> = laptop
        .client
        .vault()
        .audit_trail(100)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&AuditAction::RecordCreated));
    assert!(actions.contains(&AuditAction::RecordShared));
}

#[tokio::test]
async fn test_offline_edit_loses_to_later_edit_elsewhere() {
    let backend = MemoryBackend::new();
    let phone = device(&backend).await;
    let laptop = device(&backend).await;
    let saved = phone.client.vault().save_record(lab()).await.unwrap();
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();

    go_offline(&phone);
    let mut older = phone.client.vault().get_record(&saved.id).await.unwrap();
    older.title = "Phone edit (older)".to_string();
    phone.client.vault().update_record(older).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut newer = laptop.client.vault().get_record(&saved.id).await.unwrap();
    newer.title = "Laptop edit (newer)".to_string();
    let newer = laptop.client.vault().update_record(newer).await.unwrap();
    laptop.client.sync_now().await.unwrap();

    go_online(&phone).await;
    let report = phone.client.sync_now().await.unwrap();
    assert_eq!(report.flush.superseded, 1);
    laptop.client.sync_now().await.unwrap();

    let on_phone = phone.client.vault().get_record(&saved.id).await.unwrap();
    let on_laptop = laptop.client.vault().get_record(&saved.id).await.unwrap();
    assert_eq!(on_phone, on_laptop);
    assert_eq!(on_phone.title, "Laptop edit (newer)");
    assert_eq!(on_phone.updated_at, newer.updated_at);
    let remote = backend.document("records", saved.id.as_str()).unwrap();
    assert_eq!(remote.data["title"], "Laptop edit (newer)");
    assert!(phone.client.cache().pending().is_empty().unwrap());
}

#[tokio::test]
async fn test_offline_delete_loses_to_later_edit_elsewhere() {
    let backend = MemoryBackend::new();
    let phone = device(&backend).await;
    let laptop = device(&backend).await;
    let saved = phone.client.vault().save_record(lab()).await.unwrap();
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();

    go_offline(&phone);
    phone.client.vault().delete_record(&saved.id).await.unwrap();
    assert!(phone.client.vault().list_records(None).unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut edited = laptop.client.vault().get_record(&saved.id).await.unwrap();
    edited.notes = "reviewed with doctor".to_string();
    let edited = laptop.client.vault().update_record(edited).await.unwrap();
    laptop.client.sync_now().await.unwrap();

    go_online(&phone).await;
    phone.client.sync_now().await.unwrap();
    laptop.client.sync_now().await.unwrap();

    for setup in [&phone, &laptop] {
        let records = setup.client.vault().list_records(None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].notes, "reviewed with doctor");
        assert_eq!(records[0].updated_at, edited.updated_at);
    }
    let remote = backend.document("records", saved.id.as_str()).unwrap();
    assert_eq!(remote.data["deleted"], false);
}
