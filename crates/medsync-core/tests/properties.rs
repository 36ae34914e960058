//! Property-based tests for the merge rule
//!
//! These tests verify the guarantees sync relies on:
//!  - Idempotence: merging the same remote copy twice changes nothing
//!  - Last-writer-wins: the strictly later `updated_at` wins
//!  - Ties favor the local copy

use chrono::{TimeZone, Utc};
use medsync_core::lww::{self, Resolution};
use medsync_core::{Envelope, EntityId, EntityKind, Record, Timestamp};
use proptest::prelude::*;

fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (1_600_000_000i64..1_800_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn record_envelope_strategy() -> impl Strategy<Value = Envelope> {
    ("[a-z]{1,8}", timestamp_strategy(), any::<bool>()).prop_map(|(title, at, deleted)| {
        if deleted {
            return Envelope::tombstone(EntityKind::Record, EntityId::from("r1"), at);
        }
        let record = Record {
            id: EntityId::from("r1"),
            user_id: EntityId::from("u1"),
            title,
            record_type: "note".to_string(),
            date: at.date_naive(),
            notes: String::new(),
            file_id: None,
            created_at: at,
            updated_at: at,
        };
        Envelope::from_entity(&record).unwrap()
    })
}

proptest! {
    #[test]
    fn merge_is_idempotent(local in record_envelope_strategy(), remote in record_envelope_strategy()) {
        let once = lww::merge(Some(&local), &remote).clone();
        let twice = lww::merge(Some(&once), &remote).clone();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn strictly_later_write_wins(local in record_envelope_strategy(), remote in record_envelope_strategy()) {
        let merged = lww::merge(Some(&local), &remote);
        if remote.updated_at > local.updated_at {
            prop_assert_eq!(merged, &remote);
        } else {
            prop_assert_eq!(merged, &local);
        }
    }

    #[test]
    fn missing_local_always_takes_remote(remote in timestamp_strategy()) {
        prop_assert_eq!(lww::resolve(None, remote), Resolution::TakeRemote);
    }

    #[test]
    fn equal_timestamps_keep_local(at in timestamp_strategy()) {
        prop_assert_eq!(lww::resolve(Some(at), at), Resolution::KeepLocal);
        prop_assert!(lww::accepts(Some(at), at));
    }

    #[test]
    fn document_form_preserves_merge_inputs(env in record_envelope_strategy()) {
        let back = Envelope::from_document(env.kind, env.id.as_str(), &env.to_document()).unwrap();
        prop_assert_eq!(back.updated_at, env.updated_at);
        prop_assert_eq!(back.deleted, env.deleted);
    }
}

#[test]
fn concrete_lab_update_scenario() {
    let older = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let newer = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

    assert_eq!(lww::resolve(Some(older), newer), Resolution::TakeRemote);
    assert_eq!(lww::resolve(Some(newer), older), Resolution::KeepLocal);
}
