//! PgStore tests against a live PostgreSQL.
//!
//! Run with `--features db-tests` and `RFIDGATE_DB_*` pointing at a
//! scratch database.

#![cfg(feature = "db-tests")]

use chrono::Utc;
use rfidgate_api::{ApiResult, DbConfig, PgStore};
use rfidgate_core::{
    payload_hash, BatchState, EdgeEvent, RfidError, SavedTagOrder, StorageError, TagNote,
    TagStatus, TagUpdate,
};
use rfidgate_storage::{constraints, RecordStore, SavedTagDelta};
use rfidgate_test_utils::fixtures;
use serde_json::json;

async fn test_store() -> ApiResult<PgStore> {
    let store = PgStore::from_config(&DbConfig::from_env())?;
    store.ensure_schema().await?;
    Ok(store)
}

/// Hex suffix unique to this test run.
fn unique(prefix: &str) -> String {
    format!("{}{:X}", prefix, Utc::now().timestamp_micros())
}

fn edge_event(event_id: &str, device: &str, seq: i64) -> EdgeEvent {
    let payload = json!({ "seq": seq });
    EdgeEvent {
        event_id: event_id.to_string(),
        device_id: device.to_string(),
        batch_id: Some("B1".to_string()),
        seq: Some(seq),
        event_type: "batch_start".to_string(),
        payload_hash: payload_hash(&payload),
        payload,
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_ping_and_schema_is_idempotent() -> ApiResult<()> {
    let store = test_store().await?;
    store.ensure_schema().await?;
    store.ping().await?;
    assert!(store.pool_size() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_edge_event_append_constraints() -> ApiResult<()> {
    let store = test_store().await?;
    let device = unique("dev-");
    let state = BatchState::new(&device);
    let first = edge_event(&unique("evt-a-"), &device, 1);
    assert!(store.edge_event_append(&first, &state, 0).await?);

    match store.edge_event_append(&first, &state, 1).await {
        Err(RfidError::Storage(StorageError::DuplicateKey { constraint, .. })) => {
            assert_eq!(constraint, constraints::EVENT_ID);
        }
        other => panic!("expected duplicate event_id, got {:?}", other),
    }

    let same_position = edge_event(&unique("evt-b-"), &device, 1);
    match store.edge_event_append(&same_position, &state, 1).await {
        Err(RfidError::Storage(StorageError::DuplicateKey { constraint, .. })) => {
            assert_eq!(constraint, constraints::EVENT_POSITION);
        }
        other => panic!("expected duplicate position, got {:?}", other),
    }

    let stored = store.batch_state_get(&device).await?.expect("state stored");
    assert_eq!(stored.version, 1);
    Ok(())
}

#[tokio::test]
async fn test_edge_event_append_rolls_back_on_stale_version() -> ApiResult<()> {
    let store = test_store().await?;
    let device = unique("dev-");
    let state = BatchState::new(&device);
    assert!(store
        .edge_event_append(&edge_event(&unique("evt-a-"), &device, 1), &state, 0)
        .await?);

    let late = edge_event(&unique("evt-b-"), &device, 2);
    assert!(!store.edge_event_append(&late, &state, 0).await?);
    assert!(store.edge_event_get(&late.event_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_tag_round_trip_and_update() -> ApiResult<()> {
    let store = test_store().await?;
    let epc = unique("5A42");
    store.tag_insert(&fixtures::printed_tag(&epc, 2)).await?;

    let tag = store.tag_get(&epc).await?.expect("tag stored");
    assert_eq!(tag.status, TagStatus::Printed);
    assert_eq!(tag.consume_antenna_id, 2);

    store
        .tag_update(
            &epc,
            TagUpdate {
                status: Some(TagStatus::Error),
                last_error: Some(Some("printer jam".to_string())),
                ..Default::default()
            },
            Utc::now(),
        )
        .await?;
    let tag = store.tag_get(&epc).await?.expect("tag stored");
    assert_eq!(tag.status, TagStatus::Error);
    assert_eq!(tag.last_error.as_deref(), Some("printer jam"));
    Ok(())
}

#[tokio::test]
async fn test_saved_tags_accumulate() -> ApiResult<()> {
    let store = test_store().await?;
    let epc = unique("5A43");
    let delta = [SavedTagDelta {
        epc: epc.clone(),
        reads: 3,
    }];
    store.saved_tags_upsert(&delta, fixtures::DEVICE, Utc::now()).await?;
    store.saved_tags_upsert(&delta, fixtures::DEVICE, Utc::now()).await?;

    let saved = store
        .saved_tags_list(Some(Utc::now().date_naive()), SavedTagOrder::Last, 10_000)
        .await?;
    let row = saved.iter().find(|t| t.epc == epc).expect("saved row");
    assert_eq!(row.reads, 6);
    Ok(())
}

#[tokio::test]
async fn test_tag_note_upsert_keeps_device() -> ApiResult<()> {
    let store = test_store().await?;
    let epc = unique("5A44");
    let mut note = TagNote {
        epc: epc.clone(),
        note: "dented".to_string(),
        device: fixtures::DEVICE.to_string(),
        updated_at: Utc::now(),
    };
    store.tag_note_upsert(&note).await?;
    note.note = "dented, ok".to_string();
    note.device = String::new();
    let written = store.tag_note_upsert(&note).await?;
    assert_eq!(written.device, fixtures::DEVICE);

    let found = store.tag_notes_list(&[epc.clone()], 10).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].note, "dented, ok");

    assert!(store.tag_note_delete(&epc).await?);
    assert!(store.tag_notes_list(&[epc], 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_antenna_rule_upsert_and_delete() -> ApiResult<()> {
    let store = test_store().await?;
    let device = unique("dock-");
    store
        .antenna_rule_upsert(&fixtures::rule(&device, 3, true))
        .await?;
    store
        .antenna_rule_upsert(&fixtures::rule(&device, 3, false))
        .await?;

    let rules = store.antenna_rule_list().await?;
    let mine: Vec<_> = rules.iter().filter(|r| r.device == device).collect();
    assert_eq!(mine.len(), 1);
    assert!(!mine[0].submit_stock);

    assert!(store.antenna_rule_delete(&device, 3).await?);
    assert!(!store.antenna_rule_delete(&device, 3).await?);
    Ok(())
}
