use sync_types::{DatasourceConfig, DocId, SourceType, SyncStatus};
use tempfile::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::configs::StatusUpdate;
use crate::{CommitApply, SyncStore, SyncStoreOptions, TargetOutcomes};

fn store() -> (SyncStore, TempDir) {
    let tempdir = TempDir::new().unwrap();
    let store = SyncStore::open(SyncStoreOptions {
        path: tempdir.path(),
        map_size: 10 * 1024 * 1024,
    })
    .unwrap();
    (store, tempdir)
}

fn config() -> DatasourceConfig {
    DatasourceConfig::new(
        "default".into(),
        SourceType::Filesystem,
        "docs".into(),
        serde_json::json!({ "paths": ["/data"] }),
    )
}

fn commit(store: &SyncStore, config_id: Uuid, path: &str, hash: &str) -> DocId {
    let doc_id = DocId::new(config_id, path);
    let ordinal = store.allocate_ordinal(config_id).unwrap();
    store
        .commit_apply(CommitApply {
            doc_id: doc_id.clone(),
            config_id,
            source_path: path.into(),
            source_id: None,
            ordinal,
            content_hash: hash.into(),
            modified_timestamp: None,
            targets: TargetOutcomes {
                vector: Some(true),
                search: Some(true),
                graph: Some(true),
            },
        })
        .unwrap();
    doc_id
}

#[test]
fn reopening_keeps_configs() {
    let tempdir = TempDir::new().unwrap();
    let config = config();
    {
        let store = SyncStore::open(SyncStoreOptions {
            path: tempdir.path(),
            map_size: 10 * 1024 * 1024,
        })
        .unwrap();
        store.upsert_config(&config).unwrap();
    }
    let store = SyncStore::open(SyncStoreOptions {
        path: tempdir.path(),
        map_size: 10 * 1024 * 1024,
    })
    .unwrap();
    let found = store.get_config(config.config_id).unwrap();
    assert_eq!(found.source_name, "docs");
}

#[test]
fn active_listing_tracks_the_is_active_flag() {
    let (store, _tempdir) = store();
    let mut config = config();
    store.upsert_config(&config).unwrap();
    assert_eq!(store.list_active_configs().unwrap().len(), 1);

    config.is_active = false;
    store.upsert_config(&config).unwrap();
    assert!(store.list_active_configs().unwrap().is_empty());
    // still present, just not active
    assert_eq!(store.list_configs().unwrap().len(), 1);
}

#[test]
fn refresh_interval_of_zero_is_rejected() {
    let (store, _tempdir) = store();
    let mut config = config();
    config.refresh_interval_seconds = 0;
    let err = store.upsert_config(&config).unwrap_err();
    insta::assert_snapshot!(err, @"Invalid refresh interval `0`: must be at least one second.");
}

#[test]
fn ordinals_are_strictly_increasing_per_config() {
    let (store, _tempdir) = store();
    let config_a = Uuid::new_v4();
    let config_b = Uuid::new_v4();
    let mut previous = 0;
    for _ in 0..100 {
        let ordinal = store.allocate_ordinal(config_a).unwrap();
        assert!(ordinal > previous);
        previous = ordinal;
    }
    // another config allocates independently
    let other = store.allocate_ordinal(config_b).unwrap();
    assert!(other > 0);
}

#[test]
fn status_update_never_decreases_the_high_water_mark() {
    let (store, _tempdir) = store();
    let config = config();
    store.upsert_config(&config).unwrap();

    store
        .update_config_status(
            config.config_id,
            StatusUpdate { ordinal: Some(500), ..Default::default() },
        )
        .unwrap();
    store
        .update_config_status(
            config.config_id,
            StatusUpdate { ordinal: Some(100), ..Default::default() },
        )
        .unwrap();
    assert_eq!(store.get_config(config.config_id).unwrap().last_sync_ordinal, Some(500));
}

#[test]
fn status_update_can_clear_an_error() {
    let (store, _tempdir) = store();
    let config = config();
    store.upsert_config(&config).unwrap();

    store
        .update_config_status(
            config.config_id,
            StatusUpdate {
                status: Some(SyncStatus::Idle),
                error: Some(Some("vector write failed".into())),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        store.get_config(config.config_id).unwrap().last_error.as_deref(),
        Some("vector write failed")
    );

    store
        .update_config_status(
            config.config_id,
            StatusUpdate { error: Some(None), ..Default::default() },
        )
        .unwrap();
    assert_eq!(store.get_config(config.config_id).unwrap().last_error, None);
}

#[test]
fn commit_apply_inserts_then_merges_target_timestamps() {
    let (store, _tempdir) = store();
    let config_id = Uuid::new_v4();
    let doc_id = DocId::new(config_id, "/data/a.txt");

    // first apply: vector failed
    let ordinal = store.allocate_ordinal(config_id).unwrap();
    store
        .commit_apply(CommitApply {
            doc_id: doc_id.clone(),
            config_id,
            source_path: "/data/a.txt".into(),
            source_id: Some("id-1".into()),
            ordinal,
            content_hash: "aa".into(),
            modified_timestamp: Some(OffsetDateTime::now_utc()),
            targets: TargetOutcomes {
                vector: Some(false),
                search: Some(true),
                graph: Some(true),
            },
        })
        .unwrap();

    let state = store.get_document_state(config_id, &doc_id).unwrap().unwrap();
    assert!(state.vector_synced_at.is_none());
    let search_synced_at = state.search_synced_at.unwrap();
    assert!(state.graph_synced_at.is_some());

    // resume: only the vector target is written, the others keep their
    // original timestamps
    let ordinal = store.allocate_ordinal(config_id).unwrap();
    store
        .commit_apply(CommitApply {
            doc_id: doc_id.clone(),
            config_id,
            source_path: "/data/a.txt".into(),
            source_id: Some("id-1".into()),
            ordinal,
            content_hash: "aa".into(),
            modified_timestamp: None,
            targets: TargetOutcomes { vector: Some(true), search: None, graph: None },
        })
        .unwrap();

    let state = store.get_document_state(config_id, &doc_id).unwrap().unwrap();
    assert!(state.vector_synced_at.is_some());
    assert_eq!(state.search_synced_at.unwrap(), search_synced_at);
    assert_eq!(state.ordinal, ordinal);
    assert_eq!(
        store.get_doc_id_by_source_id(config_id, "id-1").unwrap(),
        Some(doc_id.clone())
    );
}

#[test]
fn delete_is_terminal_and_recreate_gets_a_fresh_row() {
    let (store, _tempdir) = store();
    let config_id = Uuid::new_v4();
    let doc_id = commit(&store, config_id, "/data/a.txt", "aa");
    let first = store.get_document_state(config_id, &doc_id).unwrap().unwrap();

    store.commit_delete(&doc_id).unwrap();
    assert!(store.get_document_state(config_id, &doc_id).unwrap().is_none());
    // removing again is a no-op
    store.commit_delete(&doc_id).unwrap();

    let doc_id = commit(&store, config_id, "/data/a.txt", "bb");
    let second = store.get_document_state(config_id, &doc_id).unwrap().unwrap();
    assert!(second.ordinal > first.ordinal);
    assert_eq!(second.content_hash, "bb");
}

#[test]
fn document_states_scan_is_scoped_to_the_config() {
    let (store, _tempdir) = store();
    let config_a = Uuid::new_v4();
    let config_b = Uuid::new_v4();
    for i in 0..10 {
        commit(&store, config_a, &format!("/data/{i}.txt"), "aa");
    }
    commit(&store, config_b, "/other/file.txt", "bb");

    let rtxn = store.read_txn().unwrap();
    let states: Vec<_> =
        store.document_states(&rtxn, config_a).unwrap().collect::<crate::Result<_>>().unwrap();
    assert_eq!(states.len(), 10);
    assert!(states.iter().all(|state| state.config_id == config_a));
    assert_eq!(store.count_document_states(config_b).unwrap(), 1);
}

#[test]
fn purge_drops_rows_and_indexes_but_keeps_monotonicity() {
    let (store, _tempdir) = store();
    let config_id = Uuid::new_v4();
    for i in 0..5 {
        commit(&store, config_id, &format!("/data/{i}.txt"), "aa");
    }
    let before = store.last_allocated_ordinal(config_id).unwrap().unwrap();

    assert_eq!(store.purge_document_states(config_id).unwrap(), 5);
    assert_eq!(store.count_document_states(config_id).unwrap(), 0);
    let after = store.allocate_ordinal(config_id).unwrap();
    assert!(after > before);
}
