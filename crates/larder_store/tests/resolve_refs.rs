use larder_store::api::{CheckpointApi, EntityWriteApi, VersionReadApi};
use larder_store::{
    EntityContent, EntityDetail, EntityId, LarderConfig, LarderError, LarderStore, NewEntity,
    TaskFields,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

async fn open_store() -> (TempDir, LarderStore) {
    let dir = tempdir().expect("tempdir");
    let config = LarderConfig::default_sqlite(dir.path().join("catalog.sqlite").to_string_lossy());
    let store = LarderStore::connect(&config, dir.path())
        .await
        .expect("connect");
    (dir, store)
}

fn task(name: &str, step: &str) -> NewEntity {
    NewEntity {
        collection_id: None,
        content: task_content(name, step),
    }
}

fn task_content(name: &str, step: &str) -> EntityContent {
    EntityContent {
        name: name.to_string(),
        asset_origin: None,
        is_private: true,
        metadata: None,
        detail: EntityDetail::Task(TaskFields {
            workflow: json!({"steps": [step]}),
            version: Some("1.0.0".to_string()),
            description: None,
            has_file_uploads: false,
        }),
    }
}

/// create + two updates: three raw transactions.
async fn seeded_task(store: &LarderStore) -> larder_store::EntityRecord {
    let mut record = store.create_entity(task("resolver", "fetch")).await.expect("create");
    record.content = task_content("resolver", "train");
    store.update_entity(&record).await.expect("update one");
    record.content = task_content("resolver", "deploy");
    store.update_entity(&record).await.expect("update two");
    record
}

#[tokio::test]
async fn index_refs_cover_both_ends() {
    let (_dir, store) = open_store().await;
    let record = seeded_task(&store).await;

    let oldest = store.resolve_version(record.id, "~0").await.expect("~0");
    let newest = store.resolve_version(record.id, "~-1").await.expect("~-1");
    let newest_abs = store.resolve_version(record.id, "~2").await.expect("~2");

    assert_eq!(oldest.index, 0);
    assert_eq!(newest.index, 2);
    assert_eq!(newest.transaction_id, newest_abs.transaction_id);
    assert!(oldest.transaction_id < newest.transaction_id);
}

#[tokio::test]
async fn out_of_range_indices_are_not_found() {
    let (_dir, store) = open_store().await;
    let record = seeded_task(&store).await;

    for reference in ["~3", "~-4", "~100"] {
        let err = store.resolve_version(record.id, reference).await.unwrap_err();
        match err {
            LarderError::NotFound { message } => {
                assert!(
                    message.contains("0-2"),
                    "error should carry the valid range: {message}"
                );
            }
            other => panic!("expected NotFound for {reference}, got {other}"),
        }
    }
}

#[tokio::test]
async fn malformed_index_is_invalid_reference_not_missing() {
    let (_dir, store) = open_store().await;
    let record = seeded_task(&store).await;

    for reference in ["~", "~latest", "~1.5"] {
        let err = store.resolve_version(record.id, reference).await.unwrap_err();
        assert!(
            matches!(err, LarderError::InvalidReference { .. }),
            "{reference} should be malformed, got {err}"
        );
    }
}

#[tokio::test]
async fn unknown_hash_and_tag_are_not_found() {
    let (_dir, store) = open_store().await;
    let record = seeded_task(&store).await;

    let missing_hash = "b".repeat(64);
    let err = store.resolve_version(record.id, &missing_hash).await.unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));

    let err = store.resolve_version(record.id, "no-such-tag").await.unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));
}

#[tokio::test]
async fn entity_without_history_is_not_found() {
    let (_dir, store) = open_store().await;
    let err = store
        .resolve_version(EntityId(424242), "~0")
        .await
        .unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));
}

#[tokio::test]
async fn uncheckpointed_transactions_resolve_without_a_hash() {
    let (_dir, store) = open_store().await;
    let mut record = store.create_entity(task("bare", "fetch")).await.expect("create");
    let hash = store.checkpoint(&record, &[]).await.expect("checkpoint");

    record.content = task_content("bare", "train");
    store.update_entity(&record).await.expect("update");

    let newest = store.resolve_version(record.id, "~-1").await.expect("~-1");
    assert!(newest.hash.is_none());

    let oldest = store.resolve_version(record.id, "~0").await.expect("~0");
    let anchored = oldest.hash.expect("first transaction is anchored");
    assert_eq!(anchored.id, hash.id);
}

#[tokio::test]
async fn tag_resolution_follows_the_anchor() {
    let (_dir, store) = open_store().await;
    let mut record = store.create_entity(task("tagged", "fetch")).await.expect("create");
    let h1 = store
        .checkpoint(&record, &["stable".to_string()])
        .await
        .expect("checkpoint");

    record.content = task_content("tagged", "train");
    store.checkpoint(&record, &[]).await.expect("checkpoint two");

    let resolved = store.resolve_version(record.id, "stable").await.expect("stable");
    assert_eq!(resolved.transaction_id, h1.transaction_id);
    assert_eq!(resolved.index, 0);
    assert_eq!(
        resolved.hash.map(|hash| hash.content_hash),
        Some(h1.content_hash)
    );
}

#[tokio::test]
async fn noop_update_appends_no_transaction() {
    let (_dir, store) = open_store().await;
    let record = seeded_task(&store).await;

    let committed = store.update_entity(&record).await.expect("noop update");
    assert!(committed.is_none());

    let newest = store.resolve_version(record.id, "~-1").await.expect("~-1");
    assert_eq!(newest.index, 2, "history length unchanged by a no-op write");
}
