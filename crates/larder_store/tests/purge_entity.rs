use sea_orm::{ConnectionTrait, Database};

use larder_store::api::{CheckpointApi, EntityWriteApi, PurgeApi, VersionReadApi};
use larder_store::{
    DatasetFields, EntityContent, EntityDetail, LarderConfig, LarderError, LarderStore, NewEntity,
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

fn dataset(name: &str) -> NewEntity {
    NewEntity {
        collection_id: None,
        content: dataset_content(name, "v0"),
    }
}

fn dataset_content(name: &str, revision: &str) -> EntityContent {
    EntityContent {
        name: name.to_string(),
        asset_origin: None,
        is_private: false,
        metadata: None,
        detail: EntityDetail::Dataset(DatasetFields {
            data_path: format!("/data/{name}"),
            format: "parquet".to_string(),
            metadata_version: None,
            dataset_metadata: Some(json!({"revision": revision})),
            long_description: None,
        }),
    }
}

#[tokio::test]
async fn purge_removes_the_entire_version_chain() {
    let (_dir, store) = open_store().await;
    let (mut record, hash) = store
        .create_entity_checkpointed(dataset("doomed"), &["v1".to_string()])
        .await
        .expect("create checkpointed");
    record.content = dataset_content("doomed", "v1");
    store
        .checkpoint(&record, &["prod".to_string()])
        .await
        .expect("second checkpoint");

    let (survivor, _) = store
        .create_entity_checkpointed(dataset("survivor"), &["v1".to_string()])
        .await
        .expect("create survivor");

    store.purge_entity(record.id).await.expect("purge");

    let err = store.get_entity(record.id).await.unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));

    let err = store
        .resolve_version(record.id, &hash.content_hash)
        .await
        .unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));

    let err = store.resolve_version(record.id, "prod").await.unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));

    let err = store.resolve_version(record.id, "~0").await.unwrap_err();
    assert!(
        matches!(err, LarderError::NotFound { .. }),
        "no raw snapshots may remain"
    );

    // an unrelated entity keeps its rows and tags
    let kept = store.resolve_version(survivor.id, "v1").await.expect("survivor tag");
    assert_eq!(kept.index, 0);
    let live = store.get_entity(survivor.id).await.expect("survivor live");
    assert_eq!(live.content.name, "survivor");
}

#[tokio::test]
async fn purge_of_a_missing_entity_is_not_found() {
    let (_dir, store) = open_store().await;
    let record = store.create_entity(dataset("only")).await.expect("create");
    store.purge_entity(record.id).await.expect("purge");

    let err = store.purge_entity(record.id).await.unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));
}

#[tokio::test]
async fn purged_names_can_be_reused_with_fresh_history() {
    let (_dir, store) = open_store().await;
    let (record, first_hash) = store
        .create_entity_checkpointed(dataset("phoenix"), &["v1".to_string()])
        .await
        .expect("create checkpointed");
    store.purge_entity(record.id).await.expect("purge");

    let (reborn, reborn_hash) = store
        .create_entity_checkpointed(dataset("phoenix"), &["v1".to_string()])
        .await
        .expect("recreate");
    assert_ne!(reborn.id, record.id);
    // identical content hashes the same, but the chain starts over
    assert_eq!(reborn_hash.content_hash, first_hash.content_hash);
    let newest = store.resolve_version(reborn.id, "~-1").await.expect("~-1");
    assert_eq!(newest.index, 0);
}

#[tokio::test]
async fn purge_refuses_an_orphaned_anchor_and_leaves_state_intact() {
    let (dir, store) = open_store().await;
    let (record, _hash) = store
        .create_entity_checkpointed(dataset("orphaned"), &[])
        .await
        .expect("create checkpointed");

    // Sever the substrate behind the version store's back: drop the raw
    // snapshots the anchor points at.
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("catalog.sqlite").to_string_lossy()
    );
    let raw = Database::connect(url).await.expect("raw connection");
    raw.execute_unprepared(&format!(
        "DELETE FROM larder_entity_snapshots WHERE entity_id = {}",
        record.id.as_i64()
    ))
    .await
    .expect("sever snapshots");

    let err = store.purge_entity(record.id).await.unwrap_err();
    assert!(
        matches!(err, LarderError::Internal { .. }),
        "an anchor without a raw snapshot must surface, got {err}"
    );

    // nothing was deleted by the refused purge
    let live = store.get_entity(record.id).await.expect("live row intact");
    assert_eq!(live.content.name, "orphaned");
}
