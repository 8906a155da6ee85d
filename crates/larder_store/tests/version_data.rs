use larder_store::api::{CheckpointApi, EntityWriteApi, VersionReadApi};
use larder_store::{
    canonical, CollectionId, DatasetFields, EntityContent, EntityDetail, LarderConfig,
    LarderStore, NewEntity, OperationType, TaskFields, TrainedModelFields,
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

fn dataset_entity() -> NewEntity {
    NewEntity {
        collection_id: Some(CollectionId(7)),
        content: EntityContent {
            name: "sensor-sweep".to_string(),
            asset_origin: Some("ingest-pipeline".to_string()),
            is_private: false,
            metadata: Some(json!({"schema": {"b": 1, "a": 2}})),
            detail: EntityDetail::Dataset(DatasetFields {
                data_path: "/data/sensor-sweep".to_string(),
                format: "csv".to_string(),
                metadata_version: None,
                dataset_metadata: Some(json!({"rows": 42})),
                long_description: None,
            }),
        },
    }
}

fn model_entity() -> NewEntity {
    NewEntity {
        collection_id: None,
        content: EntityContent {
            name: "segmenter".to_string(),
            asset_origin: None,
            is_private: true,
            metadata: None,
            detail: EntityDetail::TrainedModel(TrainedModelFields {
                model_path: "/models/segmenter".to_string(),
                metadata_version: Some("2.0".to_string()),
                model_metadata: None,
                long_description: Some("unet variant".to_string()),
                model_attributes: Some(json!({"params": 31_000_000})),
            }),
        },
    }
}

fn task_entity() -> NewEntity {
    NewEntity {
        collection_id: None,
        content: EntityContent {
            name: "nightly-eval".to_string(),
            asset_origin: None,
            is_private: false,
            metadata: Some(json!({"owner": "mlops"})),
            detail: EntityDetail::Task(TaskFields {
                workflow: json!({"steps": ["pull", "score", "report"]}),
                version: Some("0.4.2".to_string()),
                description: Some("scores the holdout set".to_string()),
                has_file_uploads: true,
            }),
        },
    }
}

#[tokio::test]
async fn round_trip_recomputes_the_resolved_hash() {
    let (_dir, store) = open_store().await;
    for input in [dataset_entity(), model_entity(), task_entity()] {
        let (record, hash) = store
            .create_entity_checkpointed(input, &[])
            .await
            .expect("create checkpointed");
        let snapshot = store
            .get_version_data(record.id, &hash.content_hash)
            .await
            .expect("version data");
        assert_eq!(
            canonical::content_hash(&snapshot.content),
            hash.content_hash,
            "reconstructed state must hash back to the resolved hash"
        );
        assert_eq!(snapshot.transaction_id, hash.transaction_id);
        assert_eq!(snapshot.index, 0);
        assert_eq!(snapshot.operation_type, OperationType::Insert);
    }
}

#[tokio::test]
async fn snapshot_reflects_the_version_not_the_live_row() {
    let (_dir, store) = open_store().await;
    let (mut record, _hash) = store
        .create_entity_checkpointed(dataset_entity(), &[])
        .await
        .expect("create checkpointed");

    if let EntityDetail::Dataset(fields) = &mut record.content.detail {
        fields.format = "parquet".to_string();
        fields.long_description = Some("recompressed".to_string());
    }
    store.checkpoint(&record, &[]).await.expect("second checkpoint");

    let original = store
        .get_version_data(record.id, "~0")
        .await
        .expect("oldest snapshot");
    if let EntityDetail::Dataset(fields) = &original.content.detail {
        assert_eq!(fields.format, "csv");
        assert_eq!(fields.long_description, None);
    } else {
        panic!("expected dataset detail");
    }

    let live = store.get_entity(record.id).await.expect("live");
    if let EntityDetail::Dataset(fields) = &live.content.detail {
        assert_eq!(fields.format, "parquet");
    } else {
        panic!("expected dataset detail");
    }
}

#[tokio::test]
async fn snapshot_carries_tags_and_timestamps() {
    let (_dir, store) = open_store().await;
    let (record, hash) = store
        .create_entity_checkpointed(task_entity(), &["v1".to_string(), "prod".to_string()])
        .await
        .expect("create checkpointed");

    let snapshot = store
        .get_version_data(record.id, "prod")
        .await
        .expect("by tag");
    assert_eq!(snapshot.content_hash.as_deref(), Some(hash.content_hash.as_str()));
    assert_eq!(snapshot.tags, vec!["v1".to_string(), "prod".to_string()]);
    assert_eq!(snapshot.created_at, Some(hash.created_at));
}

#[tokio::test]
async fn uncheckpointed_version_data_has_no_hash_but_a_ledger_timestamp() {
    let (_dir, store) = open_store().await;
    let mut record = store.create_entity(task_entity()).await.expect("create");
    store.checkpoint(&record, &[]).await.expect("checkpoint");

    if let EntityDetail::Task(fields) = &mut record.content.detail {
        fields.description = Some("rescored".to_string());
    }
    store.update_entity(&record).await.expect("update");

    let snapshot = store
        .get_version_data(record.id, "~-1")
        .await
        .expect("newest");
    assert!(snapshot.content_hash.is_none());
    assert!(snapshot.tags.is_empty());
    assert!(snapshot.created_at.is_some());
    assert_eq!(snapshot.operation_type, OperationType::Update);
    if let EntityDetail::Task(fields) = &snapshot.content.detail {
        assert_eq!(fields.description.as_deref(), Some("rescored"));
    } else {
        panic!("expected task detail");
    }
}

#[tokio::test]
async fn bookkeeping_changes_do_not_move_the_hash() {
    let (_dir, store) = open_store().await;
    let (mut record, hash) = store
        .create_entity_checkpointed(dataset_entity(), &[])
        .await
        .expect("create checkpointed");

    // moving the entity between collections changes no semantic field
    record.collection_id = Some(CollectionId(99));
    let rehash = store.checkpoint(&record, &[]).await.expect("checkpoint");
    assert_eq!(rehash.id, hash.id);

    // the collection move itself was committed and captured
    let newest = store.resolve_version(record.id, "~-1").await.expect("~-1");
    assert_eq!(newest.index, 1);
    let live = store.get_entity(record.id).await.expect("live");
    assert_eq!(live.collection_id, Some(CollectionId(99)));
}

#[tokio::test]
async fn metadata_key_order_does_not_fork_versions() {
    let (_dir, store) = open_store().await;
    let (mut record, hash) = store
        .create_entity_checkpointed(dataset_entity(), &[])
        .await
        .expect("create checkpointed");

    // same logical metadata, different insertion order
    record.content.metadata = Some(json!({"schema": {"a": 2, "b": 1}}));
    let rehash = store.checkpoint(&record, &[]).await.expect("checkpoint");
    assert_eq!(rehash.id, hash.id);
}
