use larder_store::api::{
    CheckpointApi, EntityWriteApi, ListHistoryInput, VersionReadApi,
};
use larder_store::{
    EntityContent, EntityDetail, EntityId, LarderConfig, LarderError, LarderStore, NewEntity,
    OperationType, TrainedModelFields,
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

fn model_content(name: &str, revision: u32) -> EntityContent {
    EntityContent {
        name: name.to_string(),
        asset_origin: Some("training-run-7".to_string()),
        is_private: false,
        metadata: None,
        detail: EntityDetail::TrainedModel(TrainedModelFields {
            model_path: format!("/models/{name}/rev{revision}"),
            metadata_version: Some("2.1".to_string()),
            model_metadata: Some(json!({"f1": 0.9})),
            long_description: Some(format!("revision {revision}")),
            model_attributes: Some(json!({"quantized": revision % 2 == 0})),
        }),
    }
}

fn page(skip: u64, limit: u64) -> ListHistoryInput {
    ListHistoryInput {
        skip,
        limit,
        include_changeset: false,
    }
}

/// create + four updates: five raw transactions; revisions 0..=4.
async fn seeded_model(store: &LarderStore) -> larder_store::EntityRecord {
    let mut record = store
        .create_entity(NewEntity {
            collection_id: None,
            content: model_content("ranker", 0),
        })
        .await
        .expect("create");
    for revision in 1..=4 {
        record.content = model_content("ranker", revision);
        store.update_entity(&record).await.expect("update");
    }
    record
}

#[tokio::test]
async fn history_is_newest_first() {
    let (_dir, store) = open_store().await;
    let record = seeded_model(&store).await;

    let history = store
        .list_history(record.id, page(0, 10))
        .await
        .expect("history");
    assert_eq!(history.total, 5);
    assert_eq!(history.items.len(), 5);
    for window in history.items.windows(2) {
        assert!(window[0].transaction_id > window[1].transaction_id);
    }
    assert_eq!(history.items[0].index, 4);
    assert_eq!(history.items[4].index, 0);
    assert_eq!(history.items[4].operation_type, OperationType::Insert);
    assert_eq!(history.items[0].operation_type, OperationType::Update);
}

#[tokio::test]
async fn pagination_keeps_absolute_indices() {
    let (_dir, store) = open_store().await;
    let record = seeded_model(&store).await;

    let first = store
        .list_history(record.id, page(0, 2))
        .await
        .expect("page one");
    assert_eq!(first.total, 5);
    assert_eq!(
        first.items.iter().map(|item| item.index).collect::<Vec<_>>(),
        vec![4, 3]
    );

    let second = store
        .list_history(record.id, page(2, 2))
        .await
        .expect("page two");
    assert_eq!(
        second.items.iter().map(|item| item.index).collect::<Vec<_>>(),
        vec![2, 1]
    );

    let tail = store
        .list_history(record.id, page(4, 10))
        .await
        .expect("tail");
    assert_eq!(
        tail.items.iter().map(|item| item.index).collect::<Vec<_>>(),
        vec![0]
    );
}

#[tokio::test]
async fn skip_past_the_end_is_an_empty_page() {
    let (_dir, store) = open_store().await;
    let record = seeded_model(&store).await;

    let empty = store
        .list_history(record.id, page(9, 5))
        .await
        .expect("empty page");
    assert_eq!(empty.total, 5);
    assert!(empty.items.is_empty());
}

#[tokio::test]
async fn changeset_is_a_projection_of_that_version() {
    let (_dir, store) = open_store().await;
    let record = seeded_model(&store).await;

    let history = store
        .list_history(
            record.id,
            ListHistoryInput {
                skip: 0,
                limit: 10,
                include_changeset: true,
            },
        )
        .await
        .expect("history");

    let oldest = history.items.last().expect("oldest item");
    let changeset = oldest.changeset.as_ref().expect("changeset");
    assert_eq!(
        changeset.get("model_path").and_then(|v| v.as_str()),
        Some("/models/ranker/rev0")
    );
    let newest = &history.items[0];
    let changeset = newest.changeset.as_ref().expect("changeset");
    assert_eq!(
        changeset.get("long_description").and_then(|v| v.as_str()),
        Some("revision 4")
    );
}

#[tokio::test]
async fn annotations_land_only_on_anchored_rows() {
    let (_dir, store) = open_store().await;
    let mut record = store
        .create_entity(NewEntity {
            collection_id: None,
            content: model_content("annotated", 0),
        })
        .await
        .expect("create");
    let hash = store
        .checkpoint(&record, &["baseline".to_string()])
        .await
        .expect("checkpoint");

    record.content = model_content("annotated", 1);
    store.update_entity(&record).await.expect("update");

    let history = store
        .list_history(record.id, page(0, 10))
        .await
        .expect("history");
    assert_eq!(history.total, 2);

    let newest = &history.items[0];
    assert!(newest.content_hash.is_none());
    assert!(newest.tags.is_empty());
    assert!(
        newest.created_at.is_some(),
        "uncheckpointed rows fall back to the ledger timestamp"
    );

    let oldest = &history.items[1];
    assert_eq!(oldest.content_hash.as_deref(), Some(hash.content_hash.as_str()));
    assert_eq!(oldest.tags, vec!["baseline".to_string()]);
    assert_eq!(oldest.created_at, Some(hash.created_at));
}

#[tokio::test]
async fn history_of_a_missing_entity_is_not_found() {
    let (_dir, store) = open_store().await;
    let err = store
        .list_history(EntityId(99), page(0, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, LarderError::NotFound { .. }));
}

#[tokio::test]
async fn zero_limit_returns_only_the_total() {
    let (_dir, store) = open_store().await;
    let record = seeded_model(&store).await;

    let counted = store
        .list_history(record.id, page(0, 0))
        .await
        .expect("count only");
    assert_eq!(counted.total, 5);
    assert!(counted.items.is_empty());
}
