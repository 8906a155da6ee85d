use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Alias, Expr, Func, LockType, MysqlQueryBuilder, Order, PostgresQueryBuilder, Query,
    QueryStatementWriter, SqliteQueryBuilder,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement, TransactionTrait,
};
use serde_json::Value as JsonValue;

use crate::db::*;
use crate::migration::Migrator;
use crate::LarderConfig;
use larder_core::api::{
    CheckpointApi, EntityWriteApi, HistoryItem, HistoryPage, ListHistoryInput, PurgeApi,
    VersionReadApi, VersionSnapshot,
};
use larder_core::{
    canonical, is_content_hash, CollectionId, DatasetFields, EntityContent, EntityDetail,
    EntityId, EntityKind, EntityRecord, LarderError, LarderResult, NewEntity, OperationType,
    ResolvedVersion, TaskFields, TrainedModelFields, TransactionId, VersionHash, VersionHashId,
    VersionRef, VersionTag, VersionTagId,
};
use sea_orm_migration::MigratorTrait;

#[derive(Clone)]
pub struct LarderStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
}

impl LarderStore {
    pub async fn connect(config: &LarderConfig, base_dir: &Path) -> LarderResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(LarderError::from)?;
        let backend = conn.get_database_backend();
        let store = Self { conn, backend };
        Migrator::up(&store.conn, None)
            .await
            .map_err(LarderError::from)?;
        Ok(store)
    }

    // ------------------------------------------------------------------
    // Change-tracking substrate: every committed mutation of a tracked
    // entity appends one ledger row and a paired base/subtype snapshot.
    // ------------------------------------------------------------------

    async fn append_ledger<C: ConnectionTrait>(&self, conn: &C) -> LarderResult<TransactionId> {
        let mut insert = Query::insert()
            .into_table(LarderTransactions::Table)
            .columns([LarderTransactions::IssuedAt])
            .values_panic([now_millis().into()])
            .to_owned();
        let id = insert_returning_id(conn, &mut insert, &col_name(LarderTransactions::Id)).await?;
        Ok(TransactionId(id))
    }

    async fn ledger_issued_at<C: ConnectionTrait>(
        &self,
        conn: &C,
        transaction_id: TransactionId,
    ) -> LarderResult<Option<DateTime<Utc>>> {
        let select = Query::select()
            .from(LarderTransactions::Table)
            .column(LarderTransactions::IssuedAt)
            .and_where(Expr::col(LarderTransactions::Id).eq(transaction_id.as_i64()))
            .limit(1)
            .to_owned();
        let row = query_one(conn, &select).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let issued_at: i64 = row.try_get("", &col_name(LarderTransactions::IssuedAt))?;
        Ok(Some(datetime_from_millis(issued_at)))
    }

    async fn capture_snapshots<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        transaction_id: TransactionId,
        operation: OperationType,
        collection_id: Option<CollectionId>,
        created_at_ms: i64,
        content: &EntityContent,
    ) -> LarderResult<()> {
        let insert_base = Query::insert()
            .into_table(LarderEntitySnapshots::Table)
            .columns([
                LarderEntitySnapshots::EntityId,
                LarderEntitySnapshots::TransactionId,
                LarderEntitySnapshots::OperationType,
                LarderEntitySnapshots::Name,
                LarderEntitySnapshots::EntityKind,
                LarderEntitySnapshots::AssetOrigin,
                LarderEntitySnapshots::CollectionId,
                LarderEntitySnapshots::IsPrivate,
                LarderEntitySnapshots::Metadata,
                LarderEntitySnapshots::CreatedAt,
            ])
            .values_panic([
                entity_id.as_i64().into(),
                transaction_id.as_i64().into(),
                (operation.as_i16() as i64).into(),
                content.name.clone().into(),
                content.kind().as_str().to_string().into(),
                content.asset_origin.clone().into(),
                collection_id.map(CollectionId::as_i64).into(),
                content.is_private.into(),
                json_to_column(content.metadata.as_ref()).into(),
                created_at_ms.into(),
            ])
            .to_owned();
        exec(conn, &insert_base).await?;

        match &content.detail {
            EntityDetail::Dataset(dataset) => {
                let insert = Query::insert()
                    .into_table(LarderDatasetSnapshots::Table)
                    .columns([
                        LarderDatasetSnapshots::EntityId,
                        LarderDatasetSnapshots::TransactionId,
                        LarderDatasetSnapshots::OperationType,
                        LarderDatasetSnapshots::DataPath,
                        LarderDatasetSnapshots::Format,
                        LarderDatasetSnapshots::MetadataVersion,
                        LarderDatasetSnapshots::DatasetMetadata,
                        LarderDatasetSnapshots::LongDescription,
                    ])
                    .values_panic([
                        entity_id.as_i64().into(),
                        transaction_id.as_i64().into(),
                        (operation.as_i16() as i64).into(),
                        dataset.data_path.clone().into(),
                        dataset.format.clone().into(),
                        dataset.metadata_version.clone().into(),
                        json_to_column(dataset.dataset_metadata.as_ref()).into(),
                        dataset.long_description.clone().into(),
                    ])
                    .to_owned();
                exec(conn, &insert).await?;
            }
            EntityDetail::TrainedModel(model) => {
                let insert = Query::insert()
                    .into_table(LarderTrainedModelSnapshots::Table)
                    .columns([
                        LarderTrainedModelSnapshots::EntityId,
                        LarderTrainedModelSnapshots::TransactionId,
                        LarderTrainedModelSnapshots::OperationType,
                        LarderTrainedModelSnapshots::ModelPath,
                        LarderTrainedModelSnapshots::MetadataVersion,
                        LarderTrainedModelSnapshots::ModelMetadata,
                        LarderTrainedModelSnapshots::LongDescription,
                        LarderTrainedModelSnapshots::ModelAttributes,
                    ])
                    .values_panic([
                        entity_id.as_i64().into(),
                        transaction_id.as_i64().into(),
                        (operation.as_i16() as i64).into(),
                        model.model_path.clone().into(),
                        model.metadata_version.clone().into(),
                        json_to_column(model.model_metadata.as_ref()).into(),
                        model.long_description.clone().into(),
                        json_to_column(model.model_attributes.as_ref()).into(),
                    ])
                    .to_owned();
                exec(conn, &insert).await?;
            }
            EntityDetail::Task(task) => {
                let insert = Query::insert()
                    .into_table(LarderTaskSnapshots::Table)
                    .columns([
                        LarderTaskSnapshots::EntityId,
                        LarderTaskSnapshots::TransactionId,
                        LarderTaskSnapshots::OperationType,
                        LarderTaskSnapshots::Workflow,
                        LarderTaskSnapshots::Version,
                        LarderTaskSnapshots::Description,
                        LarderTaskSnapshots::HasFileUploads,
                    ])
                    .values_panic([
                        entity_id.as_i64().into(),
                        transaction_id.as_i64().into(),
                        (operation.as_i16() as i64).into(),
                        task.workflow.to_string().into(),
                        task.version.clone().into(),
                        task.description.clone().into(),
                        task.has_file_uploads.into(),
                    ])
                    .to_owned();
                exec(conn, &insert).await?;
            }
        }
        Ok(())
    }

    async fn insert_entity_state<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: NewEntity,
    ) -> LarderResult<EntityRecord> {
        let created_at_ms = now_millis();
        let mut insert = Query::insert()
            .into_table(LarderEntities::Table)
            .columns([
                LarderEntities::Name,
                LarderEntities::EntityKind,
                LarderEntities::AssetOrigin,
                LarderEntities::CollectionId,
                LarderEntities::IsPrivate,
                LarderEntities::Metadata,
                LarderEntities::CreatedAt,
            ])
            .values_panic([
                input.content.name.clone().into(),
                input.content.kind().as_str().to_string().into(),
                input.content.asset_origin.clone().into(),
                input.collection_id.map(CollectionId::as_i64).into(),
                input.content.is_private.into(),
                json_to_column(input.content.metadata.as_ref()).into(),
                created_at_ms.into(),
            ])
            .to_owned();
        let entity_id = EntityId(
            insert_returning_id(conn, &mut insert, &col_name(LarderEntities::Id)).await?,
        );

        match &input.content.detail {
            EntityDetail::Dataset(dataset) => {
                let insert = Query::insert()
                    .into_table(LarderDatasets::Table)
                    .columns([
                        LarderDatasets::EntityId,
                        LarderDatasets::DataPath,
                        LarderDatasets::Format,
                        LarderDatasets::MetadataVersion,
                        LarderDatasets::DatasetMetadata,
                        LarderDatasets::LongDescription,
                    ])
                    .values_panic([
                        entity_id.as_i64().into(),
                        dataset.data_path.clone().into(),
                        dataset.format.clone().into(),
                        dataset.metadata_version.clone().into(),
                        json_to_column(dataset.dataset_metadata.as_ref()).into(),
                        dataset.long_description.clone().into(),
                    ])
                    .to_owned();
                exec(conn, &insert).await?;
            }
            EntityDetail::TrainedModel(model) => {
                let insert = Query::insert()
                    .into_table(LarderTrainedModels::Table)
                    .columns([
                        LarderTrainedModels::EntityId,
                        LarderTrainedModels::ModelPath,
                        LarderTrainedModels::MetadataVersion,
                        LarderTrainedModels::ModelMetadata,
                        LarderTrainedModels::LongDescription,
                        LarderTrainedModels::ModelAttributes,
                    ])
                    .values_panic([
                        entity_id.as_i64().into(),
                        model.model_path.clone().into(),
                        model.metadata_version.clone().into(),
                        json_to_column(model.model_metadata.as_ref()).into(),
                        model.long_description.clone().into(),
                        json_to_column(model.model_attributes.as_ref()).into(),
                    ])
                    .to_owned();
                exec(conn, &insert).await?;
            }
            EntityDetail::Task(task) => {
                let insert = Query::insert()
                    .into_table(LarderTasks::Table)
                    .columns([
                        LarderTasks::EntityId,
                        LarderTasks::Workflow,
                        LarderTasks::Version,
                        LarderTasks::Description,
                        LarderTasks::HasFileUploads,
                    ])
                    .values_panic([
                        entity_id.as_i64().into(),
                        task.workflow.to_string().into(),
                        task.version.clone().into(),
                        task.description.clone().into(),
                        task.has_file_uploads.into(),
                    ])
                    .to_owned();
                exec(conn, &insert).await?;
            }
        }

        let transaction_id = self.append_ledger(conn).await?;
        self.capture_snapshots(
            conn,
            entity_id,
            transaction_id,
            OperationType::Insert,
            input.collection_id,
            created_at_ms,
            &input.content,
        )
        .await?;

        Ok(EntityRecord {
            id: entity_id,
            collection_id: input.collection_id,
            created_at: datetime_from_millis(created_at_ms),
            current_version_hash: None,
            content: input.content,
        })
    }

    async fn commit_entity_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        record: &EntityRecord,
    ) -> LarderResult<TransactionId> {
        let update_base = Query::update()
            .table(LarderEntities::Table)
            .values([
                (LarderEntities::Name, record.content.name.clone().into()),
                (
                    LarderEntities::AssetOrigin,
                    record.content.asset_origin.clone().into(),
                ),
                (
                    LarderEntities::CollectionId,
                    record.collection_id.map(CollectionId::as_i64).into(),
                ),
                (LarderEntities::IsPrivate, record.content.is_private.into()),
                (
                    LarderEntities::Metadata,
                    json_to_column(record.content.metadata.as_ref()).into(),
                ),
            ])
            .and_where(Expr::col(LarderEntities::Id).eq(record.id.as_i64()))
            .to_owned();
        exec(conn, &update_base).await?;

        match &record.content.detail {
            EntityDetail::Dataset(dataset) => {
                let update = Query::update()
                    .table(LarderDatasets::Table)
                    .values([
                        (LarderDatasets::DataPath, dataset.data_path.clone().into()),
                        (LarderDatasets::Format, dataset.format.clone().into()),
                        (
                            LarderDatasets::MetadataVersion,
                            dataset.metadata_version.clone().into(),
                        ),
                        (
                            LarderDatasets::DatasetMetadata,
                            json_to_column(dataset.dataset_metadata.as_ref()).into(),
                        ),
                        (
                            LarderDatasets::LongDescription,
                            dataset.long_description.clone().into(),
                        ),
                    ])
                    .and_where(Expr::col(LarderDatasets::EntityId).eq(record.id.as_i64()))
                    .to_owned();
                exec(conn, &update).await?;
            }
            EntityDetail::TrainedModel(model) => {
                let update = Query::update()
                    .table(LarderTrainedModels::Table)
                    .values([
                        (
                            LarderTrainedModels::ModelPath,
                            model.model_path.clone().into(),
                        ),
                        (
                            LarderTrainedModels::MetadataVersion,
                            model.metadata_version.clone().into(),
                        ),
                        (
                            LarderTrainedModels::ModelMetadata,
                            json_to_column(model.model_metadata.as_ref()).into(),
                        ),
                        (
                            LarderTrainedModels::LongDescription,
                            model.long_description.clone().into(),
                        ),
                        (
                            LarderTrainedModels::ModelAttributes,
                            json_to_column(model.model_attributes.as_ref()).into(),
                        ),
                    ])
                    .and_where(Expr::col(LarderTrainedModels::EntityId).eq(record.id.as_i64()))
                    .to_owned();
                exec(conn, &update).await?;
            }
            EntityDetail::Task(task) => {
                let update = Query::update()
                    .table(LarderTasks::Table)
                    .values([
                        (LarderTasks::Workflow, task.workflow.to_string().into()),
                        (LarderTasks::Version, task.version.clone().into()),
                        (LarderTasks::Description, task.description.clone().into()),
                        (
                            LarderTasks::HasFileUploads,
                            task.has_file_uploads.into(),
                        ),
                    ])
                    .and_where(Expr::col(LarderTasks::EntityId).eq(record.id.as_i64()))
                    .to_owned();
                exec(conn, &update).await?;
            }
        }

        let transaction_id = self.append_ledger(conn).await?;
        self.capture_snapshots(
            conn,
            record.id,
            transaction_id,
            OperationType::Update,
            record.collection_id,
            record.created_at.timestamp_millis(),
            &record.content,
        )
        .await?;
        Ok(transaction_id)
    }

    async fn load_entity<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
    ) -> LarderResult<EntityRecord> {
        let select = Query::select()
            .from(LarderEntities::Table)
            .columns([
                LarderEntities::Name,
                LarderEntities::EntityKind,
                LarderEntities::AssetOrigin,
                LarderEntities::CollectionId,
                LarderEntities::IsPrivate,
                LarderEntities::Metadata,
                LarderEntities::CurrentVersionHash,
                LarderEntities::CreatedAt,
            ])
            .and_where(Expr::col(LarderEntities::Id).eq(entity_id.as_i64()))
            .limit(1)
            .to_owned();
        let row = query_one(conn, &select)
            .await?
            .ok_or_else(|| LarderError::not_found(format!("entity {entity_id} does not exist")))?;

        let kind = read_entity_kind(&row, LarderEntities::EntityKind)?;
        let name: String = row.try_get("", &col_name(LarderEntities::Name))?;
        let asset_origin: Option<String> =
            row.try_get("", &col_name(LarderEntities::AssetOrigin))?;
        let collection_id: Option<i64> = row.try_get("", &col_name(LarderEntities::CollectionId))?;
        let is_private: bool = row.try_get("", &col_name(LarderEntities::IsPrivate))?;
        let metadata = json_from_column(
            row.try_get("", &col_name(LarderEntities::Metadata))?,
            "entity metadata",
        )?;
        let current_version_hash: Option<String> =
            row.try_get("", &col_name(LarderEntities::CurrentVersionHash))?;
        let created_at: i64 = row.try_get("", &col_name(LarderEntities::CreatedAt))?;

        let detail = self.load_live_detail(conn, entity_id, kind).await?;

        Ok(EntityRecord {
            id: entity_id,
            collection_id: collection_id.map(CollectionId),
            created_at: datetime_from_millis(created_at),
            current_version_hash,
            content: EntityContent {
                name,
                asset_origin,
                is_private,
                metadata,
                detail,
            },
        })
    }

    async fn load_live_detail<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        kind: EntityKind,
    ) -> LarderResult<EntityDetail> {
        let row = match kind {
            EntityKind::Dataset => {
                let select = Query::select()
                    .from(LarderDatasets::Table)
                    .columns([
                        LarderDatasets::DataPath,
                        LarderDatasets::Format,
                        LarderDatasets::MetadataVersion,
                        LarderDatasets::DatasetMetadata,
                        LarderDatasets::LongDescription,
                    ])
                    .and_where(Expr::col(LarderDatasets::EntityId).eq(entity_id.as_i64()))
                    .limit(1)
                    .to_owned();
                query_one(conn, &select).await?
            }
            EntityKind::TrainedModel => {
                let select = Query::select()
                    .from(LarderTrainedModels::Table)
                    .columns([
                        LarderTrainedModels::ModelPath,
                        LarderTrainedModels::MetadataVersion,
                        LarderTrainedModels::ModelMetadata,
                        LarderTrainedModels::LongDescription,
                        LarderTrainedModels::ModelAttributes,
                    ])
                    .and_where(Expr::col(LarderTrainedModels::EntityId).eq(entity_id.as_i64()))
                    .limit(1)
                    .to_owned();
                query_one(conn, &select).await?
            }
            EntityKind::Task => {
                let select = Query::select()
                    .from(LarderTasks::Table)
                    .columns([
                        LarderTasks::Workflow,
                        LarderTasks::Version,
                        LarderTasks::Description,
                        LarderTasks::HasFileUploads,
                    ])
                    .and_where(Expr::col(LarderTasks::EntityId).eq(entity_id.as_i64()))
                    .limit(1)
                    .to_owned();
                query_one(conn, &select).await?
            }
        };
        let row = row.ok_or_else(|| {
            LarderError::internal(format!(
                "entity {entity_id} has no live {} row",
                kind.as_str()
            ))
        })?;
        read_detail(&row, kind)
    }

    async fn set_current_version_hash<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        content_hash: &str,
    ) -> LarderResult<()> {
        // Bookkeeping column; written directly so no snapshot is captured.
        let update = Query::update()
            .table(LarderEntities::Table)
            .values([(
                LarderEntities::CurrentVersionHash,
                content_hash.to_string().into(),
            )])
            .and_where(Expr::col(LarderEntities::Id).eq(entity_id.as_i64()))
            .to_owned();
        exec(conn, &update).await
    }

    // ------------------------------------------------------------------
    // Version store: hash and tag rows.
    // ------------------------------------------------------------------

    async fn find_hash<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        content_hash: &str,
    ) -> LarderResult<Option<VersionHash>> {
        let select = version_hash_select()
            .and_where(Expr::col(LarderVersionHashes::EntityId).eq(entity_id.as_i64()))
            .and_where(Expr::col(LarderVersionHashes::ContentHash).eq(content_hash))
            .limit(1)
            .to_owned();
        let row = query_one(conn, &select).await?;
        row.map(|row| read_version_hash(&row)).transpose()
    }

    async fn find_hash_by_transaction<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        transaction_id: TransactionId,
    ) -> LarderResult<Option<VersionHash>> {
        let select = version_hash_select()
            .and_where(Expr::col(LarderVersionHashes::EntityId).eq(entity_id.as_i64()))
            .and_where(
                Expr::col(LarderVersionHashes::TransactionId).eq(transaction_id.as_i64()),
            )
            .limit(1)
            .to_owned();
        let row = query_one(conn, &select).await?;
        row.map(|row| read_version_hash(&row)).transpose()
    }

    async fn find_hash_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        hash_id: VersionHashId,
    ) -> LarderResult<Option<VersionHash>> {
        let select = version_hash_select()
            .and_where(Expr::col(LarderVersionHashes::Id).eq(hash_id.as_i64()))
            .limit(1)
            .to_owned();
        let row = query_one(conn, &select).await?;
        row.map(|row| read_version_hash(&row)).transpose()
    }

    async fn create_hash<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        transaction_id: TransactionId,
        content_hash: &str,
    ) -> LarderResult<VersionHash> {
        let created_at_ms = now_millis();
        let mut insert = Query::insert()
            .into_table(LarderVersionHashes::Table)
            .columns([
                LarderVersionHashes::EntityId,
                LarderVersionHashes::TransactionId,
                LarderVersionHashes::ContentHash,
                LarderVersionHashes::CreatedAt,
            ])
            .values_panic([
                entity_id.as_i64().into(),
                transaction_id.as_i64().into(),
                content_hash.to_string().into(),
                created_at_ms.into(),
            ])
            .to_owned();
        let id = insert_returning_id(conn, &mut insert, &col_name(LarderVersionHashes::Id))
            .await
            .map_err(|err| {
                if err.is_conflict() {
                    LarderError::conflict(format!(
                        "concurrent checkpoint already recorded content {content_hash} for entity {entity_id}"
                    ))
                } else {
                    err
                }
            })?;
        Ok(VersionHash {
            id: VersionHashId(id),
            entity_id,
            transaction_id,
            content_hash: content_hash.to_string(),
            created_at: datetime_from_millis(created_at_ms),
        })
    }

    async fn find_tag<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        tag_name: &str,
    ) -> LarderResult<Option<VersionTag>> {
        let select = Query::select()
            .from(LarderVersionTags::Table)
            .columns([
                (LarderVersionTags::Table, LarderVersionTags::Id),
                (LarderVersionTags::Table, LarderVersionTags::VersionHashId),
                (LarderVersionTags::Table, LarderVersionTags::TagName),
            ])
            .inner_join(
                LarderVersionHashes::Table,
                Expr::col((LarderVersionTags::Table, LarderVersionTags::VersionHashId))
                    .equals((LarderVersionHashes::Table, LarderVersionHashes::Id)),
            )
            .and_where(
                Expr::col((LarderVersionHashes::Table, LarderVersionHashes::EntityId))
                    .eq(entity_id.as_i64()),
            )
            .and_where(
                Expr::col((LarderVersionTags::Table, LarderVersionTags::TagName)).eq(tag_name),
            )
            .limit(1)
            .to_owned();
        let row = query_one(conn, &select).await?;
        row.map(|row| read_version_tag(&row)).transpose()
    }

    async fn insert_tag<C: ConnectionTrait>(
        &self,
        conn: &C,
        hash_id: VersionHashId,
        tag_name: &str,
    ) -> LarderResult<VersionTag> {
        let mut insert = Query::insert()
            .into_table(LarderVersionTags::Table)
            .columns([
                LarderVersionTags::VersionHashId,
                LarderVersionTags::TagName,
                LarderVersionTags::CreatedAt,
            ])
            .values_panic([
                hash_id.as_i64().into(),
                tag_name.to_string().into(),
                now_millis().into(),
            ])
            .to_owned();
        let id = insert_returning_id(conn, &mut insert, &col_name(LarderVersionTags::Id)).await?;
        Ok(VersionTag {
            id: VersionTagId(id),
            version_hash_id: hash_id,
            tag_name: tag_name.to_string(),
        })
    }

    /// Idempotent per tag: a tag already on `hash` is left alone; a tag on
    /// a different hash of the same entity is a duplicate.
    async fn merge_tags<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        hash: &VersionHash,
        tags: &[String],
    ) -> LarderResult<()> {
        for tag_name in tags {
            ensure_tag_name_resolvable(tag_name)?;
            match self.find_tag(conn, entity_id, tag_name).await? {
                Some(existing) if existing.version_hash_id == hash.id => continue,
                Some(_) => {
                    return Err(LarderError::duplicate_tag(format!(
                        "tag '{tag_name}' already names another version of entity {entity_id}"
                    )));
                }
                None => {
                    self.insert_tag(conn, hash.id, tag_name).await?;
                }
            }
        }
        Ok(())
    }

    async fn tags_for_hashes<C: ConnectionTrait>(
        &self,
        conn: &C,
        hash_ids: &[i64],
    ) -> LarderResult<HashMap<i64, Vec<String>>> {
        let mut by_hash: HashMap<i64, Vec<String>> = HashMap::new();
        if hash_ids.is_empty() {
            return Ok(by_hash);
        }
        let select = Query::select()
            .from(LarderVersionTags::Table)
            .columns([LarderVersionTags::VersionHashId, LarderVersionTags::TagName])
            .and_where(Expr::col(LarderVersionTags::VersionHashId).is_in(hash_ids.to_vec()))
            .order_by(LarderVersionTags::Id, Order::Asc)
            .to_owned();
        let rows = query_all(conn, &select).await?;
        for row in rows {
            let hash_id: i64 = row.try_get("", &col_name(LarderVersionTags::VersionHashId))?;
            let tag_name: String = row.try_get("", &col_name(LarderVersionTags::TagName))?;
            by_hash.entry(hash_id).or_default().push(tag_name);
        }
        Ok(by_hash)
    }

    // ------------------------------------------------------------------
    // Raw history arithmetic.
    // ------------------------------------------------------------------

    async fn count_snapshots<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
    ) -> LarderResult<u64> {
        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .expr_as(
                Func::count(Expr::col(LarderEntitySnapshots::TransactionId)),
                Alias::new("cnt"),
            )
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .to_owned();
        let row = query_one(conn, &select).await?;
        let Some(row) = row else {
            return Ok(0);
        };
        let count: i64 = row.try_get("", "cnt")?;
        Ok(count as u64)
    }

    async fn transaction_at_index<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        index: u64,
    ) -> LarderResult<TransactionId> {
        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .column(LarderEntitySnapshots::TransactionId)
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .order_by(LarderEntitySnapshots::TransactionId, Order::Asc)
            .limit(1)
            .offset(index)
            .to_owned();
        let row = query_one(conn, &select).await?.ok_or_else(|| {
            LarderError::internal(format!(
                "raw history of entity {entity_id} shrank while resolving index {index}"
            ))
        })?;
        let transaction_id: i64 =
            row.try_get("", &col_name(LarderEntitySnapshots::TransactionId))?;
        Ok(TransactionId(transaction_id))
    }

    /// Ascending position of the anchor transaction in the raw history.
    /// An anchor without a backing snapshot is a substrate inconsistency.
    async fn snapshot_index<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        transaction_id: TransactionId,
    ) -> LarderResult<i64> {
        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .expr_as(
                Func::count(Expr::col(LarderEntitySnapshots::TransactionId)),
                Alias::new("cnt"),
            )
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .and_where(
                Expr::col(LarderEntitySnapshots::TransactionId).eq(transaction_id.as_i64()),
            )
            .to_owned();
        let row = query_one(conn, &select).await?;
        let backed: i64 = match &row {
            Some(row) => row.try_get("", "cnt")?,
            None => 0,
        };
        if backed == 0 {
            return Err(LarderError::internal(format!(
                "version anchor transaction {transaction_id} of entity {entity_id} has no raw snapshot"
            )));
        }
        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .expr_as(
                Func::count(Expr::col(LarderEntitySnapshots::TransactionId)),
                Alias::new("cnt"),
            )
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .and_where(
                Expr::col(LarderEntitySnapshots::TransactionId).lt(transaction_id.as_i64()),
            )
            .to_owned();
        let row = query_one(conn, &select).await?;
        let before: i64 = match &row {
            Some(row) => row.try_get("", "cnt")?,
            None => 0,
        };
        Ok(before)
    }

    async fn latest_transaction<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
    ) -> LarderResult<Option<TransactionId>> {
        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .expr_as(
                Func::max(Expr::col(LarderEntitySnapshots::TransactionId)),
                Alias::new("max_tx"),
            )
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .to_owned();
        let row = query_one(conn, &select).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let max_tx: Option<i64> = row.try_get("", "max_tx")?;
        Ok(max_tx.map(TransactionId))
    }

    async fn load_base_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        transaction_id: TransactionId,
    ) -> LarderResult<QueryResult> {
        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .columns([
                LarderEntitySnapshots::OperationType,
                LarderEntitySnapshots::Name,
                LarderEntitySnapshots::EntityKind,
                LarderEntitySnapshots::AssetOrigin,
                LarderEntitySnapshots::IsPrivate,
                LarderEntitySnapshots::Metadata,
            ])
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .and_where(
                Expr::col(LarderEntitySnapshots::TransactionId).eq(transaction_id.as_i64()),
            )
            .limit(1)
            .to_owned();
        query_one(conn, &select).await?.ok_or_else(|| {
            LarderError::internal(format!(
                "base snapshot of entity {entity_id} at transaction {transaction_id} is missing"
            ))
        })
    }

    async fn load_detail_snapshot<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        transaction_id: TransactionId,
        kind: EntityKind,
    ) -> LarderResult<EntityDetail> {
        let row = match kind {
            EntityKind::Dataset => {
                let select = Query::select()
                    .from(LarderDatasetSnapshots::Table)
                    .columns([
                        LarderDatasetSnapshots::DataPath,
                        LarderDatasetSnapshots::Format,
                        LarderDatasetSnapshots::MetadataVersion,
                        LarderDatasetSnapshots::DatasetMetadata,
                        LarderDatasetSnapshots::LongDescription,
                    ])
                    .and_where(
                        Expr::col(LarderDatasetSnapshots::EntityId).eq(entity_id.as_i64()),
                    )
                    .and_where(
                        Expr::col(LarderDatasetSnapshots::TransactionId)
                            .eq(transaction_id.as_i64()),
                    )
                    .limit(1)
                    .to_owned();
                query_one(conn, &select).await?
            }
            EntityKind::TrainedModel => {
                let select = Query::select()
                    .from(LarderTrainedModelSnapshots::Table)
                    .columns([
                        LarderTrainedModelSnapshots::ModelPath,
                        LarderTrainedModelSnapshots::MetadataVersion,
                        LarderTrainedModelSnapshots::ModelMetadata,
                        LarderTrainedModelSnapshots::LongDescription,
                        LarderTrainedModelSnapshots::ModelAttributes,
                    ])
                    .and_where(
                        Expr::col(LarderTrainedModelSnapshots::EntityId).eq(entity_id.as_i64()),
                    )
                    .and_where(
                        Expr::col(LarderTrainedModelSnapshots::TransactionId)
                            .eq(transaction_id.as_i64()),
                    )
                    .limit(1)
                    .to_owned();
                query_one(conn, &select).await?
            }
            EntityKind::Task => {
                let select = Query::select()
                    .from(LarderTaskSnapshots::Table)
                    .columns([
                        LarderTaskSnapshots::Workflow,
                        LarderTaskSnapshots::Version,
                        LarderTaskSnapshots::Description,
                        LarderTaskSnapshots::HasFileUploads,
                    ])
                    .and_where(Expr::col(LarderTaskSnapshots::EntityId).eq(entity_id.as_i64()))
                    .and_where(
                        Expr::col(LarderTaskSnapshots::TransactionId)
                            .eq(transaction_id.as_i64()),
                    )
                    .limit(1)
                    .to_owned();
                query_one(conn, &select).await?
            }
        };
        let row = row.ok_or_else(|| {
            LarderError::internal(format!(
                "{} snapshot of entity {entity_id} at transaction {transaction_id} is missing",
                kind.as_str()
            ))
        })?;
        read_detail(&row, kind)
    }

    // ------------------------------------------------------------------
    // Checkpoint orchestration.
    // ------------------------------------------------------------------

    async fn checkpoint_once(
        &self,
        record: &EntityRecord,
        content_hash: &str,
        tags: &[String],
    ) -> LarderResult<VersionHash> {
        let tx = self.conn.begin().await?;
        let live = self.load_entity(&tx, record.id).await?;
        if live.content.kind() != record.content.kind() {
            return Err(LarderError::conflict(format!(
                "entity {} is a {}, its kind cannot change",
                record.id,
                live.content.kind().as_str()
            )));
        }
        let existing = self.find_hash(&tx, record.id, content_hash).await?;

        // The pending mutation is always made durable; dedup only controls
        // the version bookkeeping. A pending state identical to the live
        // rows mutates nothing and so produces no new raw snapshot.
        let mutated =
            record.content != live.content || record.collection_id != live.collection_id;
        let committed = if mutated {
            Some(self.commit_entity_update(&tx, record).await?)
        } else {
            None
        };

        let hash = match existing {
            Some(existing) => {
                debug!(
                    "checkpoint dedup hit for entity {}: content {} anchored at transaction {}",
                    record.id, existing.content_hash, existing.transaction_id
                );
                self.merge_tags(&tx, record.id, &existing, tags).await?;
                existing
            }
            None => {
                let anchor = match committed {
                    Some(transaction_id) => transaction_id,
                    None => self.latest_transaction(&tx, record.id).await?.ok_or_else(|| {
                        LarderError::not_found(format!(
                            "entity {} has no recorded history to checkpoint",
                            record.id
                        ))
                    })?,
                };
                let hash = self
                    .create_hash(&tx, record.id, anchor, content_hash)
                    .await?;
                self.merge_tags(&tx, record.id, &hash, tags).await?;
                hash
            }
        };

        self.set_current_version_hash(&tx, record.id, content_hash)
            .await?;
        tx.commit().await?;
        Ok(hash)
    }
}

#[async_trait]
impl EntityWriteApi for LarderStore {
    async fn create_entity(&self, input: NewEntity) -> LarderResult<EntityRecord> {
        let tx = self.conn.begin().await?;
        let record = self.insert_entity_state(&tx, input).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn update_entity(&self, record: &EntityRecord) -> LarderResult<Option<TransactionId>> {
        let tx = self.conn.begin().await?;
        let live = self.load_entity(&tx, record.id).await?;
        if live.content.kind() != record.content.kind() {
            return Err(LarderError::conflict(format!(
                "entity {} is a {}, its kind cannot change",
                record.id,
                live.content.kind().as_str()
            )));
        }
        if record.content == live.content && record.collection_id == live.collection_id {
            tx.commit().await?;
            return Ok(None);
        }
        let transaction_id = self.commit_entity_update(&tx, record).await?;
        tx.commit().await?;
        Ok(Some(transaction_id))
    }

    async fn get_entity(&self, entity_id: EntityId) -> LarderResult<EntityRecord> {
        self.load_entity(&self.conn, entity_id).await
    }
}

#[async_trait]
impl CheckpointApi for LarderStore {
    async fn checkpoint(
        &self,
        record: &EntityRecord,
        tags: &[String],
    ) -> LarderResult<VersionHash> {
        let content_hash = canonical::content_hash(&record.content);
        match self.checkpoint_once(record, &content_hash, tags).await {
            Err(err) if err.is_conflict() => {
                // Lost the unique-constraint race against a concurrent
                // checkpoint; the winner's row exists now, so one retry
                // lands on the tag-merge path.
                debug!(
                    "checkpoint of entity {} hit {err}; retrying as tag merge",
                    record.id
                );
                self.checkpoint_once(record, &content_hash, tags).await
            }
            result => result,
        }
    }

    async fn create_entity_checkpointed(
        &self,
        input: NewEntity,
        tags: &[String],
    ) -> LarderResult<(EntityRecord, VersionHash)> {
        let mut record = self.create_entity(input).await?;
        let hash = self.checkpoint(&record, tags).await?;
        record.current_version_hash = Some(hash.content_hash.clone());
        Ok((record, hash))
    }

    async fn tag_version(
        &self,
        entity_id: EntityId,
        version_ref: &str,
        tag_name: &str,
    ) -> LarderResult<VersionTag> {
        ensure_tag_name_resolvable(tag_name)?;
        let resolved = self.resolve_version(entity_id, version_ref).await?;
        let hash = resolved.hash.ok_or_else(|| {
            LarderError::not_found(format!(
                "version '{version_ref}' of entity {entity_id} was never checkpointed; nothing to tag"
            ))
        })?;
        let tx = self.conn.begin().await?;
        if self.find_tag(&tx, entity_id, tag_name).await?.is_some() {
            return Err(LarderError::duplicate_tag(format!(
                "tag '{tag_name}' already exists for entity {entity_id}"
            )));
        }
        let tag = self.insert_tag(&tx, hash.id, tag_name).await?;
        tx.commit().await?;
        Ok(tag)
    }
}

#[async_trait]
impl VersionReadApi for LarderStore {
    async fn resolve_version(
        &self,
        entity_id: EntityId,
        version_ref: &str,
    ) -> LarderResult<ResolvedVersion> {
        let conn = &self.conn;
        match VersionRef::parse(version_ref)? {
            VersionRef::Hash(content_hash) => {
                let hash = self
                    .find_hash(conn, entity_id, &content_hash)
                    .await?
                    .ok_or_else(|| {
                        LarderError::not_found(format!(
                            "version hash {content_hash} not found for entity {entity_id}"
                        ))
                    })?;
                let index = self.snapshot_index(conn, entity_id, hash.transaction_id).await?;
                Ok(ResolvedVersion {
                    transaction_id: hash.transaction_id,
                    index,
                    hash: Some(hash),
                })
            }
            VersionRef::Tag(tag_name) => {
                let tag = self
                    .find_tag(conn, entity_id, &tag_name)
                    .await?
                    .ok_or_else(|| {
                        LarderError::not_found(format!(
                            "version tag '{tag_name}' not found for entity {entity_id}"
                        ))
                    })?;
                let hash = self
                    .find_hash_by_id(conn, tag.version_hash_id)
                    .await?
                    .ok_or_else(|| {
                        LarderError::internal(format!(
                            "tag '{tag_name}' points at missing version hash {}",
                            tag.version_hash_id
                        ))
                    })?;
                let index = self.snapshot_index(conn, entity_id, hash.transaction_id).await?;
                Ok(ResolvedVersion {
                    transaction_id: hash.transaction_id,
                    index,
                    hash: Some(hash),
                })
            }
            VersionRef::Index(raw_index) => {
                let total = self.count_snapshots(conn, entity_id).await? as i64;
                if total == 0 {
                    return Err(LarderError::not_found(format!(
                        "entity {entity_id} has no version history"
                    )));
                }
                let index = if raw_index < 0 {
                    total + raw_index
                } else {
                    raw_index
                };
                if index < 0 || index >= total {
                    return Err(LarderError::not_found(format!(
                        "version index {version_ref} out of range (0-{}) for entity {entity_id}",
                        total - 1
                    )));
                }
                let transaction_id = self
                    .transaction_at_index(conn, entity_id, index as u64)
                    .await?;
                let hash = self
                    .find_hash_by_transaction(conn, entity_id, transaction_id)
                    .await?;
                Ok(ResolvedVersion {
                    transaction_id,
                    hash,
                    index,
                })
            }
        }
    }

    async fn get_version_data(
        &self,
        entity_id: EntityId,
        version_ref: &str,
    ) -> LarderResult<VersionSnapshot> {
        let conn = &self.conn;
        let resolved = self.resolve_version(entity_id, version_ref).await?;
        let base = self
            .load_base_snapshot(conn, entity_id, resolved.transaction_id)
            .await?;

        let kind = read_entity_kind(&base, LarderEntitySnapshots::EntityKind)?;
        let operation_type = read_operation_type(&base)?;
        let name: String = base.try_get("", &col_name(LarderEntitySnapshots::Name))?;
        let asset_origin: Option<String> =
            base.try_get("", &col_name(LarderEntitySnapshots::AssetOrigin))?;
        let is_private: bool = base.try_get("", &col_name(LarderEntitySnapshots::IsPrivate))?;
        let metadata = json_from_column(
            base.try_get("", &col_name(LarderEntitySnapshots::Metadata))?,
            "entity snapshot metadata",
        )?;
        let detail = self
            .load_detail_snapshot(conn, entity_id, resolved.transaction_id, kind)
            .await?;

        let tags = match &resolved.hash {
            Some(hash) => self
                .tags_for_hashes(conn, &[hash.id.as_i64()])
                .await?
                .remove(&hash.id.as_i64())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let created_at = match &resolved.hash {
            Some(hash) => Some(hash.created_at),
            None => {
                self.ledger_issued_at(conn, resolved.transaction_id)
                    .await?
            }
        };

        Ok(VersionSnapshot {
            index: resolved.index,
            transaction_id: resolved.transaction_id,
            content_hash: resolved.hash.map(|hash| hash.content_hash),
            tags,
            created_at,
            operation_type,
            content: EntityContent {
                name,
                asset_origin,
                is_private,
                metadata,
                detail,
            },
        })
    }

    async fn list_history(
        &self,
        entity_id: EntityId,
        input: ListHistoryInput,
    ) -> LarderResult<HistoryPage> {
        let conn = &self.conn;
        // The live row must exist; its kind picks the changeset table.
        let live = self.load_entity(conn, entity_id).await?;
        let kind = live.content.kind();

        let total = self.count_snapshots(conn, entity_id).await?;
        if total == 0 || input.skip >= total || input.limit == 0 {
            return Ok(HistoryPage {
                items: Vec::new(),
                total,
            });
        }

        let select = Query::select()
            .from(LarderEntitySnapshots::Table)
            .columns([
                LarderEntitySnapshots::TransactionId,
                LarderEntitySnapshots::OperationType,
            ])
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .order_by(LarderEntitySnapshots::TransactionId, Order::Desc)
            .offset(input.skip)
            .limit(input.limit)
            .to_owned();
        let rows = query_all(conn, &select).await?;

        let mut page: Vec<(TransactionId, OperationType)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let transaction_id: i64 =
                row.try_get("", &col_name(LarderEntitySnapshots::TransactionId))?;
            page.push((TransactionId(transaction_id), read_operation_type(row)?));
        }
        let page_txids: Vec<i64> = page.iter().map(|(tx, _)| tx.as_i64()).collect();

        // Hash and tag annotations are batched per page, never per row.
        let mut hashes_by_tx: HashMap<i64, VersionHash> = HashMap::new();
        let hash_select = version_hash_select()
            .and_where(Expr::col(LarderVersionHashes::EntityId).eq(entity_id.as_i64()))
            .and_where(Expr::col(LarderVersionHashes::TransactionId).is_in(page_txids.clone()))
            .to_owned();
        for row in query_all(conn, &hash_select).await? {
            let hash = read_version_hash(&row)?;
            hashes_by_tx.insert(hash.transaction_id.as_i64(), hash);
        }
        let hash_ids: Vec<i64> = hashes_by_tx
            .values()
            .map(|hash| hash.id.as_i64())
            .collect();
        let mut tags_by_hash = self.tags_for_hashes(conn, &hash_ids).await?;

        let mut issued_by_tx: HashMap<i64, i64> = HashMap::new();
        let issued_select = Query::select()
            .from(LarderTransactions::Table)
            .columns([LarderTransactions::Id, LarderTransactions::IssuedAt])
            .and_where(Expr::col(LarderTransactions::Id).is_in(page_txids.clone()))
            .to_owned();
        for row in query_all(conn, &issued_select).await? {
            let id: i64 = row.try_get("", &col_name(LarderTransactions::Id))?;
            let issued_at: i64 = row.try_get("", &col_name(LarderTransactions::IssuedAt))?;
            issued_by_tx.insert(id, issued_at);
        }

        let mut changesets_by_tx: HashMap<i64, JsonValue> = HashMap::new();
        if input.include_changeset {
            changesets_by_tx = self
                .load_changesets(conn, entity_id, kind, &page_txids)
                .await?;
        }

        let mut items = Vec::with_capacity(page.len());
        for (position, (transaction_id, operation_type)) in page.into_iter().enumerate() {
            let index = (total - input.skip) as i64 - position as i64 - 1;
            let hash = hashes_by_tx.remove(&transaction_id.as_i64());
            let tags = hash
                .as_ref()
                .and_then(|hash| tags_by_hash.remove(&hash.id.as_i64()))
                .unwrap_or_default();
            let created_at = hash
                .as_ref()
                .map(|hash| hash.created_at)
                .or_else(|| {
                    issued_by_tx
                        .get(&transaction_id.as_i64())
                        .map(|ms| datetime_from_millis(*ms))
                });
            items.push(HistoryItem {
                index,
                transaction_id,
                operation_type,
                content_hash: hash.map(|hash| hash.content_hash),
                tags,
                created_at,
                changeset: changesets_by_tx.remove(&transaction_id.as_i64()),
            });
        }

        Ok(HistoryPage { items, total })
    }
}

impl LarderStore {
    /// Field-value projection of each page transaction's subtype snapshot,
    /// fetched in one query per page. Despite the historical "changeset"
    /// name this is not a diff.
    async fn load_changesets<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
        kind: EntityKind,
        transaction_ids: &[i64],
    ) -> LarderResult<HashMap<i64, JsonValue>> {
        let mut projections = HashMap::new();
        if transaction_ids.is_empty() {
            return Ok(projections);
        }
        let select = match kind {
            EntityKind::Dataset => Query::select()
                .from(LarderDatasetSnapshots::Table)
                .columns([
                    LarderDatasetSnapshots::TransactionId,
                    LarderDatasetSnapshots::DataPath,
                    LarderDatasetSnapshots::Format,
                    LarderDatasetSnapshots::MetadataVersion,
                    LarderDatasetSnapshots::DatasetMetadata,
                    LarderDatasetSnapshots::LongDescription,
                ])
                .and_where(Expr::col(LarderDatasetSnapshots::EntityId).eq(entity_id.as_i64()))
                .and_where(
                    Expr::col(LarderDatasetSnapshots::TransactionId)
                        .is_in(transaction_ids.to_vec()),
                )
                .to_owned(),
            EntityKind::TrainedModel => Query::select()
                .from(LarderTrainedModelSnapshots::Table)
                .columns([
                    LarderTrainedModelSnapshots::TransactionId,
                    LarderTrainedModelSnapshots::ModelPath,
                    LarderTrainedModelSnapshots::MetadataVersion,
                    LarderTrainedModelSnapshots::ModelMetadata,
                    LarderTrainedModelSnapshots::LongDescription,
                    LarderTrainedModelSnapshots::ModelAttributes,
                ])
                .and_where(
                    Expr::col(LarderTrainedModelSnapshots::EntityId).eq(entity_id.as_i64()),
                )
                .and_where(
                    Expr::col(LarderTrainedModelSnapshots::TransactionId)
                        .is_in(transaction_ids.to_vec()),
                )
                .to_owned(),
            EntityKind::Task => Query::select()
                .from(LarderTaskSnapshots::Table)
                .columns([
                    LarderTaskSnapshots::TransactionId,
                    LarderTaskSnapshots::Workflow,
                    LarderTaskSnapshots::Version,
                    LarderTaskSnapshots::Description,
                    LarderTaskSnapshots::HasFileUploads,
                ])
                .and_where(Expr::col(LarderTaskSnapshots::EntityId).eq(entity_id.as_i64()))
                .and_where(
                    Expr::col(LarderTaskSnapshots::TransactionId)
                        .is_in(transaction_ids.to_vec()),
                )
                .to_owned(),
        };
        for row in query_all(conn, &select).await? {
            let transaction_id: i64 = row.try_get("", "transaction_id")?;
            let detail = read_detail(&row, kind)?;
            let fields = match detail {
                EntityDetail::Dataset(fields) => serde_json::to_value(fields),
                EntityDetail::TrainedModel(fields) => serde_json::to_value(fields),
                EntityDetail::Task(fields) => serde_json::to_value(fields),
            }
            .map_err(|err| LarderError::storage(format!("project changeset: {err}")))?;
            projections.insert(transaction_id, fields);
        }
        Ok(projections)
    }

    async fn lock_entity_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: EntityId,
    ) -> LarderResult<()> {
        // SQLite serializes writers at the connection level; row locks are
        // only meaningful on the server backends.
        if self.backend == DatabaseBackend::Sqlite {
            return Ok(());
        }
        let select = Query::select()
            .from(LarderEntities::Table)
            .column(LarderEntities::Id)
            .and_where(Expr::col(LarderEntities::Id).eq(entity_id.as_i64()))
            .lock(LockType::Update)
            .to_owned();
        query_one(conn, &select).await?;
        Ok(())
    }
}

#[async_trait]
impl PurgeApi for LarderStore {
    async fn purge_entity(&self, entity_id: EntityId) -> LarderResult<()> {
        let tx = self.conn.begin().await?;
        self.lock_entity_row(&tx, entity_id).await?;
        let live = self.load_entity(&tx, entity_id).await?;
        let kind = live.content.kind();

        // Audit anchors before touching anything: a hash row whose anchor
        // transaction has no snapshot means the substrate and the version
        // store disagree, and that must surface rather than vanish with
        // the purge.
        let hash_select = version_hash_select()
            .and_where(Expr::col(LarderVersionHashes::EntityId).eq(entity_id.as_i64()))
            .to_owned();
        let hash_rows = query_all(&tx, &hash_select).await?;
        let mut hash_count = 0u64;
        for row in hash_rows {
            let hash = read_version_hash(&row)?;
            self.snapshot_index(&tx, entity_id, hash.transaction_id)
                .await
                .map_err(|err| match err {
                    LarderError::Internal { message } => LarderError::internal(format!(
                        "refusing purge of entity {entity_id}: {message}"
                    )),
                    other => other,
                })?;
            hash_count += 1;
        }

        let hash_id_subquery = Query::select()
            .from(LarderVersionHashes::Table)
            .column(LarderVersionHashes::Id)
            .and_where(Expr::col(LarderVersionHashes::EntityId).eq(entity_id.as_i64()))
            .to_owned();
        let delete_tags = Query::delete()
            .from_table(LarderVersionTags::Table)
            .and_where(
                Expr::col(LarderVersionTags::VersionHashId).in_subquery(hash_id_subquery),
            )
            .to_owned();
        exec(&tx, &delete_tags).await?;

        let delete_hashes = Query::delete()
            .from_table(LarderVersionHashes::Table)
            .and_where(Expr::col(LarderVersionHashes::EntityId).eq(entity_id.as_i64()))
            .to_owned();
        exec(&tx, &delete_hashes).await?;

        let delete_detail_snapshots = match kind {
            EntityKind::Dataset => Query::delete()
                .from_table(LarderDatasetSnapshots::Table)
                .and_where(Expr::col(LarderDatasetSnapshots::EntityId).eq(entity_id.as_i64()))
                .to_owned(),
            EntityKind::TrainedModel => Query::delete()
                .from_table(LarderTrainedModelSnapshots::Table)
                .and_where(
                    Expr::col(LarderTrainedModelSnapshots::EntityId).eq(entity_id.as_i64()),
                )
                .to_owned(),
            EntityKind::Task => Query::delete()
                .from_table(LarderTaskSnapshots::Table)
                .and_where(Expr::col(LarderTaskSnapshots::EntityId).eq(entity_id.as_i64()))
                .to_owned(),
        };
        exec(&tx, &delete_detail_snapshots).await?;

        let delete_base_snapshots = Query::delete()
            .from_table(LarderEntitySnapshots::Table)
            .and_where(Expr::col(LarderEntitySnapshots::EntityId).eq(entity_id.as_i64()))
            .to_owned();
        exec(&tx, &delete_base_snapshots).await?;

        let delete_live_detail = match kind {
            EntityKind::Dataset => Query::delete()
                .from_table(LarderDatasets::Table)
                .and_where(Expr::col(LarderDatasets::EntityId).eq(entity_id.as_i64()))
                .to_owned(),
            EntityKind::TrainedModel => Query::delete()
                .from_table(LarderTrainedModels::Table)
                .and_where(Expr::col(LarderTrainedModels::EntityId).eq(entity_id.as_i64()))
                .to_owned(),
            EntityKind::Task => Query::delete()
                .from_table(LarderTasks::Table)
                .and_where(Expr::col(LarderTasks::EntityId).eq(entity_id.as_i64()))
                .to_owned(),
        };
        exec(&tx, &delete_live_detail).await?;

        let delete_live_base = Query::delete()
            .from_table(LarderEntities::Table)
            .and_where(Expr::col(LarderEntities::Id).eq(entity_id.as_i64()))
            .to_owned();
        exec(&tx, &delete_live_base).await?;

        tx.commit().await?;
        info!(
            "purged {} entity {entity_id} with {hash_count} checkpointed versions",
            kind.as_str()
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Row and statement helpers.
// ----------------------------------------------------------------------

fn version_hash_select() -> sea_query::SelectStatement {
    Query::select()
        .from(LarderVersionHashes::Table)
        .columns([
            LarderVersionHashes::Id,
            LarderVersionHashes::EntityId,
            LarderVersionHashes::TransactionId,
            LarderVersionHashes::ContentHash,
            LarderVersionHashes::CreatedAt,
        ])
        .to_owned()
}

fn read_version_hash(row: &QueryResult) -> LarderResult<VersionHash> {
    let id: i64 = row.try_get("", &col_name(LarderVersionHashes::Id))?;
    let entity_id: i64 = row.try_get("", &col_name(LarderVersionHashes::EntityId))?;
    let transaction_id: i64 = row.try_get("", &col_name(LarderVersionHashes::TransactionId))?;
    let content_hash: String = row.try_get("", &col_name(LarderVersionHashes::ContentHash))?;
    let created_at: i64 = row.try_get("", &col_name(LarderVersionHashes::CreatedAt))?;
    Ok(VersionHash {
        id: VersionHashId(id),
        entity_id: EntityId(entity_id),
        transaction_id: TransactionId(transaction_id),
        content_hash,
        created_at: datetime_from_millis(created_at),
    })
}

fn read_version_tag(row: &QueryResult) -> LarderResult<VersionTag> {
    let id: i64 = row.try_get("", &col_name(LarderVersionTags::Id))?;
    let version_hash_id: i64 = row.try_get("", &col_name(LarderVersionTags::VersionHashId))?;
    let tag_name: String = row.try_get("", &col_name(LarderVersionTags::TagName))?;
    Ok(VersionTag {
        id: VersionTagId(id),
        version_hash_id: VersionHashId(version_hash_id),
        tag_name,
    })
}

fn read_entity_kind(row: &QueryResult, column: impl sea_query::Iden) -> LarderResult<EntityKind> {
    let raw: String = row.try_get("", &col_name(column))?;
    EntityKind::from_str(&raw)
        .ok_or_else(|| LarderError::storage(format!("unknown entity kind '{raw}'")))
}

fn read_operation_type(row: &QueryResult) -> LarderResult<OperationType> {
    let raw: i16 = row.try_get("", &col_name(LarderEntitySnapshots::OperationType))?;
    OperationType::from_i16(raw)
        .ok_or_else(|| LarderError::storage(format!("unknown operation type {raw}")))
}

fn read_detail(row: &QueryResult, kind: EntityKind) -> LarderResult<EntityDetail> {
    match kind {
        EntityKind::Dataset => {
            let data_path: String = row.try_get("", &col_name(LarderDatasets::DataPath))?;
            let format: String = row.try_get("", &col_name(LarderDatasets::Format))?;
            let metadata_version: Option<String> =
                row.try_get("", &col_name(LarderDatasets::MetadataVersion))?;
            let dataset_metadata = json_from_column(
                row.try_get("", &col_name(LarderDatasets::DatasetMetadata))?,
                "dataset metadata",
            )?;
            let long_description: Option<String> =
                row.try_get("", &col_name(LarderDatasets::LongDescription))?;
            Ok(EntityDetail::Dataset(DatasetFields {
                data_path,
                format,
                metadata_version,
                dataset_metadata,
                long_description,
            }))
        }
        EntityKind::TrainedModel => {
            let model_path: String = row.try_get("", &col_name(LarderTrainedModels::ModelPath))?;
            let metadata_version: Option<String> =
                row.try_get("", &col_name(LarderTrainedModels::MetadataVersion))?;
            let model_metadata = json_from_column(
                row.try_get("", &col_name(LarderTrainedModels::ModelMetadata))?,
                "model metadata",
            )?;
            let long_description: Option<String> =
                row.try_get("", &col_name(LarderTrainedModels::LongDescription))?;
            let model_attributes = json_from_column(
                row.try_get("", &col_name(LarderTrainedModels::ModelAttributes))?,
                "model attributes",
            )?;
            Ok(EntityDetail::TrainedModel(TrainedModelFields {
                model_path,
                metadata_version,
                model_metadata,
                long_description,
                model_attributes,
            }))
        }
        EntityKind::Task => {
            let workflow_raw: String = row.try_get("", &col_name(LarderTasks::Workflow))?;
            let workflow: JsonValue = serde_json::from_str(&workflow_raw)
                .map_err(|err| LarderError::storage(format!("decode task workflow: {err}")))?;
            let version: Option<String> = row.try_get("", &col_name(LarderTasks::Version))?;
            let description: Option<String> =
                row.try_get("", &col_name(LarderTasks::Description))?;
            let has_file_uploads: bool =
                row.try_get("", &col_name(LarderTasks::HasFileUploads))?;
            Ok(EntityDetail::Task(TaskFields {
                workflow,
                version,
                description,
                has_file_uploads,
            }))
        }
    }
}

fn ensure_tag_name_resolvable(tag_name: &str) -> LarderResult<()> {
    if tag_name.is_empty() {
        return Err(LarderError::invalid_reference("tag name must not be empty"));
    }
    // A name shaped like a hash or an index reference could never be
    // resolved back to the tag.
    if is_content_hash(tag_name) {
        return Err(LarderError::invalid_reference(format!(
            "tag name '{tag_name}' reads as a content hash"
        )));
    }
    if tag_name.starts_with('~') {
        return Err(LarderError::invalid_reference(format!(
            "tag name '{tag_name}' reads as an index reference"
        )));
    }
    Ok(())
}

fn json_to_column(value: Option<&JsonValue>) -> Option<String> {
    value.map(JsonValue::to_string)
}

fn json_from_column(raw: Option<String>, context: &str) -> LarderResult<Option<JsonValue>> {
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| LarderError::storage(format!("decode {context}: {err}"))),
        None => Ok(None),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn exec<C, S>(conn: &C, stmt: &S) -> LarderResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> LarderResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> LarderResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

/// Insert and hand back the generated primary key. MySQL reports it on the
/// exec result; the other backends go through RETURNING.
async fn insert_returning_id<C>(
    conn: &C,
    insert: &mut sea_query::InsertStatement,
    id_col: &str,
) -> LarderResult<i64>
where
    C: ConnectionTrait,
{
    let backend = conn.get_database_backend();
    match backend {
        DatabaseBackend::MySql => {
            let (sql, values) = build_stmt(backend, insert);
            let result = conn
                .execute(Statement::from_sql_and_values(backend, sql, values))
                .await?;
            Ok(result.last_insert_id() as i64)
        }
        _ => {
            insert.returning_col(Alias::new(id_col));
            let (sql, values) = build_stmt(backend, insert);
            let row = conn
                .query_one(Statement::from_sql_and_values(backend, sql, values))
                .await?
                .ok_or_else(|| LarderError::storage("insert returned no row"))?;
            let id: i64 = row.try_get("", id_col)?;
            Ok(id)
        }
    }
}

fn build_connection_url(config: &LarderConfig, base_dir: &Path) -> LarderResult<String> {
    match config.connection_url() {
        Some(url) => Ok(url.to_string()),
        None => {
            let path = config.sqlite_path(base_dir)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| LarderError::storage(format!("create sqlite dir: {err}")))?;
            }
            Ok(format!("sqlite://{}?mode=rwc", path.to_string_lossy()))
        }
    }
}
