use sea_orm_migration::prelude::*;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LarderTransactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderTransactions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LarderTransactions::IssuedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderEntities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderEntities::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LarderEntities::Name).string().not_null())
                    .col(
                        ColumnDef::new(LarderEntities::EntityKind)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderEntities::AssetOrigin).string())
                    .col(ColumnDef::new(LarderEntities::CollectionId).big_integer())
                    .col(
                        ColumnDef::new(LarderEntities::IsPrivate)
                            .boolean()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderEntities::Metadata).text())
                    .col(
                        ColumnDef::new(LarderEntities::CurrentVersionHash)
                            .string_len(64)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(LarderEntities::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderDatasets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderDatasets::EntityId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LarderDatasets::DataPath).string().not_null())
                    .col(ColumnDef::new(LarderDatasets::Format).string().not_null())
                    .col(ColumnDef::new(LarderDatasets::MetadataVersion).string())
                    .col(ColumnDef::new(LarderDatasets::DatasetMetadata).text())
                    .col(ColumnDef::new(LarderDatasets::LongDescription).text())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderTrainedModels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderTrainedModels::EntityId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LarderTrainedModels::ModelPath)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderTrainedModels::MetadataVersion).string())
                    .col(ColumnDef::new(LarderTrainedModels::ModelMetadata).text())
                    .col(ColumnDef::new(LarderTrainedModels::LongDescription).text())
                    .col(ColumnDef::new(LarderTrainedModels::ModelAttributes).text())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderTasks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderTasks::EntityId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LarderTasks::Workflow).text().not_null())
                    .col(ColumnDef::new(LarderTasks::Version).string())
                    .col(ColumnDef::new(LarderTasks::Description).text())
                    .col(
                        ColumnDef::new(LarderTasks::HasFileUploads)
                            .boolean()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderEntitySnapshots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::EntityId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::TransactionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::OperationType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::Name)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::EntityKind)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderEntitySnapshots::AssetOrigin).string())
                    .col(ColumnDef::new(LarderEntitySnapshots::CollectionId).big_integer())
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::IsPrivate)
                            .boolean()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderEntitySnapshots::Metadata).text())
                    .col(
                        ColumnDef::new(LarderEntitySnapshots::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_larder_entity_snapshots")
                            .col(LarderEntitySnapshots::EntityId)
                            .col(LarderEntitySnapshots::TransactionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderDatasetSnapshots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderDatasetSnapshots::EntityId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderDatasetSnapshots::TransactionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderDatasetSnapshots::OperationType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderDatasetSnapshots::DataPath)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderDatasetSnapshots::Format)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderDatasetSnapshots::MetadataVersion).string())
                    .col(ColumnDef::new(LarderDatasetSnapshots::DatasetMetadata).text())
                    .col(ColumnDef::new(LarderDatasetSnapshots::LongDescription).text())
                    .primary_key(
                        Index::create()
                            .name("pk_larder_dataset_snapshots")
                            .col(LarderDatasetSnapshots::EntityId)
                            .col(LarderDatasetSnapshots::TransactionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderTrainedModelSnapshots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderTrainedModelSnapshots::EntityId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderTrainedModelSnapshots::TransactionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderTrainedModelSnapshots::OperationType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderTrainedModelSnapshots::ModelPath)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderTrainedModelSnapshots::MetadataVersion).string())
                    .col(ColumnDef::new(LarderTrainedModelSnapshots::ModelMetadata).text())
                    .col(ColumnDef::new(LarderTrainedModelSnapshots::LongDescription).text())
                    .col(ColumnDef::new(LarderTrainedModelSnapshots::ModelAttributes).text())
                    .primary_key(
                        Index::create()
                            .name("pk_larder_trained_model_snapshots")
                            .col(LarderTrainedModelSnapshots::EntityId)
                            .col(LarderTrainedModelSnapshots::TransactionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderTaskSnapshots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderTaskSnapshots::EntityId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderTaskSnapshots::TransactionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderTaskSnapshots::OperationType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderTaskSnapshots::Workflow)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LarderTaskSnapshots::Version).string())
                    .col(ColumnDef::new(LarderTaskSnapshots::Description).text())
                    .col(
                        ColumnDef::new(LarderTaskSnapshots::HasFileUploads)
                            .boolean()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_larder_task_snapshots")
                            .col(LarderTaskSnapshots::EntityId)
                            .col(LarderTaskSnapshots::TransactionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderVersionHashes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderVersionHashes::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionHashes::EntityId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionHashes::TransactionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionHashes::ContentHash)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionHashes::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LarderVersionTags::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LarderVersionTags::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionTags::VersionHashId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionTags::TagName)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LarderVersionTags::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Two concurrent checkpoints computing the same new hash must not
        // both insert; the loser detects the violation and merges tags.
        manager
            .create_index(
                Index::create()
                    .name("larder_version_hashes_entity_content_uq")
                    .table(LarderVersionHashes::Table)
                    .col(LarderVersionHashes::EntityId)
                    .col(LarderVersionHashes::ContentHash)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("larder_version_hashes_entity_tx_idx")
                    .table(LarderVersionHashes::Table)
                    .col(LarderVersionHashes::EntityId)
                    .col(LarderVersionHashes::TransactionId)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("larder_version_tags_hash_name_uq")
                    .table(LarderVersionTags::Table)
                    .col(LarderVersionTags::VersionHashId)
                    .col(LarderVersionTags::TagName)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("larder_version_tags_name_idx")
                    .table(LarderVersionTags::Table)
                    .col(LarderVersionTags::TagName)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("larder_entities_current_hash_idx")
                    .table(LarderEntities::Table)
                    .col(LarderEntities::CurrentVersionHash)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LarderVersionTags::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderVersionHashes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderTaskSnapshots::Table).to_owned())
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(LarderTrainedModelSnapshots::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(LarderDatasetSnapshots::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderEntitySnapshots::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderTasks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderTrainedModels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderDatasets::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderEntities::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LarderTransactions::Table).to_owned())
            .await?;
        Ok(())
    }
}
