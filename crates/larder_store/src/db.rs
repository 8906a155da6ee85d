use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum LarderTransactions {
    Table,
    Id,
    IssuedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderEntities {
    Table,
    Id,
    Name,
    EntityKind,
    AssetOrigin,
    CollectionId,
    IsPrivate,
    Metadata,
    CurrentVersionHash,
    CreatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderDatasets {
    Table,
    EntityId,
    DataPath,
    Format,
    MetadataVersion,
    DatasetMetadata,
    LongDescription,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderTrainedModels {
    Table,
    EntityId,
    ModelPath,
    MetadataVersion,
    ModelMetadata,
    LongDescription,
    ModelAttributes,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderTasks {
    Table,
    EntityId,
    Workflow,
    Version,
    Description,
    HasFileUploads,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderEntitySnapshots {
    Table,
    EntityId,
    TransactionId,
    OperationType,
    Name,
    EntityKind,
    AssetOrigin,
    CollectionId,
    IsPrivate,
    Metadata,
    CreatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderDatasetSnapshots {
    Table,
    EntityId,
    TransactionId,
    OperationType,
    DataPath,
    Format,
    MetadataVersion,
    DatasetMetadata,
    LongDescription,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderTrainedModelSnapshots {
    Table,
    EntityId,
    TransactionId,
    OperationType,
    ModelPath,
    MetadataVersion,
    ModelMetadata,
    LongDescription,
    ModelAttributes,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderTaskSnapshots {
    Table,
    EntityId,
    TransactionId,
    OperationType,
    Workflow,
    Version,
    Description,
    HasFileUploads,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderVersionHashes {
    Table,
    Id,
    EntityId,
    TransactionId,
    ContentHash,
    CreatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum LarderVersionTags {
    Table,
    Id,
    VersionHashId,
    TagName,
    CreatedAt,
}
