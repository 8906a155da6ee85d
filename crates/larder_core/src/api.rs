use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    EntityContent, EntityId, EntityRecord, LarderResult, NewEntity, OperationType,
    ResolvedVersion, TransactionId, VersionHash, VersionTag,
};

/// Live entity reads and change-tracked writes. Every committed mutation
/// appends one raw snapshot pair tagged with a fresh transaction id; a
/// write that changes nothing commits nothing.
#[async_trait]
pub trait EntityWriteApi {
    async fn create_entity(&self, input: NewEntity) -> LarderResult<EntityRecord>;
    async fn update_entity(&self, record: &EntityRecord) -> LarderResult<Option<TransactionId>>;
    async fn get_entity(&self, entity_id: EntityId) -> LarderResult<EntityRecord>;
}

#[async_trait]
pub trait CheckpointApi {
    /// Record the entity's pending field state as a content-addressable
    /// version. The pending mutation is always durably committed; content
    /// dedup only decides whether a new hash row is created or the
    /// requested tags merge onto the existing one.
    async fn checkpoint(
        &self,
        record: &EntityRecord,
        tags: &[String],
    ) -> LarderResult<VersionHash>;

    /// Create an entity and checkpoint its initial state in one go. The
    /// resulting raw history has exactly one entry.
    async fn create_entity_checkpointed(
        &self,
        input: NewEntity,
        tags: &[String],
    ) -> LarderResult<(EntityRecord, VersionHash)>;

    /// Attach a tag to whatever version `version_ref` resolves to.
    async fn tag_version(
        &self,
        entity_id: EntityId,
        version_ref: &str,
        tag_name: &str,
    ) -> LarderResult<VersionTag>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ListHistoryInput {
    pub skip: u64,
    pub limit: u64,
    pub include_changeset: bool,
}

/// One raw-history entry, newest first in a page. The hash fields are only
/// present when a checkpoint is anchored to this exact transaction; a later
/// transaction that merely reproduces checkpointed content stays bare.
/// `changeset` is a field-value projection of this version, not a diff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub index: i64,
    pub transaction_id: TransactionId,
    pub operation_type: OperationType,
    pub content_hash: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub changeset: Option<JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub items: Vec<HistoryItem>,
    pub total: u64,
}

/// Complete field state of an entity at one resolved version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub index: i64,
    pub transaction_id: TransactionId,
    pub content_hash: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub operation_type: OperationType,
    pub content: EntityContent,
}

#[async_trait]
pub trait VersionReadApi {
    async fn resolve_version(
        &self,
        entity_id: EntityId,
        version_ref: &str,
    ) -> LarderResult<ResolvedVersion>;

    async fn get_version_data(
        &self,
        entity_id: EntityId,
        version_ref: &str,
    ) -> LarderResult<VersionSnapshot>;

    async fn list_history(
        &self,
        entity_id: EntityId,
        input: ListHistoryInput,
    ) -> LarderResult<HistoryPage>;
}

/// Ordered, all-or-nothing removal of an entity and its whole version
/// chain: tags, hashes, subtype snapshots, base snapshots, then the live
/// rows, bypassing the snapshot-capturing write path.
#[async_trait]
pub trait PurgeApi {
    async fn purge_entity(&self, entity_id: EntityId) -> LarderResult<()>;
}
