use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{CollectionId, EntityId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Dataset,
    TrainedModel,
    Task,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Dataset => "dataset",
            EntityKind::TrainedModel => "trained_model",
            EntityKind::Task => "task",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "dataset" => Some(EntityKind::Dataset),
            "trained_model" => Some(EntityKind::TrainedModel),
            "task" => Some(EntityKind::Task),
            _ => None,
        }
    }
}

/// Operation kind the substrate records for a raw snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl OperationType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(OperationType::Insert),
            1 => Some(OperationType::Update),
            2 => Some(OperationType::Delete),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetFields {
    pub data_path: String,
    pub format: String,
    pub metadata_version: Option<String>,
    pub dataset_metadata: Option<JsonValue>,
    pub long_description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainedModelFields {
    pub model_path: String,
    pub metadata_version: Option<String>,
    pub model_metadata: Option<JsonValue>,
    pub long_description: Option<String>,
    pub model_attributes: Option<JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    pub workflow: JsonValue,
    pub version: Option<String>,
    pub description: Option<String>,
    pub has_file_uploads: bool,
}

/// Kind-specific half of an entity. Reconstruction dispatches on this
/// variant rather than probing column presence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityDetail {
    Dataset(DatasetFields),
    TrainedModel(TrainedModelFields),
    Task(TaskFields),
}

impl EntityDetail {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityDetail::Dataset(_) => EntityKind::Dataset,
            EntityDetail::TrainedModel(_) => EntityKind::TrainedModel,
            EntityDetail::Task(_) => EntityKind::Task,
        }
    }
}

/// The semantically relevant field state of an entity: exactly the fields
/// the canonicalizer digests. Bookkeeping (row id, creation timestamp,
/// owning collection) lives on [`EntityRecord`] instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityContent {
    pub name: String,
    pub asset_origin: Option<String>,
    pub is_private: bool,
    pub metadata: Option<JsonValue>,
    pub detail: EntityDetail,
}

impl EntityContent {
    pub fn kind(&self) -> EntityKind {
        self.detail.kind()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub collection_id: Option<CollectionId>,
    pub created_at: DateTime<Utc>,
    pub current_version_hash: Option<String>,
    pub content: EntityContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub collection_id: Option<CollectionId>,
    pub content: EntityContent,
}

#[cfg(test)]
mod tests {
    use super::{EntityKind, OperationType};

    #[test]
    fn kind_roundtrips_discriminator() {
        for kind in [
            EntityKind::Dataset,
            EntityKind::TrainedModel,
            EntityKind::Task,
        ] {
            assert_eq!(EntityKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::from_str("collection"), None);
    }

    #[test]
    fn operation_type_roundtrips_i16() {
        for op in [
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete,
        ] {
            assert_eq!(OperationType::from_i16(op.as_i16()), Some(op));
        }
        assert_eq!(OperationType::from_i16(7), None);
    }
}
