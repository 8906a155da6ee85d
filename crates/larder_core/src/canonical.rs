use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::entity::{EntityContent, EntityDetail};

/// Serialize a JSON value into its canonical text form: object keys sorted
/// lexicographically, array order preserved, numbers in serde_json's
/// shortest rendering.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Digest of an entity's semantic field state: 64 lowercase hex chars of
/// SHA-256 over the canonical serialization.
pub fn content_hash(content: &EntityContent) -> String {
    let canonical = canonical_json(&content_value(content));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Flat field map fed to the hash: shared fields plus the kind's fields.
/// Absent optionals serialize as null so the key set is stable per kind.
fn content_value(content: &EntityContent) -> JsonValue {
    let mut fields = Map::new();
    fields.insert("name".to_string(), JsonValue::String(content.name.clone()));
    fields.insert(
        "entity_type".to_string(),
        JsonValue::String(content.kind().as_str().to_string()),
    );
    fields.insert(
        "asset_origin".to_string(),
        opt_string(content.asset_origin.as_deref()),
    );
    fields.insert("is_private".to_string(), JsonValue::Bool(content.is_private));
    fields.insert("metadata".to_string(), opt_json(content.metadata.as_ref()));

    match &content.detail {
        EntityDetail::Dataset(dataset) => {
            fields.insert(
                "data_path".to_string(),
                JsonValue::String(dataset.data_path.clone()),
            );
            fields.insert(
                "format".to_string(),
                JsonValue::String(dataset.format.clone()),
            );
            fields.insert(
                "metadata_version".to_string(),
                opt_string(dataset.metadata_version.as_deref()),
            );
            fields.insert(
                "dataset_metadata".to_string(),
                opt_json(dataset.dataset_metadata.as_ref()),
            );
            fields.insert(
                "long_description".to_string(),
                opt_string(dataset.long_description.as_deref()),
            );
        }
        EntityDetail::TrainedModel(model) => {
            fields.insert(
                "model_path".to_string(),
                JsonValue::String(model.model_path.clone()),
            );
            fields.insert(
                "metadata_version".to_string(),
                opt_string(model.metadata_version.as_deref()),
            );
            fields.insert(
                "model_metadata".to_string(),
                opt_json(model.model_metadata.as_ref()),
            );
            fields.insert(
                "long_description".to_string(),
                opt_string(model.long_description.as_deref()),
            );
            fields.insert(
                "model_attributes".to_string(),
                opt_json(model.model_attributes.as_ref()),
            );
        }
        EntityDetail::Task(task) => {
            fields.insert("workflow".to_string(), task.workflow.clone());
            fields.insert("version".to_string(), opt_string(task.version.as_deref()));
            fields.insert(
                "description".to_string(),
                opt_string(task.description.as_deref()),
            );
            fields.insert(
                "has_file_uploads".to_string(),
                JsonValue::Bool(task.has_file_uploads),
            );
        }
    }

    JsonValue::Object(fields)
}

fn opt_string(value: Option<&str>) -> JsonValue {
    match value {
        Some(value) => JsonValue::String(value.to_string()),
        None => JsonValue::Null,
    }
}

fn opt_json(value: Option<&JsonValue>) -> JsonValue {
    value.cloned().unwrap_or(JsonValue::Null)
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(true) => out.push_str("true"),
        JsonValue::Bool(false) => out.push_str("false"),
        JsonValue::Number(number) => out.push_str(&number.to_string()),
        JsonValue::String(text) => write_escaped(text, out),
        JsonValue::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (position, key) in keys.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_escaped(key.as_str(), out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(text: &str, out: &mut String) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
