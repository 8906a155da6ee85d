use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, LarderError, LarderResult, TransactionId, VersionHashId, VersionTagId};

/// A content-addressable version record. `transaction_id` is the anchor:
/// the transaction that first produced this content for the entity. It does
/// not move when identical content recurs in a later transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionHash {
    pub id: VersionHashId,
    pub entity_id: EntityId,
    pub transaction_id: TransactionId,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Entity-scoped label pointing at one version-hash row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionTag {
    pub id: VersionTagId,
    pub version_hash_id: VersionHashId,
    pub tag_name: String,
}

/// Parsed form of a version reference string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionRef {
    Hash(String),
    Index(i64),
    Tag(String),
}

impl VersionRef {
    /// `hex64` reads as a content hash, `~` + integer as an index into the
    /// raw history (negative counts from the newest), anything else as a
    /// tag name. A `~` prefix with a non-integer suffix is malformed.
    pub fn parse(raw: &str) -> LarderResult<Self> {
        if let Some(rest) = raw.strip_prefix('~') {
            let index: i64 = rest.parse().map_err(|_| {
                LarderError::invalid_reference(format!(
                    "'{raw}' is not a valid index reference; expected '~' followed by an integer"
                ))
            })?;
            return Ok(VersionRef::Index(index));
        }
        if is_content_hash(raw) {
            return Ok(VersionRef::Hash(raw.to_string()));
        }
        Ok(VersionRef::Tag(raw.to_string()))
    }
}

/// True when `raw` has the shape of a rendered content hash.
pub fn is_content_hash(raw: &str) -> bool {
    raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Outcome of resolving a version reference. `hash` is absent when the
/// resolved transaction was never checkpointed. `index` is the ascending
/// position in the raw history, 0 = oldest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    pub transaction_id: TransactionId,
    pub hash: Option<VersionHash>,
    pub index: i64,
}

#[cfg(test)]
mod tests {
    use super::{is_content_hash, VersionRef};
    use crate::LarderError;

    const HEX64: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn parses_hash_refs() {
        assert_eq!(
            VersionRef::parse(HEX64).unwrap(),
            VersionRef::Hash(HEX64.to_string())
        );
        // uppercase hex is not a hash; it falls through to a tag name
        let upper = HEX64.to_uppercase();
        assert_eq!(
            VersionRef::parse(&upper).unwrap(),
            VersionRef::Tag(upper.clone())
        );
        assert!(!is_content_hash("deadbeef"));
    }

    #[test]
    fn parses_index_refs() {
        assert_eq!(VersionRef::parse("~0").unwrap(), VersionRef::Index(0));
        assert_eq!(VersionRef::parse("~-1").unwrap(), VersionRef::Index(-1));
        assert_eq!(VersionRef::parse("~12").unwrap(), VersionRef::Index(12));
    }

    #[test]
    fn malformed_index_is_invalid_not_missing() {
        for raw in ["~", "~abc", "~1.5", "~--2"] {
            let err = VersionRef::parse(raw).unwrap_err();
            assert!(
                matches!(err, LarderError::InvalidReference { .. }),
                "{raw} should be rejected as malformed"
            );
        }
    }

    #[test]
    fn everything_else_is_a_tag() {
        assert_eq!(
            VersionRef::parse("production").unwrap(),
            VersionRef::Tag("production".to_string())
        );
        assert_eq!(
            VersionRef::parse("v1.0.0").unwrap(),
            VersionRef::Tag("v1.0.0".to_string())
        );
    }
}
