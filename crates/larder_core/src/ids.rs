use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn as_i64(self) -> i64 {
                self.0
            }

            pub fn from_i64(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(EntityId);
row_id!(CollectionId);
row_id!(TransactionId);
row_id!(VersionHashId);
row_id!(VersionTagId);

#[cfg(test)]
mod tests {
    use super::{EntityId, TransactionId};

    #[test]
    fn ids_roundtrip_and_order() {
        let id = EntityId::from_i64(42);
        assert_eq!(id.as_i64(), 42);
        assert_eq!(id.to_string(), "42");
        assert!(TransactionId(2) > TransactionId(1));
    }
}
