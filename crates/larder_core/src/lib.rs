pub mod api;
pub mod canonical;
pub mod entity;
pub mod error;
pub mod ids;
pub mod version;

pub use api::*;
pub use canonical::{canonical_json, content_hash};
pub use entity::*;
pub use error::{LarderError, LarderResult};
pub use ids::*;
pub use version::*;
