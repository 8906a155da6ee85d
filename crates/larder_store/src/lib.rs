pub mod config;
pub mod datastore;
mod db;
pub mod migration;
pub mod store;

pub mod api {
    pub use larder_core::api::*;
}

pub use larder_core::*;
pub use config::{DatabaseConfig, LarderConfig, PoolConfig};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store};
pub use store::LarderStore;
