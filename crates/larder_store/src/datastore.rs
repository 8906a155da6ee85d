use std::path::{Path, PathBuf};

use crate::{LarderConfig, LarderResult, LarderStore};

const DEFAULT_DB_NAME: &str = "larder.sqlite";

pub fn load_or_init_config(base: &Path) -> LarderResult<LarderConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    LarderConfig::load_or_init(base, &default_sqlite)
}

pub async fn open_store(base: &Path) -> LarderResult<LarderStore> {
    let config = load_or_init_config(base)?;
    LarderStore::connect(&config, base).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}
