//! Init command implementation

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::Result;
use std::path::PathBuf;
use tracing::info;

/// Write a config under `base_dir` and create the catalog next to it.
/// An existing config is kept unless `force` resets it to defaults.
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<Config> {
    let base = base_dir.unwrap_or_else(Config::default_base_dir);
    let config_file = base.join("config.toml");
    if force && config_file.exists() {
        info!("Replacing existing config at {:?}", config_file);
        std::fs::remove_file(&config_file)?;
    }

    let config = Config::load_from(Some(base))?;
    config.save()?;

    let catalog = Catalog::connect(&config).await?;
    catalog.init_schema().await?;
    info!("Catalog ready at {:?}", config.paths.db_file);

    Ok(config)
}
