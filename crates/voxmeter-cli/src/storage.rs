use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use tracing::debug;
use voxmeter_ledger::FileLedger;

const LEDGER_FILE: &str = "ledger.json";

/// Resolve the default data directory for Voxmeter.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("voxmeter"))
}

/// Build the file-backed ledger, honoring a config override for its location.
pub fn ledger_from_config(config: &Config) -> Result<FileLedger> {
    let root = match &config.data_dir {
        Some(root) => {
            debug!(?root, "using ledger location from config");
            root.clone()
        }
        None => default_data_dir()?,
    };
    Ok(FileLedger::new(root.join(LEDGER_FILE)))
}
