//! JSON config file helpers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::{Error, Result};

/// Load a JSON document from `path`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&raw).map_err(|e| {
        Error::config_with_source(format!("invalid JSON in {}", path.display()), e)
    })?;
    debug!(path = %path.display(), "Loaded config");
    Ok(value)
}

/// Write `value` as pretty JSON to `path`, creating parent directories.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| Error::config_with_source("failed to serialize config", e))?;
    std::fs::write(path, raw)?;
    Ok(())
}
