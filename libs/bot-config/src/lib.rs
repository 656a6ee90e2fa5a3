//! Configuration layer: the ini files under `configs/` and the JSON setting
//! stores under `storage/cache/`.
//!
//! Every mutation is written atomically (temp file + rename) and fsynced so
//! a crash mid-save never truncates operator state.

pub mod auto_delivery;
pub mod auto_response;
pub mod main_config;
pub mod stores;

use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    File(#[from] std::io::Error),

    #[error("failed to parse ini: {0}")]
    Ini(#[from] ini::Error),

    #[error("failed to parse JSON store: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub use auto_delivery::{AutoDeliveryConfig, DeliveryRule};
pub use auto_response::{AutoReplyRule, AutoResponseConfig};
pub use main_config::MainConfig;

/// Atomic, durable write: temp file in the same directory, fsync, rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.cfg");
        write_atomic(&path, "first").unwrap();
        write_atomic(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }
}
