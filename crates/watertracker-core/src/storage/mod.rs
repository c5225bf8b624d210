mod config;
pub mod database;
pub mod kv;

pub use config::{AdsSettings, Config, LoggingConfig};
pub use database::Database;
pub use kv::{KeyValueStore, MemoryStore, ModelStore};

use std::path::PathBuf;

/// Returns `~/.config/watertracker[-dev]/` based on WATERTRACKER_ENV.
///
/// Set WATERTRACKER_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("WATERTRACKER_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("watertracker-dev")
    } else {
        base_dir.join("watertracker")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
