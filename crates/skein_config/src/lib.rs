//! skein_config
//!
//! Configuration surface for the broker. Settings come from an optional
//! `config/default` file and from the environment, merged over defaults:
//!
//! - `MY_SERVER_KEY`: shared secret for the upgrade gate; empty disables it.
//! - `STORAGE_TYPE`: `sled` (alias `badger`) for the embedded KV store,
//!   `sqlite` for the embedded SQL store, `none` or unset for no persistence.
//! - `STORAGE_PATH`: backend-specific path, default `./tmp/data`.
//! - `PORT_NUMBER`: listen port, 1-65535, default 8080.

use std::str::FromStr;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Which persistence provider to open at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// Embedded key-value store.
    Sled,
    /// Embedded SQL store.
    Sqlite,
    /// Discard writes, return nothing.
    #[default]
    None,
}

impl FromStr for StorageKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sled" | "badger" => Ok(Self::Sled),
            "sqlite" => Ok(Self::Sqlite),
            "" | "none" => Ok(Self::None),
            other => Err(SettingsError::UnknownStorageType(other.to_string())),
        }
    }
}

/// Runtime settings for the broker process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Shared secret checked against the `Authorization` header at upgrade
    /// time. An empty key disables the check.
    pub api_key: String,
    pub storage: StorageKind,
    pub storage_path: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            storage: StorageKind::None,
            storage_path: "./tmp/data".to_string(),
            port: 8080,
        }
    }
}

/// Partial settings as they arrive from files or the environment. Missing
/// values are filled from `Settings::default`.
#[derive(Debug, Deserialize)]
struct PartialSettings {
    my_server_key: Option<String>,
    storage_type: Option<String>,
    storage_path: Option<String>,
    port_number: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] ConfigError),
    #[error("unknown STORAGE_TYPE: {0}. Must be sled, badger, sqlite or none.")]
    UnknownStorageType(String),
    #[error("invalid PORT_NUMBER: {0}. Must be 1-65535.")]
    InvalidPort(u32),
}

pub fn load_config() -> Result<Settings, SettingsError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default());

    let partial: PartialSettings = builder.build()?.try_deserialize()?;
    let default = Settings::default();

    let storage = match partial.storage_type.as_deref() {
        Some(kind) => kind.parse()?,
        None => default.storage,
    };

    let port = match partial.port_number {
        Some(p) if (1..=65535).contains(&p) => p as u16,
        Some(p) => return Err(SettingsError::InvalidPort(p)),
        None => default.port,
    };

    Ok(Settings {
        api_key: partial.my_server_key.unwrap_or(default.api_key),
        storage,
        storage_path: partial.storage_path.unwrap_or(default.storage_path),
        port,
    })
}
