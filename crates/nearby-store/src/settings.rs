use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use nearby_core::Config;

use crate::error::{Result, StoreError};

const CONFIG_FILE: &str = "config.toml";
const DIRECTORY_DB: &str = "directory.db";

/// Default base directory for all nearby storage.
pub fn default_base_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".nearby")
}

/// Resolve the data directory.
/// Priority: explicit override > NEARBY_DATA_DIR env > ~/.nearby
pub fn resolve_base_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    env::var("NEARBY_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default_base_dir)
}

/// `config.toml` in the data directory.
///
/// Layout:
/// ```text
/// ~/.nearby/
/// ├── config.toml
/// └── directory.db
/// ```
pub struct SettingsStore {
    base: PathBuf,
}

impl SettingsStore {
    pub fn open(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(|e| {
            StoreError::Config(format!("failed to create {}: {e}", base_dir.display()))
        })?;
        Ok(Self {
            base: base_dir.to_path_buf(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILE)
    }

    pub fn directory_path(&self) -> PathBuf {
        self.base.join(DIRECTORY_DB)
    }

    /// Load the config; a missing file means defaults.
    pub fn load(&self) -> Result<Config> {
        let path = self.config_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(StoreError::Config(format!("failed to read {}: {e}", path.display())));
            }
        };
        parse_config(&text).map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        let path = self.config_path();
        let text = toml::to_string_pretty(config)
            .map_err(|e| StoreError::Config(format!("failed to encode config: {e}")))?;
        fs::write(&path, text)
            .map_err(|e| StoreError::Config(format!("failed to write {}: {e}", path.display())))?;
        tracing::info!("saved config to {}", path.display());
        Ok(())
    }

    /// Load, modify, save. Returns the saved config.
    pub fn update(&self, f: impl FnOnce(&mut Config)) -> Result<Config> {
        let mut config = self.load()?;
        f(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

fn parse_config(text: &str) -> std::result::Result<Config, toml::de::Error> {
    toml::from_str(text)
}
