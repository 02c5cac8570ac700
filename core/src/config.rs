//! Server configuration.
//!
//! Loaded from a TOML file with serde defaults for every field, so an
//! empty or missing file yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the gatekeeper listens on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory holding the puzzle files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Liveness probe interval and timeout, seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Quiet period before a dirty document is persisted, seconds
    #[serde(default = "default_save_debounce")]
    pub save_debounce_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8013".to_string()
}

fn default_data_dir() -> PathBuf {
    // $XDG_DATA_DIR/gridfill/puzzles, with a relative fallback
    if let Some(mut dir) = dirs::data_dir() {
        dir.push("gridfill/puzzles");
        return dir;
    }
    PathBuf::from("./puzzles")
}

fn default_ping_timeout() -> u64 {
    60
}

fn default_save_debounce() -> u64 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: default_data_dir(),
            ping_timeout_secs: default_ping_timeout(),
            save_debounce_secs: default_save_debounce(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from the default location, or fall back to defaults
    pub fn load_or_default() -> Self {
        let Some(mut path) = dirs::config_dir() else {
            return Self::default();
        };
        path.push("gridfill/config.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("failed to load {}: {e}, using defaults", path.display());
                }
            }
        }
        Self::default()
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_secs(self.save_debounce_secs)
    }
}
