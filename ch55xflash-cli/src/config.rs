//! Configuration file support for ch55xflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CH55XFLASH_*)
//! 3. Local config file (./ch55xflash.toml)
//! 4. Global config file (~/.config/ch55xflash/config.toml)

use ch55xflash::SessionConfig;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project config file.
const LOCAL_CONFIG: &str = "ch55xflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port to use instead of USB (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud: Option<u32>,
}

/// Per-command timeouts in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Detect handshake.
    pub detect_ms: Option<u64>,
    /// Each write or verify chunk.
    pub write_ms: Option<u64>,
    /// Erase command.
    pub erase_ms: Option<u64>,
    /// Exit command.
    pub reset_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Command timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ch55xflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let timeouts = other.timeouts;
        self.timeouts.detect_ms = timeouts.detect_ms.or(self.timeouts.detect_ms);
        self.timeouts.write_ms = timeouts.write_ms.or(self.timeouts.write_ms);
        self.timeouts.erase_ms = timeouts.erase_ms.or(self.timeouts.erase_ms);
        self.timeouts.reset_ms = timeouts.reset_ms.or(self.timeouts.reset_ms);
    }

    /// Session settings with configured timeouts applied over the defaults.
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::default();
        if let Some(ms) = self.timeouts.detect_ms {
            session = session.with_detect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeouts.write_ms {
            session = session.with_write_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeouts.erase_ms {
            session = session.with_erase_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeouts.reset_ms {
            session = session.with_reset_timeout(Duration::from_millis(ms));
        }
        session
    }
}
