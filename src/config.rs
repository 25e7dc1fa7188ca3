//! Engine configuration
//!
//! Settings are read from `config.toml` in the platform config directory:
//! - Linux: ~/.config/castline/config.toml
//! - Windows: %APPDATA%\castline\config.toml
//! - macOS: ~/Library/Application Support/castline/config.toml
//!
//! A missing file means defaults. Values are validated on load.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::DEFAULT_STUN_SERVERS;

/// Application name used for the configuration directory
const APP_NAME: &str = "castline";

/// Signaling endpoint used by `connect_signaling`
pub const DEFAULT_SIGNALING_URL: &str = "wss://auth.castline.dev/ws";

/// Display id meaning "primary display" at the C boundary
pub const PRIMARY_DISPLAY: u32 = u32::MAX;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Host stream parameters as requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub keyframe_interval_ms: u32,
    /// `None` selects the primary display
    pub display_id: Option<u32>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 8000,
            keyframe_interval_ms: 2000,
            display_id: None,
        }
    }
}

impl HostConfig {
    /// Clamp every field into the supported range
    pub fn normalize(self) -> Self {
        Self {
            width: self.width.clamp(320, 7680),
            height: self.height.clamp(240, 4320),
            fps: self.fps.clamp(15, 240),
            bitrate_kbps: self.bitrate_kbps.clamp(1000, 100_000),
            keyframe_interval_ms: self.keyframe_interval_ms.clamp(250, 10_000),
            display_id: self.display_id.filter(|id| *id != PRIMARY_DISPLAY),
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Endpoint for `connect_signaling`
    pub signaling_url: String,
    /// STUN servers queried for the public address; empty disables STUN
    pub stun_servers: Vec<String>,
    /// Client handshake deadline
    pub connect_timeout_ms: u64,
    /// Silence after which a connected peer is considered gone
    pub peer_timeout_ms: u64,
    /// Deadline for opening and binding the signaling socket
    pub signaling_timeout_ms: u64,
    /// Deadline for an answer to a connect request
    pub request_timeout_ms: u64,
    /// STUN per-server timeout
    pub stun_timeout_ms: u64,
    /// How long `stop()` waits for workers before aborting them
    pub stop_grace_ms: u64,
    /// Consecutive per-frame media failures that end the session
    pub max_consecutive_media_errors: u32,
    /// Encoded frames buffered for sending before the oldest is dropped
    pub outbound_queue_frames: usize,
    /// Input events buffered on the client before new ones are refused
    pub input_queue_events: usize,
    /// Parameters used by `start_host`
    pub host: HostConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            connect_timeout_ms: 5000,
            peer_timeout_ms: 5000,
            signaling_timeout_ms: 5000,
            request_timeout_ms: 12_000,
            stun_timeout_ms: 1500,
            stop_grace_ms: 2000,
            max_consecutive_media_errors: 30,
            outbound_queue_frames: 4,
            input_queue_events: 256,
            host: HostConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::network::validate_url(&self.signaling_url)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("peer_timeout_ms", self.peer_timeout_ms),
            ("signaling_timeout_ms", self.signaling_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("stun_timeout_ms", self.stun_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        if self.outbound_queue_frames == 0 || self.input_queue_events == 0 {
            return Err(ConfigError::Invalid(
                "queue sizes must be positive".to_string(),
            ));
        }
        if self.max_consecutive_media_errors == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_media_errors must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from the platform config directory; a missing file gives defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path().ok_or(ConfigError::NoConfigDir)?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }
}

/// Get the configuration file path
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Default identity storage directory
pub fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().to_path_buf())
}
