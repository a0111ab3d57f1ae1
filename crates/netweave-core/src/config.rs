//! Configuration for a netweave peer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NETWEAVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/netweave/config.toml
//!   3. ~/.config/netweave/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::message::TopologyKind;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetweaveConfig {
    pub overlay: OverlayConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Topology a freshly opened channel runs. Joiners adopt the inviter's.
    pub topology: TopologyKind,
    /// Largest USER_DATA chunk body, in bytes.
    pub chunk_size: usize,
    pub ping_timeout_ms: u64,
    pub reachability_timeout_ms: u64,
    /// CAN_CLOSE waits reachability_timeout_ms × this.
    pub can_close_multiplier: u32,
    pub join_timeout_ms: u64,
    /// Spray shuffle period. 0 = no periodic shuffle.
    pub shuffle_interval_ms: u64,
    /// Relay hops a FORWARD_MESSAGE may take.
    pub forward_ttl: u8,
    /// Spray broadcasts remembered for duplicate suppression.
    pub broadcast_log_capacity: usize,
    /// Partially reassembled user messages older than this are dropped.
    pub reassembly_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Signaling server advertised in access data.
    pub url: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            topology: TopologyKind::FullMesh,
            chunk_size: 16 * 1024,
            ping_timeout_ms: 5_000,
            reachability_timeout_ms: 1_000,
            can_close_multiplier: 10,
            join_timeout_ms: 10_000,
            shuffle_interval_ms: 10_000,
            forward_ttl: 8,
            broadcast_log_capacity: 1024,
            reassembly_timeout_ms: 30_000,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000".to_string(),
        }
    }
}

impl OverlayConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    pub fn can_close_timeout(&self) -> Duration {
        self.reachability_timeout() * self.can_close_multiplier
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn shuffle_interval(&self) -> Option<Duration> {
        (self.shuffle_interval_ms > 0).then(|| Duration::from_millis(self.shuffle_interval_ms))
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("netweave")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NetweaveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NetweaveConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NETWEAVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NetweaveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply NETWEAVE_* overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("NETWEAVE_OVERLAY__TOPOLOGY") {
            match v.parse() {
                Ok(t) => self.overlay.topology = t,
                Err(e) => tracing::warn!(error = %e, "ignoring NETWEAVE_OVERLAY__TOPOLOGY"),
            }
        }
        if let Some(v) = var("NETWEAVE_OVERLAY__CHUNK_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    self.overlay.chunk_size = n;
                }
            }
        }
        if let Some(v) = var("NETWEAVE_OVERLAY__SHUFFLE_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.overlay.shuffle_interval_ms = n;
            }
        }
        if let Some(v) = var("NETWEAVE_SIGNALING__URL") {
            self.signaling.url = v;
        }
    }
}
