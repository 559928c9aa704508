//! Configuration system for peerindex.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERINDEX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerindex/config.toml
//!   3. ~/.config/peerindex/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{MAX_FIELD_LEN, MAX_REPLY_LEN};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
    pub transfer: TransferConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address for control requests.
    pub control_addr: SocketAddr,
    /// TCP address for bulk upload/download sessions.
    pub bulk_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Soft limit on records (pending + available) per peer.
    pub max_contents_per_peer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where uploaded blobs are kept.
    pub storage_path: PathBuf,
    /// A bulk session with no progress for this long is aborted.
    pub idle_timeout_secs: u64,
    /// How long an accepted register waits for its bulk connection.
    pub connect_timeout_secs: u64,
    /// Admission limit on simultaneous bulk sessions.
    pub max_concurrent_transfers: usize,
    /// Largest accepted upload. 0 = unlimited.
    pub max_blob_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Datagrams arriving while this many are being handled are dropped.
    pub max_inflight_requests: usize,
    /// Registry snapshot log interval.
    pub stats_interval_secs: u64,
}

/// Above this a LIST reply could overflow one datagram.
pub const MAX_CONTENTS_PER_PEER_CAP: usize = 200;

const _: () = assert!(MAX_CONTENTS_PER_PEER_CAP * (MAX_FIELD_LEN + 1) + 2 * MAX_FIELD_LEN < MAX_REPLY_LEN);

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bulk_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_contents_per_peer: 20,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            storage_path: data_dir().join("blobs"),
            idle_timeout_secs: 30,
            connect_timeout_secs: 30,
            max_concurrent_transfers: 64,
            max_blob_bytes: 0,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_inflight_requests: 256,
            stats_interval_secs: 30,
        }
    }
}

impl TransferConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `None` when uploads are unbounded.
    pub fn blob_limit(&self) -> Option<u64> {
        (self.max_blob_bytes > 0).then_some(self.max_blob_bytes)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("peerindex")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("peerindex")
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
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl IndexConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            IndexConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERINDEX_CONFIG")
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
            let text = toml::to_string_pretty(&IndexConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject limits that would make the service unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let per_peer = self.registry.max_contents_per_peer;
        if per_peer == 0 || per_peer > MAX_CONTENTS_PER_PEER_CAP {
            return Err(ConfigError::Invalid(format!(
                "registry.max_contents_per_peer must be 1..={} (got {})",
                MAX_CONTENTS_PER_PEER_CAP, per_peer
            )));
        }
        if self.transfer.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer.idle_timeout_secs must be non-zero".into(),
            ));
        }
        if self.transfer.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer.connect_timeout_secs must be non-zero".into(),
            ));
        }
        if self.transfer.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid(
                "transfer.max_concurrent_transfers must be non-zero".into(),
            ));
        }
        if self.control.max_inflight_requests == 0 {
            return Err(ConfigError::Invalid(
                "control.max_inflight_requests must be non-zero".into(),
            ));
        }
        if self.control.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "control.stats_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply PEERINDEX_* env var overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PEERINDEX_NETWORK__CONTROL_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.control_addr = a;
            }
        }
        if let Ok(v) = std::env::var("PEERINDEX_NETWORK__BULK_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.bulk_addr = a;
            }
        }
        if let Ok(v) = std::env::var("PEERINDEX_REGISTRY__MAX_CONTENTS_PER_PEER") {
            if let Ok(n) = v.parse() {
                self.registry.max_contents_per_peer = n;
            }
        }
        if let Ok(v) = std::env::var("PEERINDEX_TRANSFER__STORAGE_PATH") {
            self.transfer.storage_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PEERINDEX_TRANSFER__IDLE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.idle_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PEERINDEX_TRANSFER__MAX_BLOB_BYTES") {
            if let Ok(n) = v.parse() {
                self.transfer.max_blob_bytes = n;
            }
        }
    }
}
