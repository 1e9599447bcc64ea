//! Configuration for the TDLS control plane.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TDLS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tdls/config.toml
//!   3. ~/.config/tdls/config.toml
//!
//! Loaded once at engine construction and immutable for the session's
//! lifetime — nothing here is hot-reloaded.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TdlsConfig {
    /// ISO country code handed to the regulatory collaborator.
    pub country: String,
    pub thresholds: ThresholdConfig,
    pub features: FeatureConfig,
}

/// Tracker and command-gateway tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Traffic sampling interval.
    pub tx_period_ms: u64,
    /// Packets per interval that make a peer worth discovering.
    pub tx_packet_threshold: u32,
    /// How long a connected link may stay below `idle_packet_threshold`
    /// before teardown is considered.
    pub idle_timeout_ms: u64,
    /// Per-interval packet count under which a connected link counts as idle.
    pub idle_packet_threshold: u32,
    /// Minimum RSSI (dBm) in a discovery response to proceed to setup.
    pub rssi_trigger_threshold: i8,
    /// RSSI (dBm) under which an established link is torn down.
    pub rssi_teardown_threshold: i8,
    /// Hysteresis between trigger and teardown decisions (dB).
    pub rssi_delta: i8,
    /// Discovery attempts per peer before it is marked not supported.
    /// Forced peers are exempt.
    pub discovery_tries_max: u8,
    /// How long to wait for discovery responses.
    pub discovery_timeout_ms: u64,
    /// How long to wait for a setup response or confirm.
    pub setup_timeout_ms: u64,
    /// Deadline for any single serialized command.
    pub command_timeout_ms: u64,
}

/// Feature toggles pushed to firmware and consulted by the mode controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Allow the direct link to operate off the association channel.
    pub off_channel: bool,
    /// Peer buffering support — required to keep links alive across scans.
    pub buffer_sta: bool,
    /// Sleeping-peer support.
    pub sleep_sta: bool,
    /// Allow scans while links are established (subject to buffer_sta).
    pub scan: bool,
    /// Wi-Fi multimedia (QoS) on the direct link.
    pub wmm: bool,
    pub external_control: ExternalControlLevel,
    /// Device-wide cap on concurrently connected peers.
    pub max_connected_peers: u32,
    /// Peer addresses forced at session start (external control without a
    /// runtime caller). Colon-separated hex.
    pub forced_peers: Vec<String>,
}

/// How much an external allow-list constrains link establishment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalControlLevel {
    /// Forced peers only skip the discovery retry bound.
    #[default]
    Off,
    /// Only forced peers may be discovered or connected.
    Strict,
    /// Implicit triggering stays on, but only while at least one forced
    /// peer exists.
    Liberal,
}

impl ThresholdConfig {
    pub fn tx_period(&self) -> Duration {
        Duration::from_millis(self.tx_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TdlsConfig {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            thresholds: ThresholdConfig::default(),
            features: FeatureConfig::default(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            tx_period_ms: 2000,
            tx_packet_threshold: 40,
            idle_timeout_ms: 5000,
            idle_packet_threshold: 3,
            rssi_trigger_threshold: -75,
            rssi_teardown_threshold: -75,
            rssi_delta: -20,
            discovery_tries_max: 5,
            discovery_timeout_ms: 1000,
            setup_timeout_ms: 1500,
            command_timeout_ms: 4000,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            off_channel: true,
            buffer_sta: true,
            sleep_sta: false,
            scan: true,
            wmm: true,
            external_control: ExternalControlLevel::Off,
            max_connected_peers: 2,
            forced_peers: Vec::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("tdls")
}

fn home_or_tmp() -> PathBuf {
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

impl TdlsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TdlsConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TDLS_CONFIG")
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
            let text = toml::to_string_pretty(&TdlsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TDLS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TDLS_COUNTRY") {
            self.country = v;
        }
        if let Ok(v) = std::env::var("TDLS_THRESHOLDS__TX_PERIOD_MS") {
            if let Ok(n) = v.parse() {
                self.thresholds.tx_period_ms = n;
            }
        }
        if let Ok(v) = std::env::var("TDLS_THRESHOLDS__TX_PACKET_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.thresholds.tx_packet_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("TDLS_THRESHOLDS__IDLE_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.thresholds.idle_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("TDLS_FEATURES__OFF_CHANNEL") {
            self.features.off_channel = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TDLS_FEATURES__BUFFER_STA") {
            self.features.buffer_sta = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TDLS_FEATURES__EXTERNAL_CONTROL") {
            match v.as_str() {
                "off" => self.features.external_control = ExternalControlLevel::Off,
                "strict" => self.features.external_control = ExternalControlLevel::Strict,
                "liberal" => self.features.external_control = ExternalControlLevel::Liberal,
                other => tracing::warn!(value = other, "unknown external control level ignored"),
            }
        }
        if let Ok(v) = std::env::var("TDLS_FEATURES__MAX_CONNECTED_PEERS") {
            if let Ok(n) = v.parse() {
                self.features.max_connected_peers = n;
            }
        }
    }
}
