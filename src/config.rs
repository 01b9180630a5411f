//! Configuration for a reliable-UDP endpoint.
//!
//! This module provides JSON-based configuration for the protocol core and
//! the worker pool, covering tuning knobs like windows, tick interval,
//! retransmission behavior and eviction cadence.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::conn::rtt::{RTO_MAX_MS, RTO_MIN_MS, RTO_MIN_NODELAY_MS};
use crate::segment::HEADER_LEN;

/// Error types for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Helper trait for loading/saving configuration files.
pub trait FileConfig: Serialize + for<'de> Deserialize<'de> + Default + Sized {
    /// Load configuration from a JSON file.
    ///
    /// If the file doesn't exist, returns default config.
    /// If the file exists but is invalid, returns an error.
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save configuration as pretty JSON, atomically via a temp file rename.
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Per-connection protocol tuning.
///
/// Defaults mirror the conservative profile: 100ms ticks, no fast resend,
/// congestion control on. Latency-sensitive callers flip `nodelay`, drop
/// `interval_ms`, set `resend` to 2 and disable congestion control via `nc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Maximum datagram size, headers included.
    pub mtu: usize,
    /// Aggressive retransmit profile: lower RTO floor, gentler backoff,
    /// no grace margin on first transmissions.
    pub nodelay: bool,
    /// Internal clock granularity in milliseconds.
    pub interval_ms: u32,
    /// Fast-resend threshold in skipped acks; 0 disables fast resend.
    pub resend: u32,
    /// `true` turns congestion control off, leaving only the flow windows.
    pub nc: bool,
    /// Send window in segments.
    pub snd_wnd: u16,
    /// Receive window in segments.
    pub rcv_wnd: u16,
    /// Send-queue cap in bytes; `send` reports backpressure above it.
    pub send_queue_cap: usize,
    pub rto_min_ms: u32,
    pub rto_max_ms: u32,
    /// Retransmission count at which a segment declares the link dead.
    pub dead_link: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            nodelay: false,
            interval_ms: 100,
            resend: 0,
            nc: false,
            snd_wnd: 32,
            rcv_wnd: 32,
            send_queue_cap: 1024 * 1024,
            rto_min_ms: RTO_MIN_MS,
            rto_max_ms: RTO_MAX_MS,
            dead_link: 20,
        }
    }
}

impl ProtocolConfig {
    /// Maximum payload bytes per segment.
    pub fn mss(&self) -> usize {
        self.mtu - HEADER_LEN
    }

    /// Effective RTO floor; `nodelay` lowers it.
    pub fn rto_floor(&self) -> u32 {
        if self.nodelay {
            RTO_MIN_NODELAY_MS
        } else {
            self.rto_min_ms
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu <= HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "mtu {} must exceed the {HEADER_LEN}-byte header",
                self.mtu
            )));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be > 0".into()));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(ConfigError::Invalid("windows must be > 0".into()));
        }
        if self.rto_min_ms > self.rto_max_ms {
            return Err(ConfigError::Invalid(format!(
                "rto_min_ms {} exceeds rto_max_ms {}",
                self.rto_min_ms, self.rto_max_ms
            )));
        }
        if self.dead_link == 0 {
            return Err(ConfigError::Invalid("dead_link must be > 0".into()));
        }
        Ok(())
    }
}

/// Worker-pool sizing and housekeeping cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker shards; peers hash onto them by address.
    pub workers: usize,
    /// Per-worker inbox depth; overflow drops the datagram.
    pub inbound_queue: usize,
    /// Sessions silent for this long get evicted.
    pub idle_timeout_ms: u32,
    /// Run the idle sweep every this many ticks.
    pub evict_every_ticks: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            inbound_queue: 1024,
            idle_timeout_ms: 120_000,
            evict_every_ticks: 10,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.inbound_queue == 0 {
            return Err(ConfigError::Invalid("inbound_queue must be > 0".into()));
        }
        if self.evict_every_ticks == 0 {
            return Err(ConfigError::Invalid("evict_every_ticks must be > 0".into()));
        }
        Ok(())
    }
}

/// Everything one endpoint needs, as persisted on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub protocol: ProtocolConfig,
    pub pool: PoolConfig,
}

impl FileConfig for EndpointConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()?;
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EndpointConfig::default().validate().unwrap();
    }

    #[test]
    fn mss_leaves_room_for_the_header() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.mss(), cfg.mtu - HEADER_LEN);
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        let cfg = ProtocolConfig {
            mtu: HEADER_LEN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = PoolConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join("ruda-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("endpoint.json");

        let mut cfg = EndpointConfig::default();
        cfg.protocol.nodelay = true;
        cfg.protocol.interval_ms = 10;
        cfg.pool.workers = 2;
        cfg.save_to_file(&path).unwrap();

        let loaded = EndpointConfig::load_from_file(&path).unwrap();
        assert!(loaded.protocol.nodelay);
        assert_eq!(loaded.protocol.interval_ms, 10);
        assert_eq!(loaded.pool.workers, 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = EndpointConfig::load_from_file("/nonexistent/ruda.json").unwrap();
        assert_eq!(cfg.pool.workers, PoolConfig::default().workers);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: EndpointConfig =
            serde_json::from_str(r#"{"protocol":{"nodelay":true}}"#).unwrap();
        assert!(cfg.protocol.nodelay);
        assert_eq!(cfg.protocol.mtu, 1400);
        assert_eq!(cfg.pool.workers, 4);
    }
}
