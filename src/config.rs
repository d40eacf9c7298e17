//! Runtime configuration for tiercache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only needs the knobs it changes.
//! Ports set to 0 are resolved to OS-assigned ports at worker construction and
//! written back here before any dependent service starts.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tiercache", about = "Tiered block cache worker and master")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "tiercache.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub role: Role,
}

/// Which process to run.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Run a cache worker.
    Worker,
    /// Run the membership master.
    Master,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker network settings.
    pub worker: WorkerConfig,

    /// Per-service HA exposure.
    pub ha: HaConfig,

    /// Underlying storage and absent-path cache settings.
    pub ufs: UfsConfig,

    /// Master address and registration retry policy.
    pub master: MasterConfig,

    /// Client read path settings.
    pub client: ClientConfig,

    /// Worker plugins.
    pub plugins: PluginConfig,
}

/// Worker network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Host the worker binds to and advertises.
    pub host: String,

    /// RPC port (0 = auto-assign).
    pub rpc_port: u16,

    /// Data-transfer port (0 = auto-assign).
    pub data_port: u16,

    /// Web port (0 = auto-assign).
    pub web_port: u16,

    /// Maximum number of RPC calls handled concurrently.
    pub rpc_max_concurrency: usize,

    /// Upper bound on close attempts for the data-transfer endpoint at shutdown.
    pub data_close_max_attempts: u32,

    /// Pause between data-transfer close attempts.
    pub data_close_retry_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rpc_port: 29999,
            data_port: 29998,
            web_port: 30000,
            rpc_max_concurrency: 64,
            data_close_max_attempts: 50,
            data_close_retry_interval_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn data_close_retry_interval(&self) -> Duration {
        Duration::from_millis(self.data_close_retry_interval_ms)
    }
}

/// How a cluster-facing service is exposed while the node is standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaMode {
    /// Only the primary serves; standby holds the port with a rejecting listener.
    PrimaryOnly,
    /// The service is bound from start to stop; promotion only toggles its role.
    AlwaysOn,
}

/// HA exposure of the web and RPC endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub web_mode: HaMode,
    pub rpc_mode: HaMode,

    /// How long a demoted or stopped service may take to drain connections.
    pub stop_grace_ms: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            web_mode: HaMode::PrimaryOnly,
            rpc_mode: HaMode::PrimaryOnly,
            stop_grace_ms: 2_000,
        }
    }
}

impl HaConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Underlying storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UfsConfig {
    /// Root of the underlying storage this worker fronts.
    pub root: String,

    /// Background verification workers for the absent-path cache.
    /// Zero or negative disables the cache entirely.
    pub absent_cache_threads: i32,

    /// How long an absent entry may be served before it must be re-verified.
    pub absent_cache_ttl_secs: u64,

    /// Maximum number of absent entries kept in memory.
    pub absent_cache_capacity: u64,
}

impl Default for UfsConfig {
    fn default() -> Self {
        Self {
            root: "/tmp/tiercache/ufs".to_string(),
            absent_cache_threads: 2,
            absent_cache_ttl_secs: 60,
            absent_cache_capacity: 100_000,
        }
    }
}

impl UfsConfig {
    pub fn absent_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.absent_cache_ttl_secs)
    }
}

/// Master location and registration retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Base URL of the master (e.g. "http://127.0.0.1:19999").
    pub address: String,

    /// Listen address when running the master role.
    pub listen: String,

    /// Registration attempts before worker startup is aborted.
    pub registration_max_attempts: u32,

    /// First backoff between registration attempts.
    pub registration_initial_backoff_ms: u64,

    /// Backoff ceiling between registration attempts.
    pub registration_max_backoff_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:19999".to_string(),
            listen: "0.0.0.0:19999".to_string(),
            registration_max_attempts: 10,
            registration_initial_backoff_ms: 100,
            registration_max_backoff_ms: 5_000,
        }
    }
}

/// Client read path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wall-clock budget for recovering a block read after a worker failure.
    pub block_read_retry_max_duration_ms: u64,

    /// Largest slice of a block written to the data socket at once.
    pub chunk_size_bytes: usize,

    /// A worker silent for this long is treated as dead.
    pub read_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            block_read_retry_max_duration_ms: 120_000,
            chunk_size_bytes: 64 * 1024,
            read_timeout_ms: 30_000,
        }
    }
}

/// Worker plugin selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Plugin identifiers to instantiate, in start order.
    pub enabled: Vec<String>,

    /// Sampling interval of the block-report plugin.
    pub block_report_interval_ms: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: Vec::new(),
            block_report_interval_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Configuration suited to tests: loopback, auto-assigned ports, short timers.
    pub fn ephemeral() -> Self {
        let mut config = Config::default();
        config.worker.rpc_port = 0;
        config.worker.data_port = 0;
        config.worker.web_port = 0;
        config.worker.data_close_retry_interval_ms = 10;
        config.ha.stop_grace_ms = 500;
        config.master.registration_initial_backoff_ms = 10;
        config.master.registration_max_backoff_ms = 50;
        config.master.registration_max_attempts = 3;
        config.client.block_read_retry_max_duration_ms = 1_000;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.ha.web_mode, HaMode::PrimaryOnly);
        assert_eq!(cfg.ufs.absent_cache_threads, 2);
        assert!(cfg.plugins.enabled.is_empty());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "ha": { "web_mode": "always_on" },
            "ufs": { "absent_cache_threads": -1 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.ha.web_mode, HaMode::AlwaysOn);
        assert_eq!(cfg.ha.rpc_mode, HaMode::PrimaryOnly);
        assert_eq!(cfg.ufs.absent_cache_threads, -1);
        assert_eq!(cfg.worker.rpc_port, 29999);
    }
}
