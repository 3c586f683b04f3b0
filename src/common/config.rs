//! Configuration for miniblob components
//!
//! A `Config` is built once at startup (file, then environment, then CLI
//! overrides), validated, and handed to each component behind an `Arc`.

use crate::common::utils::test_folder_writable;
use crate::common::{Error, ReplicaPlacement, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "MINIBLOB_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node ID (unique identifier, used in logs)
    pub node_id: String,

    /// Master-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<MasterConfig>,

    /// Volume-server-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeConfig>,

    /// Logging level
    pub log_level: Option<String>,

    /// Tokio worker threads, 0 means one per core
    pub max_cpu: usize,
}

impl Config {
    /// Load from the file named by `MINIBLOB_CONFIG` (default `config.toml`,
    /// optional) layered with `MINIBLOB__*` environment variables.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("MINIBLOB").separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Bind address for the HTTP endpoint (API, heartbeats and Raft RPCs)
    pub bind_addr: SocketAddr,

    /// Address other masters and volume servers use to reach this master;
    /// also this master's identity in the Raft peer set
    pub address: String,

    /// Other masters (`host:port`)
    pub peers: Vec<String>,

    /// Folder holding the Raft log
    pub meta_dir: PathBuf,

    /// Master stops directing writes to volumes above this size
    pub volume_size_limit_mb: u64,

    /// Garbage ratio above which a volume is reported for vacuum
    pub garbage_threshold: f64,

    /// Placement used when a request carries none
    pub default_replica_placement: ReplicaPlacement,

    /// Seconds between volume server heartbeats
    pub pulse_seconds: u64,

    /// Missed pulses before a node is considered suspect
    pub stale_pulses: u32,

    /// Base election timeout; the effective timeout is randomized in
    /// `[base, 2 * base)`
    pub election_timeout_ms: u64,

    /// Leader AppendEntries interval
    pub raft_heartbeat_ms: u64,

    /// Bound on waiting for a proposal to commit
    pub proposal_timeout_ms: u64,

    /// Client IPs allowed to issue writes; empty means everyone
    pub whitelist: Vec<String>,

    /// Idle connection timeout
    pub idle_timeout_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9333)),
            address: "localhost:9333".to_string(),
            peers: Vec::new(),
            meta_dir: PathBuf::from("./master-data"),
            volume_size_limit_mb: 30 * 1000,
            garbage_threshold: 0.3,
            default_replica_placement: ReplicaPlacement::default(),
            pulse_seconds: 5,
            stale_pulses: 3,
            election_timeout_ms: 300,
            raft_heartbeat_ms: 50,
            proposal_timeout_ms: 3000,
            whitelist: Vec::new(),
            idle_timeout_secs: 10,
        }
    }
}

impl MasterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::InvalidConfig("master address is empty".into()));
        }
        if !(self.garbage_threshold > 0.0 && self.garbage_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "garbage threshold {} not in (0, 1]",
                self.garbage_threshold
            )));
        }
        if self.pulse_seconds == 0 {
            return Err(Error::InvalidConfig("pulse must be at least 1s".into()));
        }
        if self.raft_heartbeat_ms >= self.election_timeout_ms {
            return Err(Error::InvalidConfig(
                "raft heartbeat must be shorter than the election timeout".into(),
            ));
        }
        test_folder_writable(&self.meta_dir).map_err(|e| {
            Error::InvalidConfig(format!(
                "meta folder {} not writable: {}",
                self.meta_dir.display(),
                e
            ))
        })
    }

    /// Full peer set including this master, sorted and deduplicated
    pub fn peer_set(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        peers.push(self.address.clone());
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn volume_size_limit_bytes(&self) -> u64 {
        self.volume_size_limit_mb * 1024 * 1024
    }

    pub fn pulse(&self) -> Duration {
        Duration::from_secs(self.pulse_seconds)
    }

    /// A node silent for longer than this is suspect
    pub fn stale_after(&self) -> Duration {
        self.pulse() * self.stale_pulses.max(1)
    }

    pub fn raft(&self) -> RaftConfig {
        RaftConfig {
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.raft_heartbeat_ms),
            proposal_timeout: Duration::from_millis(self.proposal_timeout_ms),
        }
    }
}

/// Timing knobs of the consensus module
#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub proposal_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        MasterConfig::default().raft()
    }
}

/// Volume server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Bind address for the HTTP endpoint
    pub bind_addr: SocketAddr,

    /// Address masters use to reach this node (`ip:port`); node identity
    pub address: String,

    /// Address handed to clients; defaults to `address`
    pub public_url: Option<String>,

    /// Local data folders
    pub folders: Vec<PathBuf>,

    /// Max volume count per folder, same length as `folders`
    pub max_volume_counts: Vec<u32>,

    /// Master addresses (`host:port`)
    pub masters: Vec<String>,

    pub data_center: String,
    pub rack: String,

    /// Seconds between heartbeats
    pub pulse_seconds: u64,

    /// Per-attempt heartbeat timeout, shorter than the pulse
    pub heartbeat_timeout_ms: u64,

    /// Attempts against the last-known leader before re-discovery
    pub heartbeat_retries: u32,

    /// Client IPs allowed to write; empty means everyone
    pub whitelist: Vec<String>,

    /// Idle connection timeout
    pub idle_timeout_secs: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            address: "localhost:8080".to_string(),
            public_url: None,
            folders: vec![std::env::temp_dir()],
            max_volume_counts: vec![7],
            masters: vec!["localhost:9333".to_string()],
            data_center: String::new(),
            rack: String::new(),
            pulse_seconds: 5,
            heartbeat_timeout_ms: 2000,
            heartbeat_retries: 3,
            whitelist: Vec::new(),
            idle_timeout_secs: 10,
        }
    }
}

impl VolumeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.folders.is_empty() {
            return Err(Error::InvalidConfig("no data folder configured".into()));
        }
        if self.folders.len() != self.max_volume_counts.len() {
            return Err(Error::InvalidConfig(format!(
                "{} directories configured, but {} max volume counts",
                self.folders.len(),
                self.max_volume_counts.len()
            )));
        }
        if self.masters.is_empty() {
            return Err(Error::InvalidConfig("no master configured".into()));
        }
        if self.pulse_seconds == 0 {
            return Err(Error::InvalidConfig("pulse must be at least 1s".into()));
        }
        if self.heartbeat_timeout() >= self.pulse() {
            return Err(Error::InvalidConfig(
                "heartbeat timeout must be shorter than the pulse".into(),
            ));
        }
        for folder in &self.folders {
            test_folder_writable(folder).map_err(|e| {
                Error::InvalidConfig(format!(
                    "data folder {} not writable: {}",
                    folder.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| self.address.clone())
    }

    pub fn pulse(&self) -> Duration {
        Duration::from_secs(self.pulse_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}
