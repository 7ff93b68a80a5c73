//! Configuration types for MirrorFS
//!
//! This module defines the node configuration file layout. Every section and
//! every field has a default so a partial (or empty) TOML file is valid.

use crate::error::{Error, Result};
use crate::types::{GroupId, TargetId, TargetKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a MirrorFS node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mirroring: MirroringConfig,
    #[serde(default)]
    pub resync: ResyncConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Buddy groups used to bootstrap the registry when no state file exists yet
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load a configuration file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Address of a peer target, if configured
    #[must_use]
    pub fn peer_address(&self, target: TargetId) -> Option<&str> {
        self.network
            .peers
            .iter()
            .find(|p| p.target == target)
            .map(|p| p.address.as_str())
    }
}

/// Node identity and the targets it hosts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Targets served by this process
    #[serde(default)]
    pub local_targets: Vec<LocalTargetConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            local_targets: Vec::new(),
        }
    }
}

/// A target hosted by this node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalTargetConfig {
    pub id: TargetId,
    #[serde(default)]
    pub kind: TargetKind,
    /// Root directory of the target's on-disk data
    pub data_dir: PathBuf,
}

/// Forwarding and locking behaviour of the replicated-operation engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirroringConfig {
    /// Additional attempts after the first failed forward (0 = one attempt)
    #[serde(default = "default_forward_retries")]
    pub forward_retries: u32,
    /// Timeout of a single forward attempt
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Upper bound on waiting for a lock token
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Upper bound on executing an operation against local state
    #[serde(default = "default_execute_timeout_ms")]
    pub execute_timeout_ms: u64,
}

impl MirroringConfig {
    #[must_use]
    pub const fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub const fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
}

impl Default for MirroringConfig {
    fn default() -> Self {
        Self {
            forward_retries: default_forward_retries(),
            forward_timeout_ms: default_forward_timeout_ms(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            execute_timeout_ms: default_execute_timeout_ms(),
        }
    }
}

/// Resync gatherer and coordinator settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Subtracted from the last buddy communication timestamp to tolerate clock skew
    #[serde(default = "default_safety_threshold_mins")]
    pub safety_threshold_mins: u64,
    #[serde(default = "default_workers")]
    pub gather_workers: usize,
    #[serde(default = "default_workers")]
    pub sync_workers: usize,
    /// Interval of the buddy-needs-resync check
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// A pass is aborted after this many pushes in a row failed
    #[serde(default = "default_max_consecutive_push_failures")]
    pub max_consecutive_push_failures: u32,
}

impl ResyncConfig {
    #[must_use]
    pub const fn safety_threshold(&self) -> Duration {
        Duration::from_secs(self.safety_threshold_mins * 60)
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            safety_threshold_mins: default_safety_threshold_mins(),
            gather_workers: default_workers(),
            sync_workers: default_workers(),
            check_interval_secs: default_check_interval_secs(),
            max_consecutive_push_failures: default_max_consecutive_push_failures(),
        }
    }
}

/// Where and how often registry state is written
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Listen addresses and peer directory
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address of the mirroring request server
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Address of the admin/metrics HTTP server
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            peers: Vec::new(),
        }
    }
}

/// Address at which a remote target is served
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    pub target: TargetId,
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Initial buddy group definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: GroupId,
    pub primary: TargetId,
    pub secondary: TargetId,
}

fn default_node_name() -> String {
    "mirrorfs-node".to_string()
}

const fn default_forward_retries() -> u32 {
    3
}

const fn default_forward_timeout_ms() -> u64 {
    5000
}

const fn default_retry_backoff_base_ms() -> u64 {
    100
}

const fn default_retry_backoff_max_ms() -> u64 {
    2000
}

const fn default_lock_timeout_ms() -> u64 {
    30_000
}

const fn default_execute_timeout_ms() -> u64 {
    30_000
}

const fn default_safety_threshold_mins() -> u64 {
    10
}

const fn default_workers() -> usize {
    4
}

const fn default_check_interval_secs() -> u64 {
    20
}

const fn default_max_consecutive_push_failures() -> u32 {
    16
}

fn default_state_file() -> PathBuf {
    PathBuf::from("./mirrorfs-state.json")
}

const fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_listen() -> String {
    "0.0.0.0:8005".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:8006".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
