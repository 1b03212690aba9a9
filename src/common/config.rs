//! Configuration for miniweed components
//!
//! Values come from an optional TOML file (path in `MINIWEED_CONFIG`,
//! default `miniweed.toml`), then `MINIWEED__SECTION__KEY` environment
//! variables. Binaries apply their CLI flags on top.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default)]
    pub node_id: String,

    /// Master-specific config
    #[serde(default)]
    pub master: MasterConfig,

    /// Volume-server-specific config
    #[serde(default)]
    pub volume: VolumeConfig,

    /// Filer-specific config
    #[serde(default)]
    pub filer: FilerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            master: MasterConfig::default(),
            volume: VolumeConfig::default(),
            filer: FilerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MINIWEED_CONFIG").unwrap_or_else(|_| "miniweed.toml".into());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("MINIWEED")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(config)
    }
}

/// When to fsync data files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every append
    Always,
    /// Leave flushing to the OS (checkpoints still sync)
    Never,
}

/// Fault domain EC shards are spread over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultDomain {
    /// No two shards on the same rack
    Rack,
    /// No two shards on the same server
    Server,
    /// Spread as evenly as possible, co-location allowed
    Any,
}

impl std::str::FromStr for FaultDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rack" => Ok(FaultDomain::Rack),
            "server" => Ok(FaultDomain::Server),
            "any" => Ok(FaultDomain::Any),
            other => Err(Error::InvalidConfig(format!("unknown fault domain: {}", other))),
        }
    }
}

/// Erasure coding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcConfig {
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,

    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,

    #[serde(default = "default_fault_domain")]
    pub fault_domain: FaultDomain,

    /// Parallel shard copies per job
    #[serde(default = "default_copy_concurrency")]
    pub copy_concurrency: usize,

    /// Attempts per shard destination before the job fails
    #[serde(default = "default_shard_retry_attempts")]
    pub shard_retry_attempts: usize,

    /// Initial retry delay, doubled on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Background conversion scan interval, 0 disables the scanner
    #[serde(default)]
    pub scan_interval_secs: u64,

    /// Volumes at or above this fill ratio are candidates
    #[serde(default = "default_full_ratio")]
    pub full_ratio: f64,

    /// Volumes without writes for this long are candidates
    #[serde(default = "default_quiet_period_secs")]
    pub quiet_period_secs: u64,
}

fn default_data_shards() -> usize {
    10
}
fn default_parity_shards() -> usize {
    4
}
fn default_fault_domain() -> FaultDomain {
    FaultDomain::Rack
}
fn default_copy_concurrency() -> usize {
    4
}
fn default_shard_retry_attempts() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_full_ratio() -> f64 {
    0.95
}
fn default_quiet_period_secs() -> u64 {
    3600
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
            fault_domain: default_fault_domain(),
            copy_concurrency: default_copy_concurrency(),
            shard_retry_attempts: default_shard_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            scan_interval_secs: 0,
            full_ratio: default_full_ratio(),
            quiet_period_secs: default_quiet_period_secs(),
        }
    }
}

impl EcConfig {
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 || self.parity_shards == 0 {
            return Err(Error::InvalidConfig(
                "ec data and parity shard counts must be positive".into(),
            ));
        }
        if self.total_shards() > 256 {
            return Err(Error::InvalidConfig(
                "ec supports at most 256 shards in GF(2^8)".into(),
            ));
        }
        if self.copy_concurrency == 0 || self.shard_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "ec copy concurrency and retry attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_master_bind")]
    pub bind_addr: SocketAddr,

    /// URL other nodes use to reach this master
    #[serde(default)]
    pub advertise_url: Option<String>,

    /// Raft log, hard state and snapshots
    #[serde(default = "default_master_dir")]
    pub data_dir: PathBuf,

    /// Raft peers as `id=url`
    #[serde(default)]
    pub peers: Vec<String>,

    /// Replica placement for volumes when a request doesn't specify one
    #[serde(default = "default_replication")]
    pub default_replication: String,

    #[serde(default = "default_volume_size_limit_mb")]
    pub volume_size_limit_mb: u64,

    /// Expected volume server heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a server is suspect
    #[serde(default = "default_suspect_after")]
    pub suspect_after_missed: u32,

    /// Missed heartbeats before a server is removed
    #[serde(default = "default_dead_after")]
    pub dead_after_missed: u32,

    /// Raft election timeout (randomized in [t, 2t))
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Raft leader heartbeat interval
    #[serde(default = "default_raft_heartbeat")]
    pub raft_heartbeat_ms: u64,

    /// How long a proposal may wait for commit
    #[serde(default = "default_propose_timeout")]
    pub propose_timeout_ms: u64,

    /// Log entries before a snapshot
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Garbage ratio that triggers vacuum
    #[serde(default = "default_garbage_threshold")]
    pub garbage_threshold: f64,

    #[serde(default)]
    pub ec: EcConfig,
}

fn default_master_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9333))
}
fn default_master_dir() -> PathBuf {
    PathBuf::from("./master-data")
}
fn default_replication() -> String {
    "000".to_string()
}
fn default_volume_size_limit_mb() -> u64 {
    1024
}
fn default_heartbeat_interval() -> u64 {
    2000
}
fn default_suspect_after() -> u32 {
    3
}
fn default_dead_after() -> u32 {
    10
}
fn default_election_timeout() -> u64 {
    1000
}
fn default_raft_heartbeat() -> u64 {
    150
}
fn default_propose_timeout() -> u64 {
    3000
}
fn default_snapshot_threshold() -> u64 {
    1000
}
fn default_garbage_threshold() -> f64 {
    0.3
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_master_bind(),
            advertise_url: None,
            data_dir: default_master_dir(),
            peers: Vec::new(),
            default_replication: default_replication(),
            volume_size_limit_mb: default_volume_size_limit_mb(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            suspect_after_missed: default_suspect_after(),
            dead_after_missed: default_dead_after(),
            election_timeout_ms: default_election_timeout(),
            raft_heartbeat_ms: default_raft_heartbeat(),
            propose_timeout_ms: default_propose_timeout(),
            snapshot_threshold: default_snapshot_threshold(),
            garbage_threshold: default_garbage_threshold(),
            ec: EcConfig::default(),
        }
    }
}

/// A Raft peer parsed from `id=url`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
}

impl MasterConfig {
    pub fn volume_size_limit(&self) -> u64 {
        self.volume_size_limit_mb * 1024 * 1024
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn advertise_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr))
    }

    pub fn parsed_peers(&self) -> Result<Vec<PeerConfig>> {
        self.peers
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                let (id, url) = p.split_once('=').ok_or_else(|| {
                    Error::InvalidConfig(format!("peer must be id=url, got {}", p))
                })?;
                let url = url.trim();
                let url = if url.starts_with("http://") || url.starts_with("https://") {
                    url.to_string()
                } else {
                    format!("http://{}", url)
                };
                Ok(PeerConfig {
                    id: id.trim().to_string(),
                    url,
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.suspect_after_missed == 0 {
            return Err(Error::InvalidConfig(
                "suspect_after_missed must be at least 1".into(),
            ));
        }
        if self.dead_after_missed < self.suspect_after_missed {
            return Err(Error::InvalidConfig(
                "dead_after_missed must not be lower than suspect_after_missed".into(),
            ));
        }
        if self.raft_heartbeat_ms >= self.election_timeout_ms {
            return Err(Error::InvalidConfig(
                "raft heartbeat must be shorter than the election timeout".into(),
            ));
        }
        if self.volume_size_limit_mb == 0 {
            return Err(Error::InvalidConfig("volume size limit must be positive".into()));
        }
        crate::master::placement::ReplicaPlacement::parse(&self.default_replication)?;
        self.parsed_peers()?;
        self.ec.validate()
    }
}

/// Volume server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Bind address for HTTP
    #[serde(default = "default_volume_bind")]
    pub bind_addr: SocketAddr,

    /// URL the master hands out to clients
    #[serde(default)]
    pub public_url: Option<String>,

    /// Disk directories, one volume location each
    #[serde(default = "default_volume_dirs")]
    pub data_dirs: Vec<PathBuf>,

    /// Volume slots per directory
    #[serde(default = "default_max_volumes")]
    pub max_volumes: u32,

    /// Master URLs
    #[serde(default = "default_masters")]
    pub masters: Vec<String>,

    #[serde(default = "default_data_center")]
    pub data_center: String,

    #[serde(default = "default_rack")]
    pub rack: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Index checkpoint interval
    #[serde(default = "default_checkpoint_interval")]
    pub index_checkpoint_secs: u64,

    #[serde(default = "default_sync")]
    pub sync: SyncPolicy,

    /// Largest accepted needle
    #[serde(default = "default_max_needle_mb")]
    pub max_needle_mb: u64,
}

fn default_volume_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_volume_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("./volume-data")]
}
fn default_max_volumes() -> u32 {
    8
}
fn default_masters() -> Vec<String> {
    vec!["http://127.0.0.1:9333".to_string()]
}
fn default_data_center() -> String {
    "dc1".to_string()
}
fn default_rack() -> String {
    "rack1".to_string()
}
fn default_checkpoint_interval() -> u64 {
    30
}
fn default_sync() -> SyncPolicy {
    SyncPolicy::Never
}
fn default_max_needle_mb() -> u64 {
    64
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_volume_bind(),
            public_url: None,
            data_dirs: default_volume_dirs(),
            max_volumes: default_max_volumes(),
            masters: default_masters(),
            data_center: default_data_center(),
            rack: default_rack(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            index_checkpoint_secs: default_checkpoint_interval(),
            sync: default_sync(),
            max_needle_mb: default_max_needle_mb(),
        }
    }
}

impl VolumeConfig {
    /// URL this server registers under
    pub fn url(&self) -> String {
        format!("http://{}", self.bind_addr)
    }

    pub fn public_url(&self) -> String {
        self.public_url.clone().unwrap_or_else(|| self.url())
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dirs.is_empty() {
            return Err(Error::InvalidConfig("at least one data dir is required".into()));
        }
        if self.masters.is_empty() {
            return Err(Error::InvalidConfig("at least one master is required".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat interval must be positive".into()));
        }
        Ok(())
    }
}

/// Filer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilerConfig {
    #[serde(default = "default_filer_bind")]
    pub bind_addr: SocketAddr,

    #[serde(default = "default_masters")]
    pub masters: Vec<String>,

    /// Metadata snapshot directory
    #[serde(default = "default_filer_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,

    /// Replication for chunks, master default when unset
    #[serde(default)]
    pub replication: Option<String>,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

fn default_filer_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8888))
}
fn default_filer_dir() -> PathBuf {
    PathBuf::from("./filer-data")
}
fn default_chunk_size_mb() -> u64 {
    4
}
fn default_gc_interval() -> u64 {
    10
}

impl Default for FilerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_filer_bind(),
            masters: default_masters(),
            data_dir: default_filer_dir(),
            chunk_size_mb: default_chunk_size_mb(),
            replication: None,
            gc_interval_secs: default_gc_interval(),
        }
    }
}
