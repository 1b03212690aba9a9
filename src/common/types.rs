//! Wire types shared by masters, volume servers, filers and the CLI

use crate::common::{Error, NodeState, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type VolumeId = u32;
pub type NeedleKey = u64;
pub type Cookie = u32;
pub type ShardId = u8;

/// Address of a needle: `<vid>,<key hex><cookie as 8 hex digits>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleKey,
    pub cookie: Cookie,
}

impl FileId {
    pub fn new(volume_id: VolumeId, key: NeedleKey, cookie: Cookie) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{:x}{:08x}", self.volume_id, self.key, self.cookie)
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid file id: {}", s));
        let (vid, rest) = s.split_once(',').ok_or_else(invalid)?;
        let volume_id: VolumeId = vid.trim().parse().map_err(|_| invalid())?;

        // Tolerate a trailing extension such as "3,01637037d6.jpg"
        let rest = rest.split('.').next().unwrap_or(rest);
        if rest.len() <= 8 || rest.len() > 24 || !rest.is_ascii() {
            return Err(invalid());
        }
        let (key_hex, cookie_hex) = rest.split_at(rest.len() - 8);
        let key = NeedleKey::from_str_radix(key_hex, 16).map_err(|_| invalid())?;
        let cookie = Cookie::from_str_radix(cookie_hex, 16).map_err(|_| invalid())?;
        Ok(FileId::new(volume_id, key, cookie))
    }
}

/// Per-volume state reported in a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub id: VolumeId,
    pub size: u64,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_bytes: u64,
    pub read_only: bool,
    pub replication: String,
    /// Bumped by every vacuum
    pub compaction_revision: u16,
    pub max_needle_key: NeedleKey,
    /// Unix seconds of the last append
    pub modified_at: u64,
}

/// EC shards of one volume held by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcShardSummary {
    pub volume_id: VolumeId,
    pub shard_ids: Vec<ShardId>,
}

/// Volume server → master status push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Server id, also its internal URL
    pub url: String,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
    pub max_volumes: u32,
    /// Monotonic per server process; lower sequences are stale
    pub sequence: u64,
    pub volumes: Vec<VolumeSummary>,
    pub ec_shards: Vec<EcShardSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub leader: String,
    pub term: u64,
    pub volume_size_limit: u64,
}

/// Where a volume (or shard) can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub url: String,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    /// Number of consecutive needle keys to reserve
    #[serde(default = "default_count")]
    pub count: u64,
    /// Bytes the caller is about to write
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub replication: Option<String>,
    #[serde(default)]
    pub data_center: Option<String>,
}

fn default_count() -> u64 {
    1
}

impl Default for AssignRequest {
    fn default() -> Self {
        Self {
            count: 1,
            size: 0,
            replication: None,
            data_center: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub fid: String,
    pub volume_id: VolumeId,
    pub url: String,
    pub public_url: String,
    pub replicas: Vec<Location>,
    pub count: u64,
    /// Raft term of the master that handed this out
    pub term: u64,
}

impl Assignment {
    pub fn file_id(&self) -> Result<FileId> {
        self.fid.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcShardLocation {
    pub shard_id: ShardId,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub volume_id: VolumeId,
    pub locations: Vec<Location>,
    #[serde(default)]
    pub ec_shards: Vec<EcShardLocation>,
    #[serde(default)]
    pub data_shards: usize,
    #[serde(default)]
    pub parity_shards: usize,
}

impl LookupResponse {
    pub fn is_ec(&self) -> bool {
        !self.ec_shards.is_empty()
    }
}

/// Metadata of an encoded volume, persisted as `<vid>.vif`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcVolumeInfo {
    pub volume_id: VolumeId,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Size of the source `.dat`
    pub dat_size: u64,
    pub shard_size: u64,
    /// blake3 hex per shard, indexed by shard id
    pub shard_checksums: Vec<String>,
    pub needle_count: u64,
    pub replication: String,
}

impl EcVolumeInfo {
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

/// Destination acknowledgement for a shard copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAck {
    pub shard_id: ShardId,
    pub checksum: String,
    pub size: u64,
}

/// Response to a needle upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub fid: String,
    pub size: u64,
    pub etag: String,
}

/// Server view used by status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub url: String,
    pub data_center: String,
    pub rack: String,
    pub state: NodeState,
    pub volumes: Vec<VolumeId>,
    pub ec_shards: Vec<EcShardSummary>,
    pub free_slots: i64,
}

/// Ask a volume server to pull EC files of a volume from `source`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcCopyRequest {
    pub source: String,
    pub shard_ids: Vec<ShardId>,
    /// Also copy `.ecx` and `.vif`
    pub include_index: bool,
}

/// Ask a volume server to regenerate `missing` shards from `sources`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcRebuildRequest {
    /// Surviving shard → holder url; at least `data_shards` entries
    pub sources: Vec<(ShardId, String)>,
    pub missing: Vec<ShardId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardIdsRequest {
    pub shard_ids: Vec<ShardId>,
}

/// Per-volume result of a volume server verify pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeVerifyReport {
    pub volume_id: VolumeId,
    pub needles: u64,
    pub corrupt_keys: Vec<NeedleKey>,
}
