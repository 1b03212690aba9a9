//! Common utilities and types shared across miniweed

pub mod config;
pub mod error;
pub mod hash;
pub mod raft;
pub mod types;
pub mod utils;

pub use config::{
    Config, EcConfig, FaultDomain, FilerConfig, MasterConfig, PeerConfig, SyncPolicy,
    VolumeConfig,
};
pub use error::{Error, ErrorBody, Result};
pub use hash::{blake3_hash, hrw_hash, hrw_weight, select_replicas, Blake3Hasher};
pub use types::*;
pub use utils::{
    crc32, encode_query_value, format_bytes, normalize_url, parse_duration, retry_with_backoff,
    shutdown_signal, timestamp_now, timestamp_now_millis, timestamp_now_nanos, NodeState,
};
