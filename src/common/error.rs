//! Error types for miniweed

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupted data: {0}")]
    Corrupt(String),

    #[error("Volume {0} is full")]
    Full(u32),

    #[error("Volume {0} is read-only")]
    ReadOnly(u32),

    // === Raft Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader available")]
    LeaderUnavailable,

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Stale term {term}, current term is {current}")]
    StaleTerm { term: u64, current: u64 },

    // === Placement Errors ===
    #[error("Placement infeasible: need {needed} fault domains, have {available}")]
    PlacementInfeasible { needed: usize, available: usize },

    #[error("Insufficient replicas: need {needed}, have {available}")]
    InsufficientReplicas { needed: usize, available: usize },

    #[error("No writable volumes")]
    NoWritableVolumes,

    // === Erasure Coding Errors ===
    #[error("Shard distribution for volume {volume_id} failed on shards {failed:?}: {reason}")]
    PartialShardFailure {
        volume_id: u32,
        failed: Vec<u8>,
        reason: String,
    },

    #[error("Insufficient shards: need {needed}, have {available}")]
    InsufficientShards { needed: usize, available: usize },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config / Input Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Generic ===
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error body exchanged between nodes so an error keeps its kind
/// across HTTP hops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<u32>,
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::Http(_)
                | Error::ConsensusTimeout
                | Error::NotLeader(_)
                | Error::LeaderUnavailable
        )
    }

    /// Stable tag used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::NotFound(_) => "not_found",
            Error::Corrupt(_) => "corrupt",
            Error::Full(_) => "full",
            Error::ReadOnly(_) => "read_only",
            Error::NotLeader(_) => "not_leader",
            Error::LeaderUnavailable => "leader_unavailable",
            Error::ConsensusTimeout => "consensus_timeout",
            Error::StaleTerm { .. } => "stale_term",
            Error::PlacementInfeasible { .. } => "placement_infeasible",
            Error::InsufficientReplicas { .. } => "insufficient_replicas",
            Error::NoWritableVolumes => "no_writable_volumes",
            Error::PartialShardFailure { .. } => "partial_shard_failure",
            Error::InsufficientShards { .. } => "insufficient_shards",
            Error::Http(_) => "http",
            Error::ConnectionFailed(_) => "connection_failed",
            Error::InvalidConfig(_) => "invalid_config",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::InvalidState(_) => "invalid_state",
            Error::Serialization(_) => "serialization",
            Error::Cancelled(_) => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::InvalidState(_) | Error::ReadOnly(_) | Error::StaleTerm { .. } => {
                StatusCode::CONFLICT
            }
            Error::Full(_) => StatusCode::INSUFFICIENT_STORAGE,
            Error::Timeout(_) | Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::LeaderUnavailable
            | Error::NoWritableVolumes
            | Error::InsufficientReplicas { .. }
            | Error::InsufficientShards { .. }
            | Error::PlacementInfeasible { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
            leader: match self {
                Error::NotLeader(leader) => Some(leader.clone()),
                _ => None,
            },
            volume_id: match self {
                Error::Full(vid) | Error::ReadOnly(vid) => Some(*vid),
                Error::PartialShardFailure { volume_id, .. } => Some(*volume_id),
                _ => None,
            },
        }
    }

    /// Rebuild an error received from a peer. Variants with structured
    /// payloads come back with their message only.
    pub fn from_body(body: ErrorBody) -> Self {
        let vid = body.volume_id.unwrap_or_default();
        match body.kind.as_str() {
            "not_found" => Error::NotFound(body.message),
            "corrupt" => Error::Corrupt(body.message),
            "full" => Error::Full(vid),
            "read_only" => Error::ReadOnly(vid),
            "not_leader" => match body.leader {
                Some(leader) if !leader.is_empty() => Error::NotLeader(leader),
                _ => Error::LeaderUnavailable,
            },
            "leader_unavailable" => Error::LeaderUnavailable,
            "consensus_timeout" => Error::ConsensusTimeout,
            "placement_infeasible" | "insufficient_replicas" | "no_writable_volumes" => {
                Error::InvalidState(body.message)
            }
            "partial_shard_failure" => Error::PartialShardFailure {
                volume_id: vid,
                failed: Vec::new(),
                reason: body.message,
            },
            "invalid_argument" | "invalid_config" => Error::InvalidArgument(body.message),
            "invalid_state" | "stale_term" => Error::InvalidState(body.message),
            "timeout" => Error::Timeout(body.message),
            _ => Error::Http(body.message),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected: {}", self);
        }
        let body = self.to_body();
        let mut response = (status, axum::Json(&body)).into_response();
        if let Some(leader) = body.leader.as_deref() {
            if let Ok(value) = HeaderValue::from_str(leader) {
                response.headers_mut().insert("x-leader", value);
            }
        }
        response
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
