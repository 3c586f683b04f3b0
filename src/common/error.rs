//! Error types for miniblob

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
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Volume {0} not found")]
    VolumeNotFound(u32),

    #[error("Volume {0} reached its size limit")]
    VolumeFull(u32),

    // === Raft Errors ===
    #[error("Not leader: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotLeader(Option<String>),

    #[error("No leader elected")]
    NoLeaderElected,

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Leadership lost before the entry was committed")]
    LeadershipLost,

    // === Placement Errors ===
    #[error("Insufficient capacity for placement {placement}: {reason}")]
    InsufficientCapacity { placement: String, reason: String },

    #[error("Placement conflict: {0}")]
    PlacementConflict(String),

    #[error("Invalid replica placement: {0}")]
    InvalidReplicaPlacement(String),

    #[error("Capacity mismatch on {node}: {reason}")]
    CapacityMismatch { node: String, reason: String },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConsensusTimeout
                | Error::LeadershipLost
                | Error::NotLeader(_)
                | Error::NoLeaderElected
                | Error::PlacementConflict(_)
        )
    }

    /// Leader hint carried by leadership errors, if any.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Error::NotLeader(Some(leader)) => Some(leader),
            _ => None,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::VolumeNotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) | Error::InvalidReplicaPlacement(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Timeout(_) | Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::InsufficientCapacity { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Error::VolumeFull(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NoLeaderElected | Error::LeadershipLost | Error::PlacementConflict(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire form used in JSON error responses
    pub fn to_body(&self) -> ErrorBody {
        let kind = match self {
            Error::NotLeader(_) => ErrorKind::NotLeader,
            Error::NoLeaderElected => ErrorKind::NoLeaderElected,
            Error::InsufficientCapacity { .. } => ErrorKind::InsufficientCapacity,
            Error::ConsensusTimeout | Error::LeadershipLost | Error::PlacementConflict(_) => {
                ErrorKind::Unavailable
            }
            Error::InvalidReplicaPlacement(_) | Error::InvalidConfig(_) => ErrorKind::BadRequest,
            Error::NotFound(_) | Error::VolumeNotFound(_) => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            _ => ErrorKind::Internal,
        };
        ErrorBody {
            kind,
            error: self.to_string(),
            leader: self.leader_hint().map(str::to_string),
        }
    }
}

/// Error kinds exchanged between masters, nodes and clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotLeader,
    NoLeaderElected,
    InsufficientCapacity,
    Unavailable,
    BadRequest,
    NotFound,
    Forbidden,
    Internal,
}

/// JSON body returned alongside a non-2xx status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        match body.kind {
            ErrorKind::NotLeader => Error::NotLeader(body.leader),
            ErrorKind::NoLeaderElected => Error::NoLeaderElected,
            ErrorKind::InsufficientCapacity => Error::InsufficientCapacity {
                placement: String::new(),
                reason: body.error,
            },
            ErrorKind::Unavailable => Error::ConsensusTimeout,
            ErrorKind::BadRequest => Error::InvalidConfig(body.error),
            ErrorKind::NotFound => Error::NotFound(body.error),
            ErrorKind::Forbidden => Error::Forbidden(body.error),
            ErrorKind::Internal => Error::Internal(body.error),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (self.to_http_status(), axum::Json(self.to_body())).into_response()
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

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
