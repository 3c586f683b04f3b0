//! Common utilities and types shared across miniblob

pub mod config;
pub mod error;
pub mod metrics;
pub mod replica;
pub mod tracing_middleware;
pub mod utils;
pub mod whitelist;

pub use config::{Config, MasterConfig, RaftConfig, VolumeConfig};
pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use replica::ReplicaPlacement;
pub use utils::{crc32, format_bytes, http_url, parse_duration, timestamp_now, NodeState};
pub use whitelist::Whitelist;
