//! # miniblob
//!
//! Coordination core of a distributed blob store:
//! - Masters replicate the cluster topology and volume-id allocation with Raft
//! - Storage nodes heartbeat their capacity and volumes to the leader
//! - The leader places new volumes across data centers, racks and nodes
//!   according to a three-digit replica placement code
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             Master Cluster              │
//! │   (Raft over topology + volume ids)     │
//! │   - Leader: heartbeats, allocation      │
//! │   - Followers: replicate, redirect      │
//! └───────────┬─────────────────────────────┘
//!             │ HTTP heartbeats
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Node 1     │   │ Node 2     │   │ Node 3     │
//! │ dc1 / r1   │   │ dc1 / r2   │   │ dc2 / r1   │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start masters
//! ```bash
//! miniblob-master --address m1:9333 --peers m2:9333,m3:9333 --meta-dir ./m1
//! ```
//!
//! ### Start a storage node
//! ```bash
//! miniblob-volume --address 10.0.0.5:8080 --dir ./data --max 7 \
//!   --master m1:9333 --data-center dc1 --rack r1
//! ```
//!
//! ### Master and storage node in one process
//! ```bash
//! miniblob-server --dir ./data --meta-dir ./meta
//! ```
//!
//! ### Use the CLI
//! ```bash
//! miniblob assign --replication 010 --count 2
//! miniblob lookup 7
//! miniblob cluster-status
//! ```

pub mod bootstrap;
pub mod common;
pub mod coordinator;
pub mod ops;
pub mod volume;

// Re-export commonly used types
pub use bootstrap::{Bootstrap, StartupPhase};
pub use common::{Config, Error, Result};
pub use coordinator::MasterServer;
pub use volume::VolumeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
