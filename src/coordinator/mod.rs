//! Master
//!
//! The master is responsible for:
//! - Cluster topology (data centers, racks, nodes, volumes)
//! - Replica placement and volume allocation
//! - Heartbeat intake from storage nodes
//! - Consensus among masters via Raft

pub mod allocation;
pub mod command;
pub mod heartbeat;
pub mod http;
pub mod placement;
pub mod raft_log;
pub mod raft_node;
pub mod raft_rpc_client;
pub mod server;
pub mod topology;
pub mod volume_client;

pub use server::MasterServer;
