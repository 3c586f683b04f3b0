//! Storage node
//!
//! Hosts volumes in local folders and serves needle reads and writes:
//! - `store`: volume files and the per-folder slot accounting
//! - `agent`: heartbeats to the master leader and volume provisioning
//! - `http`: data and admin API

pub mod agent;
pub mod http;
pub mod server;
pub mod store;

pub use server::VolumeServer;
