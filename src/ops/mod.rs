//! Cluster operations used by the CLI and tests

pub mod client;

pub use client::MasterClient;
