//! Startup sequencing
//!
//! A process that runs a master (alone or next to a storage node) walks
//! through these phases in order:
//!
//! ```text
//! Starting → EndpointReady → ConsensusInitialized → NodeAgentAllowed
//! ```
//!
//! - `EndpointReady`: the HTTP listener is bound and serving, so peers can
//!   reach the Raft RPC routes
//! - `ConsensusInitialized`: the Raft node has loaded its log, knows its
//!   peers and may start elections
//! - `NodeAgentAllowed`: a co-located storage node may start heartbeating
//!
//! Components wait on the phase they need instead of sleeping.

use crate::common::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StartupPhase {
    Starting,
    EndpointReady,
    ConsensusInitialized,
    NodeAgentAllowed,
}

impl StartupPhase {
    fn next(self) -> Option<Self> {
        match self {
            StartupPhase::Starting => Some(StartupPhase::EndpointReady),
            StartupPhase::EndpointReady => Some(StartupPhase::ConsensusInitialized),
            StartupPhase::ConsensusInitialized => Some(StartupPhase::NodeAgentAllowed),
            StartupPhase::NodeAgentAllowed => None,
        }
    }
}

impl std::fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupPhase::Starting => write!(f, "starting"),
            StartupPhase::EndpointReady => write!(f, "endpoint-ready"),
            StartupPhase::ConsensusInitialized => write!(f, "consensus-initialized"),
            StartupPhase::NodeAgentAllowed => write!(f, "node-agent-allowed"),
        }
    }
}

/// Shared readiness signal; clones observe the same phase
#[derive(Clone)]
pub struct Bootstrap {
    tx: Arc<watch::Sender<StartupPhase>>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootstrap {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StartupPhase::Starting);
        Self { tx: Arc::new(tx) }
    }

    /// Already at the last phase; for a storage node without a local master
    pub fn completed() -> Self {
        let (tx, _) = watch::channel(StartupPhase::NodeAgentAllowed);
        Self { tx: Arc::new(tx) }
    }

    pub fn phase(&self) -> StartupPhase {
        *self.tx.borrow()
    }

    /// Move to `phase`, which must directly follow the current one
    pub fn advance(&self, phase: StartupPhase) -> Result<()> {
        let current = self.phase();
        if current.next() != Some(phase) {
            return Err(Error::Internal(format!(
                "startup phase {} cannot follow {}",
                phase, current
            )));
        }
        self.tx.send_replace(phase);
        tracing::info!("Startup phase: {}", phase);
        Ok(())
    }

    /// Resolve once `phase` (or a later one) is reached
    pub async fn wait_for(&self, phase: StartupPhase) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|current| *current >= phase).await;
    }
}

/// Flips to `true` on Ctrl-C
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_phases_advance_in_order() {
        let boot = Bootstrap::new();
        assert!(boot.advance(StartupPhase::ConsensusInitialized).is_err());
        boot.advance(StartupPhase::EndpointReady).unwrap();
        boot.advance(StartupPhase::ConsensusInitialized).unwrap();
        assert!(boot.advance(StartupPhase::EndpointReady).is_err());
        boot.advance(StartupPhase::NodeAgentAllowed).unwrap();
        assert_eq!(boot.phase(), StartupPhase::NodeAgentAllowed);
    }

    #[tokio::test]
    async fn test_waiter_released_only_at_its_phase() {
        let boot = Bootstrap::new();
        let waiter = {
            let boot = boot.clone();
            tokio::spawn(async move { boot.wait_for(StartupPhase::NodeAgentAllowed).await })
        };

        boot.advance(StartupPhase::EndpointReady).unwrap();
        boot.advance(StartupPhase::ConsensusInitialized).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        boot.advance(StartupPhase::NodeAgentAllowed).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_completed_does_not_block() {
        let boot = Bootstrap::completed();
        tokio::time::timeout(
            Duration::from_millis(100),
            boot.wait_for(StartupPhase::NodeAgentAllowed),
        )
        .await
        .unwrap();
    }
}
