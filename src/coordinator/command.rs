//! Replicated topology commands
//!
//! Every ledger change travels through the raft log as a bincode-encoded
//! [`Command`]. The topology applies them in log order on every master.

use crate::common::metrics::METRICS;
use crate::common::{Error, ReplicaPlacement, Result};
use crate::coordinator::raft_node::{RaftNode, StateMachine};
use crate::coordinator::topology::{NodeRegistration, TopologyStore, VolumeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Add a node, or move/resize an existing one
    RegisterNode(NodeRegistration),
    /// Explicit departure
    RemoveNode { address: String },
    /// Reserve `count` consecutive VolumeIds
    AllocateVolumeIds { count: u32 },
    /// Record a batch of placed volumes; all or none
    RecordVolumesCreated { volumes: Vec<NewVolume> },
    /// A replica the ledger did not know about showed up in a heartbeat
    AdoptReplica {
        vid: VolumeId,
        node: String,
        replica_placement: ReplicaPlacement,
        size_limit: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVolume {
    pub vid: VolumeId,
    pub replica_placement: ReplicaPlacement,
    pub size_limit: u64,
    /// Primary first
    pub nodes: Vec<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Applied,
    VolumeIds { start: VolumeId, count: u32 },
    Rejected(String),
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::MetadataCorrupted(e.to_string()))
    }
}

impl CommandOutcome {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::Raft(format!("undecodable command outcome: {}", e)))
    }
}

impl StateMachine for TopologyStore {
    fn apply(&self, index: u64, data: &[u8]) -> Vec<u8> {
        let outcome = match Command::decode(data) {
            Ok(cmd) => {
                let outcome = self.apply_command(&cmd);
                if let CommandOutcome::Rejected(reason) = &outcome {
                    tracing::debug!("Entry {} rejected: {}", index, reason);
                }
                outcome
            }
            Err(e) => {
                tracing::error!("Entry {} is not a topology command: {}", index, e);
                CommandOutcome::Rejected(e.to_string())
            }
        };
        outcome.encode()
    }
}

/// Leader-side helper turning commands into committed outcomes
#[derive(Clone)]
pub struct CommandProposer {
    raft: Arc<RaftNode>,
}

impl CommandProposer {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Replicate a command and return what the ledger made of it
    pub async fn propose(&self, cmd: &Command) -> Result<CommandOutcome> {
        let output = self.raft.propose(cmd.encode()?).await?;
        CommandOutcome::decode(&output)
    }

    /// Reserve `count` VolumeIds; returns the first one
    pub async fn allocate_volume_ids(&self, count: u32) -> Result<VolumeId> {
        match self.propose(&Command::AllocateVolumeIds { count }).await? {
            CommandOutcome::VolumeIds { start, .. } => Ok(start),
            other => Err(Error::Internal(format!(
                "unexpected outcome for id allocation: {:?}",
                other
            ))),
        }
    }

    /// Record placed volumes. A rejection means the ledger changed since the
    /// plan was made.
    pub async fn record_volumes_created(&self, volumes: Vec<NewVolume>) -> Result<()> {
        match self.propose(&Command::RecordVolumesCreated { volumes }).await? {
            CommandOutcome::Applied => Ok(()),
            CommandOutcome::Rejected(reason) => {
                METRICS.placement_conflicts.inc();
                Err(Error::PlacementConflict(reason))
            }
            other => Err(Error::Internal(format!(
                "unexpected outcome for volume record: {:?}",
                other
            ))),
        }
    }

    /// Fire-and-log proposal for facts learned from heartbeats
    pub async fn submit(&self, cmd: Command) {
        match self.propose(&cmd).await {
            Ok(CommandOutcome::Rejected(reason)) => {
                tracing::debug!("{:?} rejected: {}", cmd, reason)
            }
            Ok(_) => tracing::debug!("{:?} committed", cmd),
            Err(e) => tracing::warn!("Failed to commit {:?}: {}", cmd, e),
        }
    }
}
