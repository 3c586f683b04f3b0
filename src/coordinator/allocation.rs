//! Placement/allocation service
//!
//! Handles assign requests on the leader:
//! 1. snapshot candidate capacity from the topology
//! 2. plan every requested volume with the placement policy
//! 3. reserve VolumeIds through consensus
//! 4. record the placed volumes through consensus
//!
//! The record step is re-validated against the replicated ledger when it
//! commits. A rejection means the ledger moved underneath the plan (a node
//! left, or capacity changed); the whole request is re-planned. Reserved ids
//! that end up unused are simply skipped, never reissued.

use crate::common::metrics::METRICS;
use crate::common::{timestamp_now, Error, ReplicaPlacement, Result};
use crate::coordinator::command::{CommandProposer, NewVolume};
use crate::coordinator::heartbeat::CreateVolume;
use crate::coordinator::placement::{plan_volumes, PlacementHint};
use crate::coordinator::topology::{NodeLocation, TopologyStore, VolumeId};
use crate::coordinator::volume_client::VolumeClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Attempts before a request that keeps losing commit-time validation fails
const MAX_PLAN_ATTEMPTS: usize = 3;

/// Upper bound on volumes per assign request
pub const MAX_ASSIGN_COUNT: u32 = 64;

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignRequest {
    #[serde(default = "default_count")]
    pub count: u32,
    /// Placement code; the cluster default when absent
    #[serde(default)]
    pub replication: Option<String>,
    #[serde(default, rename = "dataCenter")]
    pub data_center: Option<String>,
    #[serde(default)]
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedVolume {
    pub vid: VolumeId,
    pub replica_placement: ReplicaPlacement,
    /// Primary first
    pub nodes: Vec<NodeLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub volumes: Vec<AssignedVolume>,
}

pub struct AllocationService {
    topology: Arc<TopologyStore>,
    proposer: CommandProposer,
    volume_client: VolumeClient,
    // One allocation in flight at a time, so plans are made against
    // the outcome of the previous one
    lock: Mutex<()>,
}

impl AllocationService {
    pub fn new(
        topology: Arc<TopologyStore>,
        proposer: CommandProposer,
        volume_client: VolumeClient,
    ) -> Self {
        Self {
            topology,
            proposer,
            volume_client,
            lock: Mutex::new(()),
        }
    }

    pub async fn assign(&self, req: AssignRequest) -> Result<AssignResponse> {
        if req.count == 0 || req.count > MAX_ASSIGN_COUNT {
            return Err(Error::InvalidConfig(format!(
                "count must be between 1 and {}",
                MAX_ASSIGN_COUNT
            )));
        }
        let (policy, size_limit) = {
            let topo = self.topology.read();
            let policy = match req.replication.as_deref() {
                Some(code) if !code.trim().is_empty() => code.parse::<ReplicaPlacement>()?,
                _ => topo.settings().default_replica_placement,
            };
            (policy, topo.settings().volume_size_limit)
        };
        let hint = PlacementHint {
            data_center: req.data_center.filter(|s| !s.is_empty()),
            rack: req.rack.filter(|s| !s.is_empty()),
        };

        self.proposer.raft().ensure_leader()?;
        let _guard = self.lock.lock().await;

        let mut attempt = 0;
        let volumes = loop {
            attempt += 1;
            match self.try_assign(&policy, size_limit, req.count, &hint).await {
                Ok(volumes) => break volumes,
                Err(Error::PlacementConflict(reason)) if attempt < MAX_PLAN_ATTEMPTS => {
                    tracing::warn!(
                        "Placement for {} lost commit-time validation ({}), retrying",
                        policy,
                        reason
                    );
                }
                Err(e) => return Err(e),
            }
        };

        METRICS.volumes_assigned.add(volumes.len() as u64);
        self.notify_nodes(&volumes, size_limit);

        let topo = self.topology.read();
        let assigned = volumes
            .into_iter()
            .map(|vol| AssignedVolume {
                vid: vol.vid,
                replica_placement: vol.replica_placement,
                nodes: topo.lookup(vol.vid).unwrap_or_default(),
            })
            .collect();
        Ok(AssignResponse { volumes: assigned })
    }

    async fn try_assign(
        &self,
        policy: &ReplicaPlacement,
        size_limit: u64,
        count: u32,
        hint: &PlacementHint,
    ) -> Result<Vec<NewVolume>> {
        let candidates = self.topology.list_data_nodes_with_free_slots();
        let plans = match plan_volumes(policy, &candidates, count as usize, hint) {
            Ok(plans) => plans,
            Err(e) => {
                if matches!(e, Error::InsufficientCapacity { .. }) {
                    METRICS.insufficient_capacity.inc();
                    tracing::warn!("{}", e);
                }
                return Err(e);
            }
        };

        let start = self.proposer.allocate_volume_ids(count).await?;
        let created_at = timestamp_now();
        let volumes: Vec<NewVolume> = plans
            .into_iter()
            .zip(start..)
            .map(|(nodes, vid)| NewVolume {
                vid,
                replica_placement: *policy,
                size_limit,
                nodes,
                created_at,
            })
            .collect();

        self.proposer.record_volumes_created(volumes.clone()).await?;
        for vol in &volumes {
            tracing::info!(
                "Volume {} ({}) placed on {:?}",
                vol.vid,
                vol.replica_placement,
                vol.nodes
            );
        }
        Ok(volumes)
    }

    /// Push create instructions without waiting for the next heartbeat.
    /// Best effort: heartbeats deliver the same instruction anyway.
    fn notify_nodes(&self, volumes: &[NewVolume], size_limit: u64) {
        for vol in volumes {
            for node in &vol.nodes {
                let client = self.volume_client.clone();
                let node = node.clone();
                let req = CreateVolume {
                    vid: vol.vid,
                    size_limit,
                    replica_placement: vol.replica_placement,
                };
                tokio::spawn(async move {
                    if let Err(e) = client.assign_volume(&node, &req).await {
                        tracing::debug!(
                            "Push of volume {} to {} failed, heartbeat will retry: {}",
                            req.vid,
                            node,
                            e
                        );
                    }
                });
            }
        }
    }
}
