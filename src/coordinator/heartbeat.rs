//! Heartbeat endpoint
//!
//! Storage nodes report their state every pulse. The leader folds the
//! report into the capacity cache and answers right away; facts that must be
//! replicated (joins, moves, departures, adopted replicas) are queued and
//! proposed by a background task, in arrival order. A heartbeat never waits
//! on consensus or placement.

use crate::common::metrics::METRICS;
use crate::common::ReplicaPlacement;
use crate::coordinator::command::{Command, CommandProposer};
use crate::coordinator::raft_node::{RaftNode, RaftRole};
use crate::coordinator::topology::{TopologyStore, VolumeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub id: VolumeId,
    pub size: u64,
    pub garbage_bytes: u64,
    pub replica_placement: ReplicaPlacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub address: String,
    pub public_url: String,
    #[serde(default)]
    pub data_center: String,
    #[serde(default)]
    pub rack: String,
    /// One entry per data folder
    pub max_volume_counts: Vec<u32>,
    #[serde(default)]
    pub volumes: Vec<VolumeSummary>,
    /// Volumes the node was told to create but could not
    #[serde(default)]
    pub failed_volumes: Vec<VolumeId>,
    /// Last heartbeat of a node shutting down
    #[serde(default)]
    pub departing: bool,
}

/// Instruction to provision a volume locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolume {
    pub vid: VolumeId,
    pub size_limit: u64,
    pub replica_placement: ReplicaPlacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HeartbeatResponse {
    Ack {
        leader: String,
        peers: Vec<String>,
        volume_size_limit: u64,
        #[serde(default)]
        create: Vec<CreateVolume>,
    },
    /// Sent by non-leaders; `leader` is `None` while no leader is known
    Redirect {
        leader: Option<String>,
        peers: Vec<String>,
    },
}

pub struct HeartbeatService {
    topology: Arc<TopologyStore>,
    raft: Arc<RaftNode>,
    queue: mpsc::UnboundedSender<Command>,
}

impl HeartbeatService {
    /// Also spawns the task that proposes heartbeat-derived commands
    pub fn new(topology: Arc<TopologyStore>, proposer: CommandProposer) -> Self {
        let raft = proposer.raft().clone();
        let (queue, mut rx) = mpsc::unbounded_channel::<Command>();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if !proposer.raft().is_leader() {
                    tracing::debug!("Dropping {:?}: no longer leader", cmd);
                    continue;
                }
                proposer.submit(cmd).await;
            }
        });
        Self {
            topology,
            raft,
            queue,
        }
    }

    pub fn handle(&self, hb: Heartbeat) -> HeartbeatResponse {
        METRICS.heartbeats_received.inc();

        let status = self.raft.status();
        if status.role != RaftRole::Leader {
            METRICS.heartbeats_redirected.inc();
            tracing::debug!(
                "Redirecting heartbeat from {} to {:?}",
                hb.address,
                status.leader
            );
            return HeartbeatResponse::Redirect {
                leader: status.leader.filter(|l| *l != status.id),
                peers: status.peers,
            };
        }

        let outcome = self.topology.apply_heartbeat(&hb, Instant::now());
        for cmd in outcome.proposals {
            if self.queue.send(cmd).is_err() {
                tracing::error!("Heartbeat proposal queue closed");
                break;
            }
        }
        if !outcome.create.is_empty() {
            tracing::info!(
                "Asking {} to create volumes {:?}",
                hb.address,
                outcome.create.iter().map(|c| c.vid).collect::<Vec<_>>()
            );
        }

        HeartbeatResponse::Ack {
            leader: status.id,
            peers: status.peers,
            volume_size_limit: self.topology.read().settings().volume_size_limit,
            create: outcome.create,
        }
    }
}

/// Mark nodes that missed `stale_after` worth of heartbeats as suspect.
/// Runs on every master; only the leader's cache is ever filled.
pub fn spawn_staleness_sweeper(
    topology: Arc<TopologyStore>,
    raft: Arc<RaftNode>,
    pulse: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pulse);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if raft.is_leader() {
                topology.sweep_stale(Instant::now(), stale_after);
            }
        }
    })
}

/// Drop the capacity cache whenever this master gains or loses leadership,
/// so a new leader only places on nodes that heartbeated it.
pub fn spawn_leadership_watcher(
    topology: Arc<TopologyStore>,
    raft: Arc<RaftNode>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status = raft.subscribe();
        let mut last = {
            let s = status.borrow();
            (s.role == RaftRole::Leader, s.term)
        };
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            let current = {
                let s = status.borrow_and_update();
                (s.role == RaftRole::Leader, s.term)
            };
            if current.0 != last.0 || (current.0 && current.1 != last.1) {
                tracing::info!(
                    "Leadership changed (leader: {}, term {}), resetting capacity cache",
                    current.0,
                    current.1
                );
                topology.reset_capacity_cache();
            }
            last = current;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RaftConfig;
    use crate::coordinator::raft_log::MemoryLogStore;
    use crate::coordinator::raft_rpc_client::LocalNetwork;
    use crate::coordinator::topology::TopologySettings;

    fn topology() -> Arc<TopologyStore> {
        Arc::new(TopologyStore::new(TopologySettings {
            default_replica_placement: ReplicaPlacement::default(),
            volume_size_limit: 4096,
            garbage_threshold: 0.3,
        }))
    }

    fn master(id: &str, peers: &[&str], topology: &Arc<TopologyStore>) -> Arc<RaftNode> {
        let net = LocalNetwork::new();
        let node = RaftNode::new(
            id.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
            RaftConfig {
                election_timeout: Duration::from_millis(50),
                heartbeat_interval: Duration::from_millis(10),
                proposal_timeout: Duration::from_secs(1),
            },
            Arc::new(MemoryLogStore::new()),
            net.transport(id),
            topology.clone(),
        )
        .unwrap();
        net.register(&node);
        node
    }

    fn report(address: &str) -> Heartbeat {
        Heartbeat {
            address: address.to_string(),
            public_url: address.to_string(),
            data_center: "dc1".into(),
            rack: "r1".into(),
            max_volume_counts: vec![3, 4],
            volumes: vec![],
            failed_volumes: vec![],
            departing: false,
        }
    }

    async fn until(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_follower_redirects() {
        let topo = topology();
        let raft = master("m1:9333", &["m2:9333"], &topo);
        let service = HeartbeatService::new(topo.clone(), CommandProposer::new(raft));

        match service.handle(report("n1:8080")) {
            HeartbeatResponse::Redirect { leader, peers } => {
                assert!(leader.is_none());
                assert_eq!(peers, vec!["m1:9333", "m2:9333"]);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert!(topo.read().node("n1:8080").is_none());
    }

    #[tokio::test]
    async fn test_leader_acks_and_registers_node() {
        let topo = topology();
        let raft = master("m1:9333", &[], &topo);
        raft.start();
        raft.mark_ready();
        until(|| raft.is_leader()).await;

        let service = HeartbeatService::new(topo.clone(), CommandProposer::new(raft.clone()));
        match service.handle(report("n1:8080")) {
            HeartbeatResponse::Ack {
                leader,
                volume_size_limit,
                create,
                ..
            } => {
                assert_eq!(leader, "m1:9333");
                assert_eq!(volume_size_limit, 4096);
                assert!(create.is_empty());
            }
            other => panic!("unexpected response {other:?}"),
        }

        until(|| topo.read().node("n1:8080").is_some()).await;
        assert_eq!(topo.read().node("n1:8080").unwrap().max_volumes, 7);
        assert_eq!(topo.read().free_slots("n1:8080"), 7);
        raft.shutdown();
    }

    #[tokio::test]
    async fn test_departure_is_committed() {
        let topo = topology();
        let raft = master("m1:9333", &[], &topo);
        raft.start();
        raft.mark_ready();
        until(|| raft.is_leader()).await;

        let service = HeartbeatService::new(topo.clone(), CommandProposer::new(raft.clone()));
        service.handle(report("n1:8080"));
        until(|| topo.read().node("n1:8080").is_some()).await;

        let mut bye = report("n1:8080");
        bye.departing = true;
        service.handle(bye);
        until(|| topo.read().node("n1:8080").is_none()).await;
        raft.shutdown();
    }

    #[test]
    fn test_response_wire_format() {
        let json = serde_json::to_value(HeartbeatResponse::Redirect {
            leader: Some("m2:9333".into()),
            peers: vec![],
        })
        .unwrap();
        assert_eq!(json["status"], "redirect");
        assert_eq!(json["leader"], "m2:9333");

        let hb: Heartbeat = serde_json::from_str(
            r#"{"address":"n:1","public_url":"n:1","max_volume_counts":[7]}"#,
        )
        .unwrap();
        assert!(hb.volumes.is_empty());
        assert!(!hb.departing);
    }
}
