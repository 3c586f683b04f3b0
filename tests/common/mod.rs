//! Shared fixtures for the integration tests

#![allow(dead_code)]

use miniblob::common::{RaftConfig, ReplicaPlacement};
use miniblob::coordinator::command::CommandProposer;
use miniblob::coordinator::heartbeat::Heartbeat;
use miniblob::coordinator::raft_log::MemoryLogStore;
use miniblob::coordinator::raft_node::RaftNode;
use miniblob::coordinator::raft_rpc_client::LocalNetwork;
use miniblob::coordinator::topology::{TopologySettings, TopologyStore};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn raft_config() -> RaftConfig {
    RaftConfig {
        election_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(20),
        proposal_timeout: Duration::from_secs(2),
    }
}

pub fn settings() -> TopologySettings {
    TopologySettings {
        default_replica_placement: ReplicaPlacement::default(),
        volume_size_limit: 1 << 20,
        garbage_threshold: 0.3,
    }
}

pub struct Member {
    pub id: String,
    pub raft: Arc<RaftNode>,
    pub topology: Arc<TopologyStore>,
}

impl Member {
    pub fn proposer(&self) -> CommandProposer {
        CommandProposer::new(self.raft.clone())
    }
}

/// Masters wired together over an in-process network
pub struct Cluster {
    pub net: Arc<LocalNetwork>,
    pub members: Vec<Member>,
}

impl Cluster {
    pub fn start(size: usize) -> Self {
        let net = LocalNetwork::new();
        let ids: Vec<String> = (1..=size).map(|i| format!("m{}:9333", i)).collect();
        let members = ids
            .iter()
            .map(|id| {
                let topology = Arc::new(TopologyStore::new(settings()));
                let raft = RaftNode::new(
                    id.clone(),
                    ids.clone(),
                    raft_config(),
                    Arc::new(MemoryLogStore::new()),
                    net.transport(id),
                    topology.clone(),
                )
                .unwrap();
                net.register(&raft);
                Member {
                    id: id.clone(),
                    raft,
                    topology,
                }
            })
            .collect::<Vec<_>>();
        for member in &members {
            member.raft.start();
            member.raft.mark_ready();
        }
        Self { net, members }
    }

    pub fn member(&self, id: &str) -> &Member {
        self.members.iter().find(|m| m.id == id).unwrap()
    }

    /// Current leaders as (id, term)
    pub fn leaders(&self) -> Vec<(String, u64)> {
        self.members
            .iter()
            .filter_map(|m| {
                let status = m.raft.status();
                (status.role == miniblob::coordinator::raft_node::RaftRole::Leader)
                    .then(|| (status.id, status.term))
            })
            .collect()
    }

    /// Wait until exactly one of `candidates` leads and the others follow it
    pub async fn wait_for_leader_among(&self, candidates: &[&str], timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let leaders: Vec<&Member> = self
                .members
                .iter()
                .filter(|m| candidates.contains(&m.id.as_str()) && m.raft.is_leader())
                .collect();
            if let [leader] = leaders.as_slice() {
                let agreed = self
                    .members
                    .iter()
                    .filter(|m| candidates.contains(&m.id.as_str()))
                    .all(|m| m.raft.current_leader().as_deref() == Some(leader.id.as_str()));
                if agreed {
                    return leader.id.clone();
                }
            }
            assert!(Instant::now() < deadline, "no stable leader among {:?}", candidates);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> String {
        let ids: Vec<&str> = self.members.iter().map(|m| m.id.as_str()).collect();
        self.wait_for_leader_among(&ids, timeout).await
    }

    /// Wait until `check` holds on every member
    pub async fn wait_until<F>(&self, timeout: Duration, check: F)
    where
        F: Fn(&Member) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !self.members.iter().all(&check) {
            assert!(Instant::now() < deadline, "members did not converge");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn shutdown(&self) {
        for member in &self.members {
            member.raft.shutdown();
        }
    }
}

pub fn heartbeat(address: &str, dc: &str, rack: &str, slots: u32) -> Heartbeat {
    Heartbeat {
        address: address.to_string(),
        public_url: address.to_string(),
        data_center: dc.to_string(),
        rack: rack.to_string(),
        max_volume_counts: vec![slots],
        volumes: vec![],
        failed_volumes: vec![],
        departing: false,
    }
}
