//! Topology store
//!
//! The cluster model is owned top-down: `Topology` → `DataCenter` → `Rack` →
//! `DataNode`. Reverse lookups go through `node_index` (address → data
//! center and rack); nodes never point back at their parents.
//!
//! Two kinds of state live here:
//! - the **ledger**: node registrations, the volume table and the VolumeId
//!   counter. It changes only through [`Topology::apply`], called with
//!   committed log entries, so every master holds the same copy.
//! - the **capacity cache**: what each node reported in its last heartbeat.
//!   Only the leader fills it, and it is dropped on leadership changes.
//!
//! Uniqueness: a node address appears in at most one rack; a VolumeId
//! appears at most once in the volume table and is never handed out twice.

use crate::common::{NodeState, ReplicaPlacement};
use crate::coordinator::command::{Command, CommandOutcome, NewVolume};
use crate::coordinator::heartbeat::{CreateVolume, Heartbeat};
use crate::coordinator::placement::{satisfies_spread, Candidate};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

pub type VolumeId = u32;

pub const DEFAULT_DATA_CENTER: &str = "DefaultDataCenter";
pub const DEFAULT_RACK: &str = "DefaultRack";

pub fn normalize_data_center(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        DEFAULT_DATA_CENTER.to_string()
    } else {
        name.to_string()
    }
}

pub fn normalize_rack(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        DEFAULT_RACK.to_string()
    } else {
        name.to_string()
    }
}

/// Replicated description of a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub address: String,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
    pub max_volumes: u32,
}

/// Replicated description of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub replica_placement: ReplicaPlacement,
    pub size_limit: u64,
    /// Hosting nodes, primary first
    pub replicas: Vec<String>,
    /// Unix seconds; 0 for volumes adopted from heartbeats
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct DataNode {
    pub address: String,
    pub public_url: String,
    pub max_volumes: u32,
    /// Volumes the ledger assigns to this node
    pub volumes: BTreeSet<VolumeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Rack {
    pub nodes: BTreeMap<String, DataNode>,
}

#[derive(Debug, Clone, Default)]
pub struct DataCenter {
    pub racks: BTreeMap<String, Rack>,
}

/// Per-volume usage reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStat {
    pub size: u64,
    pub garbage_bytes: u64,
}

/// Leader-side view of a node, rebuilt from every heartbeat
#[derive(Debug, Clone)]
struct NodeLive {
    last_seen: Instant,
    state: NodeState,
    max_volumes: u32,
    hosted: BTreeMap<VolumeId, VolumeStat>,
    failed: BTreeSet<VolumeId>,
}

/// Cluster-wide settings the topology was built with
#[derive(Debug, Clone)]
pub struct TopologySettings {
    pub default_replica_placement: ReplicaPlacement,
    /// Bytes
    pub volume_size_limit: u64,
    pub garbage_threshold: f64,
}

/// What a heartbeat asks of the caller
#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    /// Topology-level facts to commit, in order
    pub proposals: Vec<Command>,
    /// Volumes the node should provision
    pub create: Vec<CreateVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLocation {
    pub address: String,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct Topology {
    settings: TopologySettings,
    data_centers: BTreeMap<String, DataCenter>,
    node_index: HashMap<String, (String, String)>,
    volumes: BTreeMap<VolumeId, VolumeInfo>,
    next_volume_id: VolumeId,
    live: HashMap<String, NodeLive>,
}

impl Topology {
    pub fn new(settings: TopologySettings) -> Self {
        Self {
            settings,
            data_centers: BTreeMap::new(),
            node_index: HashMap::new(),
            volumes: BTreeMap::new(),
            next_volume_id: 1,
            live: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &TopologySettings {
        &self.settings
    }

    pub fn next_volume_id(&self) -> VolumeId {
        self.next_volume_id
    }

    pub fn node(&self, address: &str) -> Option<&DataNode> {
        let (dc, rack) = self.node_index.get(address)?;
        self.data_centers.get(dc)?.racks.get(rack)?.nodes.get(address)
    }

    fn node_mut(&mut self, address: &str) -> Option<&mut DataNode> {
        let (dc, rack) = self.node_index.get(address)?;
        self.data_centers
            .get_mut(dc)?
            .racks
            .get_mut(rack)?
            .nodes
            .get_mut(address)
    }

    /// `(data_center, rack)` of a registered node
    pub fn location(&self, address: &str) -> Option<(&str, &str)> {
        self.node_index
            .get(address)
            .map(|(dc, rack)| (dc.as_str(), rack.as_str()))
    }

    pub fn volume(&self, vid: VolumeId) -> Option<&VolumeInfo> {
        self.volumes.get(&vid)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &VolumeInfo> {
        self.volumes.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &str, &DataNode)> {
        self.data_centers.iter().flat_map(|(dc, d)| {
            d.racks.iter().flat_map(move |(rack, r)| {
                r.nodes
                    .values()
                    .map(move |node| (dc.as_str(), rack.as_str(), node))
            })
        })
    }

    fn registration(&self, address: &str) -> Option<NodeRegistration> {
        let (dc, rack) = self.location(address)?;
        let node = self.node(address)?;
        Some(NodeRegistration {
            address: node.address.clone(),
            public_url: node.public_url.clone(),
            data_center: dc.to_string(),
            rack: rack.to_string(),
            max_volumes: node.max_volumes,
        })
    }

    // === Ledger ===

    /// Apply a committed command. Must be deterministic: it only looks at
    /// ledger state, never at the capacity cache or the clock.
    pub fn apply(&mut self, cmd: &Command) -> CommandOutcome {
        match cmd {
            Command::RegisterNode(reg) => {
                self.register_node(reg);
                CommandOutcome::Applied
            }
            Command::RemoveNode { address } => {
                if self.remove_node(address) {
                    CommandOutcome::Applied
                } else {
                    CommandOutcome::Rejected(format!("unknown node {}", address))
                }
            }
            Command::AllocateVolumeIds { count } => {
                let start = self.next_volume_id;
                self.next_volume_id = start.saturating_add(*count);
                CommandOutcome::VolumeIds {
                    start,
                    count: *count,
                }
            }
            Command::RecordVolumesCreated { volumes } => match self.validate_new_volumes(volumes) {
                Ok(()) => {
                    for vol in volumes {
                        self.insert_volume(vol);
                    }
                    CommandOutcome::Applied
                }
                Err(reason) => CommandOutcome::Rejected(reason),
            },
            Command::AdoptReplica {
                vid,
                node,
                replica_placement,
                size_limit,
            } => {
                if self.node(node).is_none() {
                    return CommandOutcome::Rejected(format!("unknown node {}", node));
                }
                let info = self.volumes.entry(*vid).or_insert_with(|| VolumeInfo {
                    id: *vid,
                    replica_placement: *replica_placement,
                    size_limit: *size_limit,
                    replicas: Vec::new(),
                    created_at: 0,
                });
                if !info.replicas.contains(node) {
                    info.replicas.push(node.clone());
                }
                if let Some(dn) = self.node_mut(node) {
                    dn.volumes.insert(*vid);
                }
                self.next_volume_id = self.next_volume_id.max(vid.saturating_add(1));
                CommandOutcome::Applied
            }
        }
    }

    fn register_node(&mut self, reg: &NodeRegistration) {
        let dc = normalize_data_center(&reg.data_center);
        let rack = normalize_rack(&reg.rack);

        let current = self.node_index.get(&reg.address).cloned();
        let volumes = match current {
            Some((old_dc, old_rack)) if old_dc == dc && old_rack == rack => {
                if let Some(node) = self.node_mut(&reg.address) {
                    node.public_url = reg.public_url.clone();
                    node.max_volumes = reg.max_volumes;
                }
                return;
            }
            Some(_) => self
                .detach_node(&reg.address)
                .map(|node| node.volumes)
                .unwrap_or_default(),
            None => BTreeSet::new(),
        };

        self.data_centers
            .entry(dc.clone())
            .or_default()
            .racks
            .entry(rack.clone())
            .or_default()
            .nodes
            .insert(
                reg.address.clone(),
                DataNode {
                    address: reg.address.clone(),
                    public_url: reg.public_url.clone(),
                    max_volumes: reg.max_volumes,
                    volumes,
                },
            );
        self.node_index.insert(reg.address.clone(), (dc, rack));
    }

    /// Take a node out of its rack, pruning empty racks and data centers
    fn detach_node(&mut self, address: &str) -> Option<DataNode> {
        let (dc, rack) = self.node_index.remove(address)?;
        let data_center = self.data_centers.get_mut(&dc)?;
        let r = data_center.racks.get_mut(&rack)?;
        let node = r.nodes.remove(address);
        if r.nodes.is_empty() {
            data_center.racks.remove(&rack);
        }
        if data_center.racks.is_empty() {
            self.data_centers.remove(&dc);
        }
        node
    }

    fn remove_node(&mut self, address: &str) -> bool {
        let Some(node) = self.detach_node(address) else {
            return false;
        };
        for vid in &node.volumes {
            if let Some(info) = self.volumes.get_mut(vid) {
                info.replicas.retain(|r| r != address);
            }
        }
        self.live.remove(address);
        true
    }

    fn validate_new_volumes(&self, volumes: &[NewVolume]) -> std::result::Result<(), String> {
        let mut claimed: HashMap<&str, u32> = HashMap::new();
        let mut seen = BTreeSet::new();

        for vol in volumes {
            if vol.vid == 0 || vol.vid >= self.next_volume_id {
                return Err(format!("volume id {} was never allocated", vol.vid));
            }
            if self.volumes.contains_key(&vol.vid) || !seen.insert(vol.vid) {
                return Err(format!("volume id {} already recorded", vol.vid));
            }

            let mut locations = Vec::with_capacity(vol.nodes.len());
            for address in &vol.nodes {
                let (Some(node), Some(location)) = (self.node(address), self.location(address))
                else {
                    return Err(format!("node {} is not registered", address));
                };
                let used = claimed.entry(address.as_str()).or_insert(0);
                *used += 1;
                if node.volumes.len() as u32 + *used > node.max_volumes {
                    return Err(format!(
                        "node {} has no free slot ({} of {} used)",
                        address,
                        node.volumes.len(),
                        node.max_volumes
                    ));
                }
                locations.push(location);
            }

            let distinct: BTreeSet<&String> = vol.nodes.iter().collect();
            if distinct.len() != vol.nodes.len() {
                return Err(format!("volume {} lists a node twice", vol.vid));
            }
            if !satisfies_spread(&vol.replica_placement, &locations) {
                return Err(format!(
                    "volume {} nodes do not satisfy placement {}",
                    vol.vid, vol.replica_placement
                ));
            }
        }
        Ok(())
    }

    fn insert_volume(&mut self, vol: &NewVolume) {
        for address in &vol.nodes {
            if let Some(node) = self.node_mut(address) {
                node.volumes.insert(vol.vid);
            }
        }
        self.volumes.insert(
            vol.vid,
            VolumeInfo {
                id: vol.vid,
                replica_placement: vol.replica_placement,
                size_limit: vol.size_limit,
                replicas: vol.nodes.clone(),
                created_at: vol.created_at,
            },
        );
    }

    // === Capacity cache ===

    /// Fold a heartbeat into the capacity cache and work out which facts
    /// need committing. Applying the same report twice only moves
    /// `last_seen`.
    pub fn apply_heartbeat(&mut self, hb: &Heartbeat, now: Instant) -> HeartbeatOutcome {
        let mut outcome = HeartbeatOutcome::default();

        if hb.departing {
            self.live.remove(&hb.address);
            if self.node_index.contains_key(&hb.address) {
                outcome.proposals.push(Command::RemoveNode {
                    address: hb.address.clone(),
                });
            }
            return outcome;
        }

        let registration = NodeRegistration {
            address: hb.address.clone(),
            public_url: hb.public_url.clone(),
            data_center: normalize_data_center(&hb.data_center),
            rack: normalize_rack(&hb.rack),
            max_volumes: hb.max_volume_counts.iter().sum(),
        };
        match self.registration(&hb.address) {
            Some(existing) if existing == registration => {}
            Some(_) => {
                tracing::info!("Node {} changed its registration", hb.address);
                outcome
                    .proposals
                    .push(Command::RegisterNode(registration.clone()));
            }
            None => {
                tracing::info!(
                    "Node {} joined {}/{} with {} slots",
                    hb.address,
                    registration.data_center,
                    registration.rack,
                    registration.max_volumes
                );
                outcome
                    .proposals
                    .push(Command::RegisterNode(registration.clone()));
            }
        }

        if !hb.failed_volumes.is_empty() {
            tracing::warn!(
                "Capacity mismatch on {}: failed to provision volumes {:?}",
                hb.address,
                hb.failed_volumes
            );
        }

        let hosted: BTreeMap<VolumeId, VolumeStat> = hb
            .volumes
            .iter()
            .map(|v| {
                (
                    v.id,
                    VolumeStat {
                        size: v.size,
                        garbage_bytes: v.garbage_bytes,
                    },
                )
            })
            .collect();
        let failed: BTreeSet<VolumeId> = hb.failed_volumes.iter().copied().collect();

        if let Some(prev) = self.live.get(&hb.address) {
            if prev.state == NodeState::Suspect {
                tracing::info!("Node {} is alive again", hb.address);
            }
        }

        for v in &hb.volumes {
            let known = self
                .volumes
                .get(&v.id)
                .is_some_and(|info| info.replicas.contains(&hb.address));
            if !known {
                outcome.proposals.push(Command::AdoptReplica {
                    vid: v.id,
                    node: hb.address.clone(),
                    replica_placement: v.replica_placement,
                    size_limit: self.settings.volume_size_limit,
                });
            }
        }

        if let Some(node) = self.node(&hb.address) {
            outcome.create = node
                .volumes
                .iter()
                .filter(|vid| !hosted.contains_key(vid) && !failed.contains(vid))
                .filter_map(|vid| self.volumes.get(vid))
                .map(|info| CreateVolume {
                    vid: info.id,
                    size_limit: info.size_limit,
                    replica_placement: info.replica_placement,
                })
                .collect();
        }

        self.live.insert(
            hb.address.clone(),
            NodeLive {
                last_seen: now,
                state: NodeState::Alive,
                max_volumes: registration.max_volumes,
                hosted,
                failed,
            },
        );

        outcome
    }

    /// Free slots of a node as the leader sees it: the smaller of the
    /// registered and reported maxima, minus hosted and assigned volumes.
    /// Zero for suspect nodes, nodes without a heartbeat, and nodes that
    /// reported a provisioning failure.
    pub fn free_slots(&self, address: &str) -> u32 {
        let (Some(node), Some(live)) = (self.node(address), self.live.get(address)) else {
            return 0;
        };
        if !live.state.can_write() || !live.failed.is_empty() {
            return 0;
        }
        let used: BTreeSet<&VolumeId> = live.hosted.keys().chain(node.volumes.iter()).collect();
        node.max_volumes
            .min(live.max_volumes)
            .saturating_sub(used.len() as u32)
    }

    /// Registered, alive nodes with at least one free slot
    pub fn list_data_nodes_with_free_slots(&self) -> Vec<Candidate> {
        self.nodes()
            .filter_map(|(dc, rack, node)| {
                let free_slots = self.free_slots(&node.address);
                (free_slots > 0).then(|| Candidate {
                    id: node.address.clone(),
                    data_center: dc.to_string(),
                    rack: rack.to_string(),
                    free_slots,
                })
            })
            .collect()
    }

    pub fn mark_node_suspect(&mut self, address: &str) -> bool {
        match self.live.get_mut(address) {
            Some(live) if live.state == NodeState::Alive => {
                live.state = NodeState::Suspect;
                true
            }
            _ => false,
        }
    }

    /// Mark nodes silent for longer than `stale_after` as suspect
    pub fn sweep_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .live
            .iter()
            .filter(|(_, live)| {
                live.state == NodeState::Alive
                    && now.saturating_duration_since(live.last_seen) > stale_after
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in &stale {
            self.mark_node_suspect(address);
        }
        stale
    }

    /// Forget heartbeat-derived state
    pub fn reset_capacity_cache(&mut self) {
        self.live.clear();
    }

    pub fn node_state(&self, address: &str) -> Option<NodeState> {
        self.live.get(address).map(|l| l.state)
    }

    // === Queries ===

    pub fn lookup(&self, vid: VolumeId) -> Option<Vec<NodeLocation>> {
        let info = self.volumes.get(&vid)?;
        Some(
            info.replicas
                .iter()
                .filter_map(|address| self.node(address))
                .map(|node| NodeLocation {
                    address: node.address.clone(),
                    public_url: node.public_url.clone(),
                })
                .collect(),
        )
    }

    /// Volumes whose replica set is smaller than their placement requires
    pub fn degraded_volumes(&self) -> Vec<DegradedVolume> {
        self.volumes
            .values()
            .filter(|info| info.replicas.len() < info.replica_placement.copy_count())
            .map(|info| DegradedVolume {
                vid: info.id,
                replica_placement: info.replica_placement,
                replicas: info.replicas.clone(),
                missing: info.replica_placement.copy_count() - info.replicas.len(),
            })
            .collect()
    }

    /// Reported replicas whose garbage ratio exceeds the threshold
    pub fn garbage_volumes(&self) -> Vec<GarbageVolume> {
        let mut out: Vec<GarbageVolume> = self
            .live
            .iter()
            .flat_map(|(address, live)| {
                live.hosted.iter().filter_map(move |(vid, stat)| {
                    let ratio = if stat.size == 0 {
                        0.0
                    } else {
                        stat.garbage_bytes as f64 / stat.size as f64
                    };
                    (ratio > self.settings.garbage_threshold).then(|| GarbageVolume {
                        vid: *vid,
                        node: address.clone(),
                        size: stat.size,
                        garbage_bytes: stat.garbage_bytes,
                        ratio,
                    })
                })
            })
            .collect();
        out.sort_by(|a, b| a.vid.cmp(&b.vid).then_with(|| a.node.cmp(&b.node)));
        out
    }

    pub fn status(&self, now: Instant) -> TopologyStatus {
        let mut status = TopologyStatus {
            max_volumes: 0,
            free_slots: 0,
            volume_count: self.volumes.len(),
            next_volume_id: self.next_volume_id,
            default_replica_placement: self.settings.default_replica_placement,
            volume_size_limit: self.settings.volume_size_limit,
            data_centers: Vec::new(),
        };

        for (dc_name, dc) in &self.data_centers {
            let mut dc_status = DataCenterStatus {
                name: dc_name.clone(),
                racks: Vec::new(),
            };
            for (rack_name, rack) in &dc.racks {
                let mut rack_status = RackStatus {
                    name: rack_name.clone(),
                    nodes: Vec::new(),
                };
                for node in rack.nodes.values() {
                    let live = self.live.get(&node.address);
                    let free = self.free_slots(&node.address);
                    status.max_volumes += u64::from(node.max_volumes);
                    status.free_slots += u64::from(free);
                    rack_status.nodes.push(DataNodeStatus {
                        address: node.address.clone(),
                        public_url: node.public_url.clone(),
                        state: live.map(|l| l.state),
                        max_volumes: node.max_volumes,
                        free_slots: free,
                        volumes: node.volumes.iter().copied().collect(),
                        last_seen_ms: live.map(|l| {
                            now.saturating_duration_since(l.last_seen).as_millis() as u64
                        }),
                    });
                }
                dc_status.racks.push(rack_status);
            }
            status.data_centers.push(dc_status);
        }

        status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedVolume {
    pub vid: VolumeId,
    pub replica_placement: ReplicaPlacement,
    pub replicas: Vec<String>,
    pub missing: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageVolume {
    pub vid: VolumeId,
    pub node: String,
    pub size: u64,
    pub garbage_bytes: u64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyStatus {
    pub max_volumes: u64,
    pub free_slots: u64,
    pub volume_count: usize,
    pub next_volume_id: VolumeId,
    pub default_replica_placement: ReplicaPlacement,
    pub volume_size_limit: u64,
    pub data_centers: Vec<DataCenterStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCenterStatus {
    pub name: String,
    pub racks: Vec<RackStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RackStatus {
    pub name: String,
    pub nodes: Vec<DataNodeStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeStatus {
    pub address: String,
    pub public_url: String,
    /// None when this master has not heard from the node
    pub state: Option<NodeState>,
    pub max_volumes: u32,
    pub free_slots: u32,
    pub volumes: Vec<VolumeId>,
    pub last_seen_ms: Option<u64>,
}

/// Shared handle on the topology
pub struct TopologyStore {
    inner: RwLock<Topology>,
}

impl TopologyStore {
    pub fn new(settings: TopologySettings) -> Self {
        Self {
            inner: RwLock::new(Topology::new(settings)),
        }
    }

    /// Consistent read snapshot; hold it briefly
    pub fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.inner.read()
    }

    pub fn apply_command(&self, cmd: &Command) -> CommandOutcome {
        self.inner.write().apply(cmd)
    }

    pub fn apply_heartbeat(&self, hb: &Heartbeat, now: Instant) -> HeartbeatOutcome {
        self.inner.write().apply_heartbeat(hb, now)
    }

    pub fn list_data_nodes_with_free_slots(&self) -> Vec<Candidate> {
        self.inner.read().list_data_nodes_with_free_slots()
    }

    pub fn mark_node_suspect(&self, address: &str) -> bool {
        let marked = self.inner.write().mark_node_suspect(address);
        if marked {
            tracing::warn!("Node {} marked suspect", address);
        }
        marked
    }

    pub fn sweep_stale(&self, now: Instant, stale_after: Duration) -> Vec<String> {
        let stale = self.inner.write().sweep_stale(now, stale_after);
        for address in &stale {
            tracing::warn!("Node {} missed heartbeats for {:?}, marked suspect", address, stale_after);
        }
        stale
    }

    pub fn reset_capacity_cache(&self) {
        self.inner.write().reset_capacity_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::heartbeat::VolumeSummary;

    fn settings() -> TopologySettings {
        TopologySettings {
            default_replica_placement: ReplicaPlacement::default(),
            volume_size_limit: 1024,
            garbage_threshold: 0.3,
        }
    }

    fn heartbeat(address: &str, dc: &str, rack: &str, max: u32) -> Heartbeat {
        Heartbeat {
            address: address.to_string(),
            public_url: address.to_string(),
            data_center: dc.to_string(),
            rack: rack.to_string(),
            max_volume_counts: vec![max],
            volumes: vec![],
            failed_volumes: vec![],
            departing: false,
        }
    }

    /// Heartbeat then commit whatever it proposes
    fn join(topo: &mut Topology, hb: &Heartbeat, now: Instant) -> HeartbeatOutcome {
        let outcome = topo.apply_heartbeat(hb, now);
        for cmd in &outcome.proposals {
            topo.apply(cmd);
        }
        outcome
    }

    fn allocate(topo: &mut Topology, count: u32) -> VolumeId {
        match topo.apply(&Command::AllocateVolumeIds { count }) {
            CommandOutcome::VolumeIds { start, .. } => start,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn record(topo: &mut Topology, vid: VolumeId, code: &str, nodes: &[&str]) -> CommandOutcome {
        topo.apply(&Command::RecordVolumesCreated {
            volumes: vec![NewVolume {
                vid,
                replica_placement: code.parse().unwrap(),
                size_limit: 1024,
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                created_at: 1,
            }],
        })
    }

    #[test]
    fn test_heartbeat_registers_node_in_default_location() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        let outcome = join(&mut topo, &heartbeat("n1:8080", "", "", 7), now);
        assert_eq!(outcome.proposals.len(), 1);

        assert_eq!(topo.location("n1:8080"), Some((DEFAULT_DATA_CENTER, DEFAULT_RACK)));
        assert_eq!(topo.free_slots("n1:8080"), 7);
        assert_eq!(topo.list_data_nodes_with_free_slots().len(), 1);
    }

    #[test]
    fn test_heartbeat_is_idempotent() {
        let mut topo = Topology::new(settings());
        let t0 = Instant::now();
        let mut hb = heartbeat("n1:8080", "dc1", "r1", 7);
        hb.volumes.push(VolumeSummary {
            id: 3,
            size: 10,
            garbage_bytes: 0,
            replica_placement: ReplicaPlacement::default(),
        });
        join(&mut topo, &hb, t0);

        let before = topo.status(t0);
        let again = topo.apply_heartbeat(&hb, t0 + Duration::from_secs(5));
        assert!(again.proposals.is_empty());
        let after = topo.status(t0);

        assert_eq!(
            serde_json::to_value(&before).unwrap(),
            serde_json::to_value(&after).unwrap()
        );
        assert_eq!(topo.free_slots("n1:8080"), 6);
    }

    #[test]
    fn test_unknown_volume_is_adopted_and_counter_advances() {
        let mut topo = Topology::new(settings());
        let mut hb = heartbeat("n1:8080", "dc1", "r1", 7);
        hb.volumes.push(VolumeSummary {
            id: 41,
            size: 0,
            garbage_bytes: 0,
            replica_placement: "000".parse().unwrap(),
        });
        join(&mut topo, &hb, Instant::now());

        assert_eq!(topo.volume(41).unwrap().replicas, vec!["n1:8080"]);
        assert_eq!(topo.next_volume_id(), 42);
        assert_eq!(allocate(&mut topo, 1), 42);
    }

    #[test]
    fn test_free_slots_never_negative() {
        let mut topo = Topology::new(settings());
        let mut hb = heartbeat("n1:8080", "dc1", "r1", 1);
        for id in 1..=3 {
            hb.volumes.push(VolumeSummary {
                id,
                size: 0,
                garbage_bytes: 0,
                replica_placement: ReplicaPlacement::default(),
            });
        }
        join(&mut topo, &hb, Instant::now());
        assert_eq!(topo.free_slots("n1:8080"), 0);
        assert!(topo.list_data_nodes_with_free_slots().is_empty());
    }

    #[test]
    fn test_record_volume_validates_against_ledger() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        join(&mut topo, &heartbeat("a:1", "dc1", "r1", 1), now);
        join(&mut topo, &heartbeat("b:1", "dc2", "r1", 1), now);

        let vid = allocate(&mut topo, 2);
        assert_eq!(record(&mut topo, vid, "100", &["a:1", "b:1"]), CommandOutcome::Applied);
        assert_eq!(topo.free_slots("a:1"), 0);

        // No slot left on either node
        let outcome = record(&mut topo, vid + 1, "100", &["a:1", "b:1"]);
        assert!(matches!(outcome, CommandOutcome::Rejected(_)));
        // Same id twice
        assert!(matches!(
            record(&mut topo, vid, "000", &["a:1"]),
            CommandOutcome::Rejected(_)
        ));
        // Never allocated
        assert!(matches!(
            record(&mut topo, 99, "000", &["a:1"]),
            CommandOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_record_volume_rejects_wrong_spread() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        join(&mut topo, &heartbeat("a:1", "dc1", "r1", 5), now);
        join(&mut topo, &heartbeat("b:1", "dc1", "r1", 5), now);
        let vid = allocate(&mut topo, 1);
        assert!(matches!(
            record(&mut topo, vid, "010", &["a:1", "b:1"]),
            CommandOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_create_instructions_for_assigned_volumes() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        let hb = heartbeat("a:1", "dc1", "r1", 3);
        join(&mut topo, &hb, now);
        let vid = allocate(&mut topo, 1);
        record(&mut topo, vid, "000", &["a:1"]);

        let outcome = topo.apply_heartbeat(&hb, now);
        assert_eq!(outcome.create.len(), 1);
        assert_eq!(outcome.create[0].vid, vid);
        // Assigned but unreported still occupies a slot
        assert_eq!(topo.free_slots("a:1"), 2);
    }

    #[test]
    fn test_failed_provisioning_zeroes_capacity_until_clean() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        let mut hb = heartbeat("a:1", "dc1", "r1", 3);
        join(&mut topo, &hb, now);
        let vid = allocate(&mut topo, 1);
        record(&mut topo, vid, "000", &["a:1"]);

        hb.failed_volumes = vec![vid];
        let outcome = topo.apply_heartbeat(&hb, now);
        assert!(outcome.create.is_empty());
        assert_eq!(topo.free_slots("a:1"), 0);

        hb.failed_volumes.clear();
        topo.apply_heartbeat(&hb, now);
        assert_eq!(topo.free_slots("a:1"), 2);
    }

    #[test]
    fn test_stale_node_becomes_suspect_not_deleted() {
        let mut topo = Topology::new(settings());
        let t0 = Instant::now();
        join(&mut topo, &heartbeat("a:1", "dc1", "r1", 3), t0);

        assert!(topo.sweep_stale(t0 + Duration::from_secs(10), Duration::from_secs(15)).is_empty());
        let stale = topo.sweep_stale(t0 + Duration::from_secs(16), Duration::from_secs(15));
        assert_eq!(stale, vec!["a:1"]);
        assert_eq!(topo.node_state("a:1"), Some(NodeState::Suspect));
        assert!(topo.node("a:1").is_some());
        assert!(topo.list_data_nodes_with_free_slots().is_empty());

        join(&mut topo, &heartbeat("a:1", "dc1", "r1", 3), t0 + Duration::from_secs(17));
        assert_eq!(topo.node_state("a:1"), Some(NodeState::Alive));
    }

    #[test]
    fn test_departure_removes_node_and_degrades_volumes() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        join(&mut topo, &heartbeat("a:1", "dc1", "r1", 3), now);
        join(&mut topo, &heartbeat("b:1", "dc1", "r2", 3), now);
        let vid = allocate(&mut topo, 1);
        record(&mut topo, vid, "010", &["a:1", "b:1"]);

        let mut bye = heartbeat("b:1", "dc1", "r2", 3);
        bye.departing = true;
        join(&mut topo, &bye, now);

        assert!(topo.node("b:1").is_none());
        assert_eq!(topo.lookup(vid).unwrap().len(), 1);
        let degraded = topo.degraded_volumes();
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].missing, 1);

        // Coming back is a rejoin
        let outcome = topo.apply_heartbeat(&heartbeat("b:1", "dc1", "r2", 3), now);
        assert!(matches!(outcome.proposals[0], Command::RegisterNode(_)));
    }

    #[test]
    fn test_moving_rack_keeps_volumes() {
        let mut topo = Topology::new(settings());
        let now = Instant::now();
        join(&mut topo, &heartbeat("a:1", "dc1", "r1", 3), now);
        let vid = allocate(&mut topo, 1);
        record(&mut topo, vid, "000", &["a:1"]);

        join(&mut topo, &heartbeat("a:1", "dc1", "r9", 3), now);
        assert_eq!(topo.location("a:1"), Some(("dc1", "r9")));
        assert!(topo.node("a:1").unwrap().volumes.contains(&vid));
        assert_eq!(topo.status(now).data_centers[0].racks.len(), 1);
    }

    #[test]
    fn test_garbage_report() {
        let mut topo = Topology::new(settings());
        let mut hb = heartbeat("a:1", "dc1", "r1", 3);
        hb.volumes = vec![
            VolumeSummary {
                id: 1,
                size: 100,
                garbage_bytes: 50,
                replica_placement: ReplicaPlacement::default(),
            },
            VolumeSummary {
                id: 2,
                size: 100,
                garbage_bytes: 10,
                replica_placement: ReplicaPlacement::default(),
            },
        ];
        join(&mut topo, &hb, Instant::now());
        let garbage = topo.garbage_volumes();
        assert_eq!(garbage.len(), 1);
        assert_eq!(garbage[0].vid, 1);
    }
}
