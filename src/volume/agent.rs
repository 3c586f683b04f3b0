//! Storage node agent
//!
//! Reports the node to the master leader every pulse and provisions the
//! volumes the leader asks for. Delivery rules:
//! - each attempt has a timeout shorter than the pulse
//! - the last-known leader gets `heartbeat_retries` attempts, then the agent
//!   walks the configured and learned master list, following redirects
//! - reads and writes keep working while no leader is reachable

use crate::bootstrap::{Bootstrap, StartupPhase};
use crate::common::metrics::METRICS;
use crate::common::{http_url, Error, ErrorBody, Result, VolumeConfig};
use crate::coordinator::heartbeat::{CreateVolume, Heartbeat, HeartbeatResponse};
use crate::coordinator::topology::VolumeId;
use crate::volume::store::Store;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct AgentState {
    leader: Option<String>,
    /// Masters learned from heartbeat responses
    peers: Vec<String>,
    failed: BTreeSet<VolumeId>,
    volume_size_limit: Option<u64>,
}

pub struct NodeAgent {
    config: Arc<VolumeConfig>,
    store: Arc<Store>,
    client: reqwest::Client,
    state: Mutex<AgentState>,
}

impl NodeAgent {
    pub fn new(config: Arc<VolumeConfig>, store: Arc<Store>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.heartbeat_timeout())
            .build()?;
        Ok(Self {
            config,
            store,
            client,
            state: Mutex::new(AgentState::default()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    pub fn current_free_slots(&self, folder: usize) -> u32 {
        self.store.current_free_slots(folder)
    }

    /// Provision a volume the leader assigned. Failures are remembered and
    /// reported in the next heartbeat.
    pub fn create_volume(&self, req: &CreateVolume) -> Result<bool> {
        match self
            .store
            .create_volume(req.vid, req.size_limit, req.replica_placement)
        {
            Ok(created) => {
                self.state.lock().failed.remove(&req.vid);
                METRICS.volumes_hosted.set(self.store.volume_count() as u64);
                Ok(created)
            }
            Err(e) => {
                tracing::error!("Failed to create volume {}: {}", req.vid, e);
                self.state.lock().failed.insert(req.vid);
                Err(e)
            }
        }
    }

    /// Current self-report
    pub fn heartbeat(&self, departing: bool) -> Heartbeat {
        Heartbeat {
            address: self.config.address.clone(),
            public_url: self.config.public_url(),
            data_center: self.config.data_center.clone(),
            rack: self.config.rack.clone(),
            max_volume_counts: self.store.max_volume_counts(),
            volumes: self.store.volume_summaries(),
            failed_volumes: self.state.lock().failed.iter().copied().collect(),
            departing,
        }
    }

    async fn send(&self, master: &str, hb: &Heartbeat) -> Result<HeartbeatResponse> {
        METRICS.heartbeats_sent.inc();
        let url = format!("{}/heartbeat", http_url(master));
        let result = async {
            let resp = self.client.post(&url).json(hb).send().await?;
            if !resp.status().is_success() {
                let body: ErrorBody = resp.json().await?;
                return Err(Error::from(body));
            }
            Ok(resp.json::<HeartbeatResponse>().await?)
        }
        .await;
        if result.is_err() {
            METRICS.heartbeat_failures.inc();
        }
        result
    }

    /// Send to `master`, following one redirect. `Ok(None)` when nobody
    /// along the way is leader.
    async fn deliver(&self, master: &str, hb: &Heartbeat) -> Result<Option<(String, HeartbeatResponse)>> {
        match self.send(master, hb).await? {
            resp @ HeartbeatResponse::Ack { .. } => Ok(Some((master.to_string(), resp))),
            HeartbeatResponse::Redirect { leader, peers } => {
                self.learn_peers(&peers);
                match leader {
                    Some(leader) if leader != master => match self.send(&leader, hb).await? {
                        resp @ HeartbeatResponse::Ack { .. } => Ok(Some((leader, resp))),
                        HeartbeatResponse::Redirect { peers, .. } => {
                            self.learn_peers(&peers);
                            Ok(None)
                        }
                    },
                    _ => Ok(None),
                }
            }
        }
    }

    fn learn_peers(&self, peers: &[String]) {
        let mut state = self.state.lock();
        for peer in peers {
            if !state.peers.contains(peer) && !self.config.masters.contains(peer) {
                state.peers.push(peer.clone());
            }
        }
    }

    fn masters(&self) -> Vec<String> {
        let state = self.state.lock();
        self.config
            .masters
            .iter()
            .chain(state.peers.iter())
            .cloned()
            .collect()
    }

    /// One heartbeat round
    pub async fn report_heartbeat(&self) -> Result<()> {
        let hb = self.heartbeat(false);

        if let Some(leader) = self.leader() {
            for attempt in 1..=self.config.heartbeat_retries.max(1) {
                match self.deliver(&leader, &hb).await {
                    Ok(Some((from, resp))) => return self.on_ack(from, resp, &hb),
                    Ok(None) => break,
                    Err(e) => tracing::debug!(
                        "Heartbeat to {} failed (attempt {}): {}",
                        leader,
                        attempt,
                        e
                    ),
                }
            }
            tracing::warn!("Lost leader {}, looking for a new one", leader);
            self.state.lock().leader = None;
        }

        for master in self.masters() {
            match self.deliver(&master, &hb).await {
                Ok(Some((from, resp))) => return self.on_ack(from, resp, &hb),
                Ok(None) => {}
                Err(e) => tracing::debug!("Heartbeat to {} failed: {}", master, e),
            }
        }
        Err(Error::NoLeaderElected)
    }

    fn on_ack(&self, from: String, resp: HeartbeatResponse, sent: &Heartbeat) -> Result<()> {
        let HeartbeatResponse::Ack {
            leader,
            peers,
            volume_size_limit,
            create,
        } = resp
        else {
            return Ok(());
        };
        self.learn_peers(&peers);
        {
            let mut state = self.state.lock();
            if state.leader.as_deref() != Some(leader.as_str()) {
                tracing::info!("Heartbeating to leader {} (via {})", leader, from);
            }
            state.leader = Some(leader);
            state.volume_size_limit = Some(volume_size_limit);
            // The leader has seen these failures
            for vid in &sent.failed_volumes {
                state.failed.remove(vid);
            }
        }

        for req in &create {
            // Errors are recorded for the next report
            let _ = self.create_volume(req);
        }
        METRICS.volumes_hosted.set(self.store.volume_count() as u64);
        Ok(())
    }

    /// Final heartbeat so the leader removes this node
    pub async fn depart(&self) {
        let hb = self.heartbeat(true);
        let targets: Vec<String> = self.leader().into_iter().chain(self.masters()).collect();
        for master in targets {
            if let Ok(Some(_)) = self.deliver(&master, &hb).await {
                tracing::info!("Departure acknowledged by {}", master);
                return;
            }
        }
        tracing::warn!("No master acknowledged the departure");
    }

    /// Heartbeat every pulse until shutdown, then depart
    pub async fn run(self: Arc<Self>, bootstrap: Bootstrap, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = bootstrap.wait_for(StartupPhase::NodeAgentAllowed) => {}
            _ = shutdown.changed() => return,
        }
        tracing::info!(
            "Node agent started: {} ({}/{}), masters {:?}",
            self.config.address,
            self.config.data_center,
            self.config.rack,
            self.config.masters
        );

        let mut interval = tokio::time::interval(self.config.pulse());
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.report_heartbeat().await {
                tracing::warn!("Heartbeat round failed: {}", e);
            }
        }

        self.depart().await;
    }
}
