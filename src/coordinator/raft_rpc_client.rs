//! Raft peer transports
//!
//! `HttpTransport` talks to other masters over `/raft/*`. `LocalNetwork`
//! wires nodes of one process together and can drop, delay and partition
//! messages; cluster tests run on it.

use crate::common::{http_url, Error, ErrorBody, Result};
use crate::coordinator::raft_node::{
    AppendRequest, AppendResponse, RaftNode, VoteRequest, VoteResponse,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse>;
    async fn append_entries(&self, peer: &str, req: AppendRequest) -> Result<AppendResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(&self, peer: &str, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", http_url(peer), path);
        let resp = self.client.post(&url).json(body).send().await?;
        if !resp.status().is_success() {
            let body: ErrorBody = resp.json().await?;
            return Err(body.into());
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse> {
        self.post(peer, "/raft/vote", &req).await
    }

    async fn append_entries(&self, peer: &str, req: AppendRequest) -> Result<AppendResponse> {
        self.post(peer, "/raft/append", &req).await
    }
}

#[derive(Default)]
struct Faults {
    drop_rate: f64,
    max_delay: Duration,
    isolated: HashSet<String>,
}

/// In-process network between raft nodes
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, Weak<RaftNode>>>,
    faults: Mutex<Faults>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    /// Transport for messages sent by `from`
    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: from.to_string(),
            network: self.clone(),
        })
    }

    /// Probability that a request or its response is lost
    pub fn set_drop_rate(&self, rate: f64) {
        self.faults.lock().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Each message is delayed by a random duration up to `max`
    pub fn set_max_delay(&self, max: Duration) {
        self.faults.lock().max_delay = max;
    }

    /// Cut a node off from everyone
    pub fn isolate(&self, id: &str) {
        self.faults.lock().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.faults.lock().isolated.remove(id);
    }

    pub fn heal_all(&self) {
        let mut faults = self.faults.lock();
        faults.isolated.clear();
        faults.drop_rate = 0.0;
        faults.max_delay = Duration::ZERO;
    }

    /// Decide the fate of one message: `None` when it is lost
    fn route(&self, from: &str, to: &str) -> Option<Duration> {
        let faults = self.faults.lock();
        if faults.isolated.contains(from) || faults.isolated.contains(to) {
            return None;
        }
        let mut rng = rand::thread_rng();
        if faults.drop_rate > 0.0 && rng.gen_bool(faults.drop_rate) {
            return None;
        }
        let delay = if faults.max_delay.is_zero() {
            Duration::ZERO
        } else {
            let max = faults.max_delay.as_millis().max(1) as u64;
            Duration::from_millis(rng.gen_range(0..=max))
        };
        Some(delay)
    }

    async fn hop(&self, from: &str, to: &str) -> Result<()> {
        let delay = self
            .route(from, to)
            .ok_or_else(|| Error::ConnectionFailed(format!("{} -> {} lost", from, to)))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn node(&self, id: &str) -> Result<Arc<RaftNode>> {
        self.nodes
            .read()
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("{} is not reachable", id)))
    }
}

pub struct LocalTransport {
    from: String,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse> {
        self.network.hop(&self.from, peer).await?;
        let resp = self.network.node(peer)?.handle_request_vote(req)?;
        self.network.hop(peer, &self.from).await?;
        Ok(resp)
    }

    async fn append_entries(&self, peer: &str, req: AppendRequest) -> Result<AppendResponse> {
        self.network.hop(&self.from, peer).await?;
        let resp = self.network.node(peer)?.handle_append_entries(req)?;
        self.network.hop(peer, &self.from).await?;
        Ok(resp)
    }
}
