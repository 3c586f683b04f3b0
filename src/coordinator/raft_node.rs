//! Raft consensus node
//!
//! Leader election and log replication among the configured master peers.
//! Topology mutations are proposed as opaque commands; they reach the
//! [`StateMachine`] only once a majority stored them.
//!
//! - Election timeout is randomized in `[t, 2t)`; elections only start once
//!   the node is marked ready (peer set attached, endpoint serving).
//! - A leader appends a no-op on election so entries from earlier terms
//!   commit, and only counts replicas for entries of its own term.
//! - A leader that has not heard from a majority within one election
//!   timeout steps down; waiting proposals fail with `LeadershipLost`.

use crate::common::metrics::METRICS;
use crate::common::{Error, RaftConfig, Result};
use crate::coordinator::raft_log::{HardState, LogEntry, LogStore};
use crate::coordinator::raft_rpc_client::RaftTransport;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Upper bound on entries per AppendEntries request
const MAX_APPEND_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot of a node's consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: String,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub last_log_index: u64,
    /// Full peer set, this node included
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On failure, the index the leader should retry from
    pub conflict_index: u64,
}

/// Receives committed commands, in log order, exactly once per process
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, data: &[u8]) -> Vec<u8>;
}

type Waiter = oneshot::Sender<Result<Vec<u8>>>;

struct RaftState {
    role: RaftRole,
    term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    ready: bool,
    election_deadline: Instant,

    // Leader only
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    last_ack: HashMap<String, Instant>,
    in_flight: HashSet<String>,
    leader_since: Instant,
    next_heartbeat: Instant,
    pending: HashMap<u64, (u64, Waiter)>,
}

impl RaftState {
    fn last_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.log.get(index as usize - 1).map_or(0, |e| e.term)
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
        }
    }
}

pub struct RaftNode {
    id: String,
    peers: Vec<String>,
    config: RaftConfig,
    state: Mutex<RaftState>,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn RaftTransport>,
    state_machine: Arc<dyn StateMachine>,
    apply_lock: Mutex<()>,
    status_tx: watch::Sender<RaftStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl RaftNode {
    /// Load persisted state and replay committed entries into the state
    /// machine. The node stays a follower until [`RaftNode::mark_ready`].
    pub fn new(
        id: String,
        peers: Vec<String>,
        config: RaftConfig,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn RaftTransport>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Result<Arc<Self>> {
        let hard_state = store.hard_state()?;
        let log = store.entries()?;
        if hard_state.commit_index > log.len() as u64 {
            return Err(Error::MetadataCorrupted(format!(
                "commit index {} beyond last log index {}",
                hard_state.commit_index,
                log.len()
            )));
        }

        let mut peers: Vec<String> = peers.into_iter().filter(|p| *p != id).collect();
        peers.sort();
        peers.dedup();

        let now = Instant::now();
        let state = RaftState {
            role: RaftRole::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            log,
            commit_index: hard_state.commit_index,
            last_applied: 0,
            ready: false,
            election_deadline: now,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            in_flight: HashSet::new(),
            leader_since: now,
            next_heartbeat: now,
            pending: HashMap::new(),
        };

        let mut all_peers = peers.clone();
        all_peers.push(id.clone());
        all_peers.sort();
        let (status_tx, _) = watch::channel(RaftStatus {
            id: id.clone(),
            role: RaftRole::Follower,
            term: state.term,
            leader: None,
            commit_index: state.commit_index,
            last_log_index: state.last_index(),
            peers: all_peers,
        });
        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new(Self {
            id,
            peers,
            config,
            state: Mutex::new(state),
            store,
            transport,
            state_machine,
            apply_lock: Mutex::new(()),
            status_tx,
            shutdown_tx,
        });

        node.apply_committed();
        let (term, entries, replayed) = {
            let st = node.state.lock();
            (st.term, st.last_index(), st.last_applied)
        };
        tracing::info!(
            "Raft node {} loaded: term {}, {} entries, {} replayed",
            node.id,
            term,
            entries,
            replayed
        );

        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full peer set, this node included
    pub fn peers(&self) -> Vec<String> {
        self.status_tx.borrow().peers.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn current_leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    pub fn status(&self) -> RaftStatus {
        self.status_tx.borrow().clone()
    }

    /// Follow role, term and leader changes
    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status_tx.subscribe()
    }

    /// `Ok` on the leader, otherwise the error a client should see
    pub fn ensure_leader(&self) -> Result<()> {
        let st = self.state.lock();
        if st.role == RaftRole::Leader {
            Ok(())
        } else {
            Err(self.leadership_error(&st))
        }
    }

    fn leadership_error(&self, st: &RaftState) -> Error {
        match &st.leader {
            Some(leader) if *leader != self.id => Error::NotLeader(Some(leader.clone())),
            _ => Error::NoLeaderElected,
        }
    }

    /// Spawn the timer loop driving elections and heartbeats
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    /// Allow this node to start elections
    pub fn mark_ready(&self) {
        let mut st = self.state.lock();
        if !st.ready {
            st.ready = true;
            st.election_deadline = Instant::now() + self.random_election_timeout();
            tracing::info!("Raft node {} ready, peers: {:?}", self.id, self.peers);
        }
    }

    /// Stop the timer loop; RPC handlers keep answering
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut st = self.state.lock();
        if st.role == RaftRole::Leader {
            let term = st.term;
            if let Err(e) = self.become_follower(&mut st, term, None) {
                tracing::error!("Raft node {} failed to persist state: {}", self.id, e);
            }
        }
        st.ready = false;
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn random_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(base..base * 2))
    }

    fn publish(&self, st: &RaftState) {
        let mut peers = self.peers.clone();
        peers.push(self.id.clone());
        peers.sort();
        self.status_tx.send_replace(RaftStatus {
            id: self.id.clone(),
            role: st.role,
            term: st.term,
            leader: st.leader.clone(),
            commit_index: st.commit_index,
            last_log_index: st.last_index(),
            peers,
        });
        METRICS.current_term.set(st.term);
        METRICS
            .is_leader
            .set(u64::from(st.role == RaftRole::Leader));
    }

    fn persist(&self, st: &RaftState) -> Result<()> {
        self.store.save_hard_state(&st.hard_state())
    }

    fn become_follower(&self, st: &mut RaftState, term: u64, leader: Option<String>) -> Result<()> {
        if term > st.term {
            st.term = term;
            st.voted_for = None;
            self.persist(st)?;
        }
        if st.role == RaftRole::Leader {
            tracing::warn!("Raft node {} stepping down in term {}", self.id, st.term);
            for (_, (_, waiter)) in st.pending.drain() {
                let _ = waiter.send(Err(Error::LeadershipLost));
            }
            st.in_flight.clear();
        }
        st.role = RaftRole::Follower;
        st.leader = leader;
        st.election_deadline = Instant::now() + self.random_election_timeout();
        self.publish(st);
        Ok(())
    }

    fn become_leader(&self, st: &mut RaftState) -> Result<()> {
        let now = Instant::now();
        st.role = RaftRole::Leader;
        st.leader = Some(self.id.clone());
        st.leader_since = now;
        st.next_heartbeat = now;
        let next = st.last_index() + 1;
        for peer in &self.peers {
            st.next_index.insert(peer.clone(), next);
            st.match_index.insert(peer.clone(), 0);
        }
        st.last_ack.clear();
        st.in_flight.clear();

        let noop = LogEntry {
            term: st.term,
            index: next,
            data: Vec::new(),
        };
        self.store.append(std::slice::from_ref(&noop))?;
        st.log.push(noop);

        METRICS.elections_won.inc();
        tracing::info!("Raft node {} became leader in term {}", self.id, st.term);
        self.publish(st);
        Ok(())
    }

    /// Whether a majority answered within the last election timeout
    fn has_quorum_contact(&self, st: &RaftState, now: Instant) -> bool {
        let window = self.config.election_timeout;
        if now.saturating_duration_since(st.leader_since) < window {
            return true;
        }
        let reachable = self
            .peers
            .iter()
            .filter(|p| {
                st.last_ack
                    .get(*p)
                    .is_some_and(|t| now.saturating_duration_since(*t) < window)
            })
            .count();
        reachable + 1 >= self.majority()
    }

    async fn run(self: Arc<Self>) {
        let tick = (self.config.heartbeat_interval / 2).max(Duration::from_millis(5));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick();
        }
        tracing::debug!("Raft node {} timer stopped", self.id);
    }

    fn tick(self: &Arc<Self>) {
        enum Action {
            Idle,
            Elect,
            Heartbeat,
        }

        let now = Instant::now();
        let action = {
            let mut st = self.state.lock();
            match st.role {
                RaftRole::Leader if !self.has_quorum_contact(&st, now) => {
                    tracing::warn!(
                        "Raft node {} lost contact with a majority, stepping down",
                        self.id
                    );
                    let term = st.term;
                    if let Err(e) = self.become_follower(&mut st, term, None) {
                        tracing::error!("Raft node {} failed to persist state: {}", self.id, e);
                    }
                    Action::Idle
                }
                RaftRole::Leader if now >= st.next_heartbeat => {
                    st.next_heartbeat = now + self.config.heartbeat_interval;
                    Action::Heartbeat
                }
                RaftRole::Leader => Action::Idle,
                _ if st.ready && now >= st.election_deadline => {
                    st.election_deadline = now + self.random_election_timeout();
                    Action::Elect
                }
                _ => Action::Idle,
            }
        };

        match action {
            Action::Elect => {
                let node = self.clone();
                tokio::spawn(async move { node.run_election().await });
            }
            Action::Heartbeat => self.broadcast_append(),
            Action::Idle => {}
        }
    }

    async fn run_election(self: Arc<Self>) {
        let (term, request) = {
            let mut st = self.state.lock();
            if st.role == RaftRole::Leader || !st.ready {
                return;
            }
            st.term += 1;
            st.role = RaftRole::Candidate;
            st.voted_for = Some(self.id.clone());
            st.leader = None;
            if let Err(e) = self.persist(&st) {
                tracing::error!("Raft node {} failed to persist vote: {}", self.id, e);
                st.role = RaftRole::Follower;
                return;
            }
            self.publish(&st);
            (
                st.term,
                VoteRequest {
                    term: st.term,
                    candidate_id: self.id.clone(),
                    last_log_index: st.last_index(),
                    last_log_term: st.last_term(),
                },
            )
        };

        METRICS.elections_started.inc();
        tracing::info!("Raft node {} starting election for term {}", self.id, term);

        let majority = self.majority();
        let mut votes = 1;
        if votes >= majority {
            self.try_become_leader(term);
            return;
        }

        let timeout = self.config.election_timeout;
        let mut requests: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| {
                let transport = self.transport.clone();
                let request = request.clone();
                let peer = peer.clone();
                async move {
                    let res =
                        tokio::time::timeout(timeout, transport.request_vote(&peer, request)).await;
                    (peer, res)
                }
            })
            .collect();

        while let Some((peer, res)) = requests.next().await {
            match res {
                Ok(Ok(resp)) if resp.term > term => {
                    let mut st = self.state.lock();
                    if resp.term > st.term {
                        if let Err(e) = self.become_follower(&mut st, resp.term, None) {
                            tracing::error!("Raft node {} failed to persist term: {}", self.id, e);
                        }
                    }
                    return;
                }
                Ok(Ok(resp)) => {
                    if resp.vote_granted {
                        votes += 1;
                        if votes >= majority {
                            self.try_become_leader(term);
                            return;
                        }
                    }
                }
                Ok(Err(e)) => tracing::debug!("Vote request to {} failed: {}", peer, e),
                Err(_) => tracing::debug!("Vote request to {} timed out", peer),
            }
        }
    }

    fn try_become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut st = self.state.lock();
            if st.role != RaftRole::Candidate || st.term != term {
                return;
            }
            if let Err(e) = self.become_leader(&mut st) {
                tracing::error!("Raft node {} failed to append no-op: {}", self.id, e);
                let _ = self.become_follower(&mut st, term, None);
                return;
            }
        }
        self.broadcast_append();
    }

    /// Send AppendEntries to every peer that has no request outstanding
    fn broadcast_append(self: &Arc<Self>) {
        if self.peers.is_empty() {
            self.advance_commit();
            return;
        }
        for peer in &self.peers {
            self.replicate_to(peer.clone());
        }
    }

    fn replicate_to(self: &Arc<Self>, peer: String) {
        let request = {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader || !st.in_flight.insert(peer.clone()) {
                return;
            }
            let last = st.last_index();
            let next = st
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(last + 1)
                .clamp(1, last + 1);
            let prev = next - 1;
            AppendRequest {
                term: st.term,
                leader_id: self.id.clone(),
                prev_log_index: prev,
                prev_log_term: st.term_at(prev),
                entries: st.log[prev as usize..]
                    .iter()
                    .take(MAX_APPEND_BATCH)
                    .cloned()
                    .collect(),
                leader_commit: st.commit_index,
            }
        };

        let node = self.clone();
        tokio::spawn(async move {
            let sent_term = request.term;
            let prev = request.prev_log_index;
            let sent = request.entries.len() as u64;
            let res = tokio::time::timeout(
                node.config.election_timeout,
                node.transport.append_entries(&peer, request),
            )
            .await;

            let (again, advanced) = {
                let mut st = node.state.lock();
                st.in_flight.remove(&peer);
                match res {
                    Ok(Ok(resp)) if resp.term > st.term => {
                        if let Err(e) = node.become_follower(&mut st, resp.term, None) {
                            tracing::error!("Raft node {} failed to persist term: {}", node.id, e);
                        }
                        (false, false)
                    }
                    Ok(Ok(resp)) if st.role == RaftRole::Leader && st.term == sent_term => {
                        st.last_ack.insert(peer.clone(), Instant::now());
                        if resp.success {
                            let matched = prev + sent;
                            let current = st.match_index.get(&peer).copied().unwrap_or(0);
                            let advanced = matched > current;
                            if advanced {
                                st.match_index.insert(peer.clone(), matched);
                            }
                            let next = st.next_index.get(&peer).copied().unwrap_or(1);
                            st.next_index.insert(peer.clone(), next.max(matched + 1));
                            (matched < st.last_index(), advanced)
                        } else {
                            let retry_from = resp.conflict_index.clamp(1, prev.max(1));
                            st.next_index.insert(peer.clone(), retry_from);
                            (true, false)
                        }
                    }
                    Ok(Ok(_)) => (false, false),
                    Ok(Err(e)) => {
                        tracing::trace!("AppendEntries to {} failed: {}", peer, e);
                        (false, false)
                    }
                    Err(_) => {
                        tracing::trace!("AppendEntries to {} timed out", peer);
                        (false, false)
                    }
                }
            };

            if advanced {
                node.advance_commit();
            }
            if again {
                node.replicate_to(peer);
            }
        });
    }

    /// Move the commit index to the highest current-term entry stored on a
    /// majority, then apply
    fn advance_commit(&self) {
        {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader {
                return;
            }
            let majority = self.majority();
            let mut new_commit = st.commit_index;
            for n in (st.commit_index + 1..=st.last_index()).rev() {
                if st.term_at(n) != st.term {
                    break;
                }
                let replicas = 1 + self
                    .peers
                    .iter()
                    .filter(|p| st.match_index.get(*p).copied().unwrap_or(0) >= n)
                    .count();
                if replicas >= majority {
                    new_commit = n;
                    break;
                }
            }
            if new_commit > st.commit_index {
                st.commit_index = new_commit;
                if let Err(e) = self.persist(&st) {
                    tracing::error!("Raft node {} failed to persist commit index: {}", self.id, e);
                }
                self.publish(&st);
            }
        }
        self.apply_committed();
    }

    /// Feed committed entries to the state machine and wake their proposers
    fn apply_committed(&self) {
        let _guard = self.apply_lock.lock();
        loop {
            let batch = {
                let mut st = self.state.lock();
                if st.last_applied >= st.commit_index {
                    break;
                }
                let from = st.last_applied as usize;
                let to = st.commit_index as usize;
                st.last_applied = st.commit_index;
                st.log[from..to].to_vec()
            };

            for entry in batch {
                let output = if entry.data.is_empty() {
                    Vec::new()
                } else {
                    self.state_machine.apply(entry.index, &entry.data)
                };
                let waiter = self.state.lock().pending.remove(&entry.index);
                if let Some((term, waiter)) = waiter {
                    let result = if term == entry.term {
                        Ok(output)
                    } else {
                        Err(Error::LeadershipLost)
                    };
                    let _ = waiter.send(result);
                }
            }
        }
    }

    /// Append a command on the leader and wait until it is committed and
    /// applied. Returns the state machine's output for it.
    pub async fn propose(self: &Arc<Self>, data: Vec<u8>) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(Error::Raft("empty command".into()));
        }

        let (index, rx) = {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader {
                return Err(self.leadership_error(&st));
            }
            let entry = LogEntry {
                term: st.term,
                index: st.last_index() + 1,
                data,
            };
            self.store.append(std::slice::from_ref(&entry))?;
            let index = entry.index;
            let term = entry.term;
            st.log.push(entry);
            let (tx, rx) = oneshot::channel();
            st.pending.insert(index, (term, tx));
            self.publish(&st);
            (index, rx)
        };

        self.broadcast_append();

        let result = match tokio::time::timeout(self.config.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::LeadershipLost),
            Err(_) => {
                self.state.lock().pending.remove(&index);
                Err(Error::ConsensusTimeout)
            }
        };
        match &result {
            Ok(_) => METRICS.proposals_committed.inc(),
            Err(e) => {
                METRICS.proposals_failed.inc();
                tracing::warn!("Proposal at index {} failed: {}", index, e);
            }
        }
        result
    }

    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.state.lock();
        if req.term > st.term {
            self.become_follower(&mut st, req.term, None)?;
        }

        let log_ok = (req.last_log_term, req.last_log_index) >= (st.last_term(), st.last_index());
        let free = st
            .voted_for
            .as_ref()
            .map_or(true, |v| *v == req.candidate_id);
        let granted = req.term == st.term && free && log_ok;

        if granted {
            st.voted_for = Some(req.candidate_id.clone());
            self.persist(&st)?;
            st.election_deadline = Instant::now() + self.random_election_timeout();
            tracing::debug!(
                "Raft node {} voted for {} in term {}",
                self.id,
                req.candidate_id,
                st.term
            );
        }

        Ok(VoteResponse {
            term: st.term,
            vote_granted: granted,
        })
    }

    pub fn handle_append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut st = self.state.lock();
        if req.term < st.term {
            return Ok(AppendResponse {
                term: st.term,
                success: false,
                conflict_index: 0,
            });
        }

        if req.term > st.term || st.role != RaftRole::Follower {
            self.become_follower(&mut st, req.term, Some(req.leader_id.clone()))?;
        } else if st.leader.as_deref() != Some(req.leader_id.as_str()) {
            st.leader = Some(req.leader_id.clone());
            self.publish(&st);
        }
        st.election_deadline = Instant::now() + self.random_election_timeout();

        let reject = |st: &RaftState, conflict_index: u64| AppendResponse {
            term: st.term,
            success: false,
            conflict_index,
        };

        if req.prev_log_index > st.last_index() {
            return Ok(reject(&st, st.last_index() + 1));
        }
        let local_term = st.term_at(req.prev_log_index);
        if local_term != req.prev_log_term {
            let mut first = req.prev_log_index;
            while first > 1 && st.term_at(first - 1) == local_term {
                first -= 1;
            }
            return Ok(reject(&st, first));
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut to_append: Vec<LogEntry> = Vec::new();
        for entry in req.entries {
            if to_append.is_empty() && entry.index <= st.last_index() {
                if st.term_at(entry.index) == entry.term {
                    continue;
                }
                if entry.index <= st.commit_index {
                    return Err(Error::Raft(format!(
                        "leader {} conflicts with committed entry {}",
                        req.leader_id, entry.index
                    )));
                }
                self.store.truncate_from(entry.index)?;
                st.log.truncate(entry.index as usize - 1);
            }
            to_append.push(entry);
        }
        if !to_append.is_empty() {
            self.store.append(&to_append)?;
            st.log.extend(to_append);
        }

        let new_commit = req.leader_commit.min(last_new);
        if new_commit > st.commit_index {
            st.commit_index = new_commit;
            self.persist(&st)?;
            self.publish(&st);
        }
        let term = st.term;
        drop(st);

        self.apply_committed();

        Ok(AppendResponse {
            term,
            success: true,
            conflict_index: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::raft_log::MemoryLogStore;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl RaftTransport for Unreachable {
        async fn request_vote(&self, peer: &str, _req: VoteRequest) -> Result<VoteResponse> {
            Err(Error::ConnectionFailed(peer.to_string()))
        }

        async fn append_entries(&self, peer: &str, _req: AppendRequest) -> Result<AppendResponse> {
            Err(Error::ConnectionFailed(peer.to_string()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl StateMachine for Recorder {
        fn apply(&self, index: u64, data: &[u8]) -> Vec<u8> {
            self.applied.lock().push((index, data.to_vec()));
            data.iter().rev().copied().collect()
        }
    }

    fn config() -> RaftConfig {
        RaftConfig {
            election_timeout: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(10),
            proposal_timeout: Duration::from_millis(300),
        }
    }

    fn node(
        id: &str,
        peers: &[&str],
        store: MemoryLogStore,
        sm: Arc<Recorder>,
    ) -> Arc<RaftNode> {
        RaftNode::new(
            id.to_string(),
            peers.iter().map(|p| p.to_string()).collect(),
            config(),
            Arc::new(store),
            Arc::new(Unreachable),
            sm,
        )
        .unwrap()
    }

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            data: vec![index as u8],
        }
    }

    async fn wait_for_leader(node: &Arc<RaftNode>) {
        let mut rx = node.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            while rx.borrow().role != RaftRole::Leader {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let sm = Arc::new(Recorder::default());
        let n = node("m1", &[], MemoryLogStore::new(), sm.clone());
        assert_eq!(n.ensure_leader().unwrap_err().to_string(), "No leader elected");

        n.start();
        n.mark_ready();
        wait_for_leader(&n).await;

        let out = n.propose(vec![1, 2, 3]).await.unwrap();
        assert_eq!(out, vec![3, 2, 1]);
        // Index 1 is the leader's no-op, which never reaches the state machine
        assert_eq!(*sm.applied.lock(), vec![(2, vec![1, 2, 3])]);
        n.shutdown();
    }

    #[tokio::test]
    async fn test_no_election_before_ready() {
        let n = node("m1", &[], MemoryLogStore::new(), Arc::new(Recorder::default()));
        n.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(n.role(), RaftRole::Follower);
        assert_eq!(n.term(), 0);
        n.shutdown();
    }

    #[tokio::test]
    async fn test_follower_rejects_proposal_with_hint() {
        let n = node("m1", &["m2", "m3"], MemoryLogStore::new(), Arc::new(Recorder::default()));
        n.handle_append_entries(AppendRequest {
            term: 1,
            leader_id: "m2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        })
        .unwrap();

        match n.propose(vec![1]).await {
            Err(Error::NotLeader(Some(leader))) => assert_eq!(leader, "m2"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vote_rules() {
        let store = MemoryLogStore::new();
        store.append(&[entry(1, 1), entry(2, 2)]).unwrap();
        let n = node("m1", &["m2", "m3"], store, Arc::new(Recorder::default()));

        // Stale log: last term 1 < 2
        let resp = n
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: "m2".into(),
                last_log_index: 5,
                last_log_term: 1,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 3);

        let resp = n
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: "m3".into(),
                last_log_index: 2,
                last_log_term: 2,
            })
            .unwrap();
        assert!(resp.vote_granted);

        // Already voted in term 3
        let resp = n
            .handle_request_vote(VoteRequest {
                term: 3,
                candidate_id: "m2".into(),
                last_log_index: 9,
                last_log_term: 3,
            })
            .unwrap();
        assert!(!resp.vote_granted);

        // Old term
        let resp = n
            .handle_request_vote(VoteRequest {
                term: 2,
                candidate_id: "m2".into(),
                last_log_index: 9,
                last_log_term: 3,
            })
            .unwrap();
        assert!(!resp.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_is_persisted() {
        let store = MemoryLogStore::new();
        let n = node("m1", &["m2", "m3"], store.clone(), Arc::new(Recorder::default()));
        assert!(
            n.handle_request_vote(VoteRequest {
                term: 4,
                candidate_id: "m2".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap()
            .vote_granted
        );
        drop(n);

        let restarted = node("m1", &["m2", "m3"], store, Arc::new(Recorder::default()));
        let resp = restarted
            .handle_request_vote(VoteRequest {
                term: 4,
                candidate_id: "m3".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!resp.vote_granted);
    }

    #[tokio::test]
    async fn test_append_truncates_conflicting_suffix() {
        let store = MemoryLogStore::new();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();
        let sm = Arc::new(Recorder::default());
        let n = node("m1", &["m2", "m3"], store.clone(), sm.clone());

        // Gap: leader's prev index is beyond our log
        let resp = n
            .handle_append_entries(AppendRequest {
                term: 2,
                leader_id: "m2".into(),
                prev_log_index: 7,
                prev_log_term: 2,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 4);

        // Term mismatch at prev index: hint points at the first index of that term
        let resp = n
            .handle_append_entries(AppendRequest {
                term: 2,
                leader_id: "m2".into(),
                prev_log_index: 3,
                prev_log_term: 2,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 1);

        let resp = n
            .handle_append_entries(AppendRequest {
                term: 2,
                leader_id: "m2".into(),
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 2)],
                leader_commit: 2,
            })
            .unwrap();
        assert!(resp.success);

        let log = store.entries().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
        assert_eq!(sm.applied.lock().len(), 2);
        assert_eq!(n.current_leader().as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_restart_replays_committed_entries() {
        let store = MemoryLogStore::new();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();
        store
            .save_hard_state(&HardState {
                term: 1,
                voted_for: None,
                commit_index: 2,
            })
            .unwrap();
        let sm = Arc::new(Recorder::default());
        let _n = node("m1", &["m2"], store, sm.clone());
        let applied: Vec<u64> = sm.applied.lock().iter().map(|(i, _)| *i).collect();
        assert_eq!(applied, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_isolated_leader_steps_down_and_fails_proposals() {
        let n = node("m1", &["m2", "m3"], MemoryLogStore::new(), Arc::new(Recorder::default()));
        {
            let mut st = n.state.lock();
            st.term = 1;
            st.role = RaftRole::Candidate;
        }
        n.try_become_leader(1);
        assert!(n.is_leader());
        n.start();

        let err = n.propose(vec![9]).await.unwrap_err();
        assert!(matches!(err, Error::LeadershipLost | Error::ConsensusTimeout));
        assert!(!n.is_leader());
        n.shutdown();
    }
}
