//! Raft consensus for the master directory
//!
//! Leader election with randomized timeouts, log replication with a
//! conflict hint, commit on a majority of current-term entries and log
//! compaction through state-machine snapshots. A new leader appends an
//! empty entry so everything before it commits in its term.

use crate::common::raft::{
    AppendRequest, AppendResponse, LogEntry, SnapshotRequest, SnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::common::{Error, MasterConfig, PeerConfig, Result};
use crate::master::raft_log::{HardState, RaftLog, SnapshotFile};
use crate::master::raft_transport::RaftTransport;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Entries per AppendEntries message
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
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

/// The replicated state machine driven by committed entries.
///
/// `apply` is called once per committed index, in order, on every node.
/// Empty `data` is the leader's no-op.
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, term: u64, data: &[u8]) -> Result<Vec<u8>>;
    fn snapshot(&self) -> Result<Vec<u8>>;
    fn restore(&self, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: String,
    pub url: String,
    /// Other members of the group
    pub peers: Vec<PeerConfig>,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub propose_timeout: Duration,
    pub snapshot_threshold: u64,
}

impl RaftConfig {
    pub fn from_master(node_id: &str, config: &MasterConfig) -> Result<Self> {
        let url = config.advertise_url();
        let peers = config
            .parsed_peers()?
            .into_iter()
            .filter(|p| p.id != node_id && p.url != url)
            .collect();
        Ok(Self {
            id: node_id.to_string(),
            url,
            peers,
            election_timeout: Duration::from_millis(config.election_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.raft_heartbeat_ms),
            propose_timeout: Duration::from_millis(config.propose_timeout_ms),
            snapshot_threshold: config.snapshot_threshold,
        })
    }
}

/// Leadership as seen by this node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderInfo {
    pub term: u64,
    pub leader_id: Option<String>,
    pub leader_url: Option<String>,
    pub is_self: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub id: String,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<String>,
    pub leader_url: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
    pub snapshot_index: u64,
    pub peers: Vec<String>,
}

type Waiter = (u64, oneshot::Sender<Result<Vec<u8>>>);

struct State {
    role: RaftRole,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<String>,
    leader_url: Option<String>,
    /// First index of the current leadership; reads are safe once committed
    leader_ready_index: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes: HashSet<String>,
    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
    inflight: HashSet<String>,
    waiters: HashMap<u64, Waiter>,
}

impl State {
    fn term(&self) -> u64 {
        self.log.hard_state.term
    }

    fn last_index(&self) -> u64 {
        self.log
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.log.snapshot.last_index)
    }

    fn last_term(&self) -> u64 {
        self.log
            .entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.log.snapshot.last_term)
    }

    fn snapshot_index(&self) -> u64 {
        self.log.snapshot.last_index
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        let base = self.snapshot_index();
        if index <= base {
            return None;
        }
        self.log.entries.get((index - base - 1) as usize)
    }

    /// Term of `index`, `None` when compacted away or beyond the log.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index() {
            return Some(self.log.snapshot.last_term);
        }
        self.entry(index).map(|e| e.term)
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let base = self.snapshot_index();
        let start = index.saturating_sub(base + 1) as usize;
        let end = (start + MAX_BATCH).min(self.log.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.log.entries[start..end].to_vec()
    }

    fn not_leader(&self, own_url: &str) -> Error {
        match &self.leader_url {
            Some(url) if url != own_url => Error::NotLeader(url.clone()),
            _ => Error::LeaderUnavailable,
        }
    }
}

pub struct RaftNode {
    config: RaftConfig,
    state: Mutex<State>,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    notify: Notify,
    stopped: AtomicBool,
    leader_tx: watch::Sender<LeaderInfo>,
}

impl RaftNode {
    /// Create a node, restoring persisted state from `dir` when given.
    pub fn new(
        config: RaftConfig,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        dir: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let log = match dir {
            Some(dir) => RaftLog::open(dir)?,
            None => RaftLog::in_memory(),
        };
        if !log.snapshot.data.is_empty() {
            state_machine.restore(&log.snapshot.data)?;
        }
        let applied = log.snapshot.last_index;
        let term = log.hard_state.term;
        let deadline = Instant::now() + random_timeout(config.election_timeout);

        let state = State {
            role: RaftRole::Follower,
            log,
            commit_index: applied,
            last_applied: applied,
            leader_id: None,
            leader_url: None,
            leader_ready_index: u64::MAX,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            election_deadline: deadline,
            last_leader_contact: None,
            inflight: HashSet::new(),
            waiters: HashMap::new(),
        };
        let (leader_tx, _) = watch::channel(LeaderInfo {
            term,
            ..LeaderInfo::default()
        });

        tracing::info!(
            "Raft node {} starting at term {} with {} peers",
            config.id,
            term,
            config.peers.len()
        );
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(state),
            state_machine,
            transport,
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            leader_tx,
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    /// Leader whose no-op of the current term has been applied.
    pub fn is_ready_leader(&self) -> bool {
        let st = self.state.lock();
        st.role == RaftRole::Leader && st.last_applied >= st.leader_ready_index
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term()
    }

    pub fn leader_url(&self) -> Option<String> {
        self.state.lock().leader_url.clone()
    }

    /// Error to return to a caller that reached a non-leader.
    pub fn not_leader_error(&self) -> Error {
        self.state.lock().not_leader(&self.config.url)
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderInfo> {
        self.leader_tx.subscribe()
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.state.lock();
        RaftStatus {
            id: self.config.id.clone(),
            role: st.role,
            term: st.term(),
            leader_id: st.leader_id.clone(),
            leader_url: st.leader_url.clone(),
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            last_index: st.last_index(),
            snapshot_index: st.snapshot_index(),
            peers: self.config.peers.iter().map(|p| p.id.clone()).collect(),
        }
    }

    fn quorum(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    /// Stop ticking and refuse further RPCs.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut st = self.state.lock();
        st.role = RaftRole::Follower;
        Self::fail_waiters(&mut st, Error::Cancelled("raft node stopped".into()));
        self.notify.notify_one();
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed(format!("{} is stopped", self.config.id)));
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                tracing::info!("Raft node {} stopped", self.config.id);
                return;
            }
            if let Err(e) = self.tick() {
                tracing::error!("Raft tick failed on {}: {}", self.config.id, e);
            }
        }
    }

    fn tick(self: &Arc<Self>) -> Result<()> {
        let (role, deadline) = {
            let st = self.state.lock();
            (st.role, st.election_deadline)
        };
        match role {
            RaftRole::Leader => {
                self.broadcast();
                Ok(())
            }
            _ if Instant::now() >= deadline => self.start_election(),
            _ => Ok(()),
        }
    }

    fn reset_deadline(&self, st: &mut State) {
        st.election_deadline = Instant::now() + random_timeout(self.config.election_timeout);
    }

    fn publish_leader(&self, st: &State) {
        let info = LeaderInfo {
            term: st.term(),
            leader_id: st.leader_id.clone(),
            leader_url: st.leader_url.clone(),
            is_self: st.role == RaftRole::Leader,
        };
        self.leader_tx.send_if_modified(|current| {
            if *current != info {
                *current = info;
                true
            } else {
                false
            }
        });
    }

    fn fail_waiters(st: &mut State, err: Error) {
        for (_, (_, tx)) in st.waiters.drain() {
            let _ = tx.send(Err(clone_error(&err)));
        }
    }

    /// Move to `term` as a follower of `leader`, failing pending proposals.
    fn step_down(
        &self,
        st: &mut State,
        term: u64,
        leader: Option<(String, String)>,
    ) -> Result<()> {
        if term > st.term() {
            st.log.save_hard_state(HardState {
                term,
                voted_for: None,
            })?;
        }
        if st.role == RaftRole::Leader {
            tracing::info!("Raft node {} stepping down at term {}", self.config.id, term);
        }
        st.role = RaftRole::Follower;
        st.votes.clear();
        st.leader_ready_index = u64::MAX;
        match leader {
            Some((id, url)) => {
                st.leader_id = Some(id);
                st.leader_url = Some(url);
            }
            None => {
                st.leader_id = None;
                st.leader_url = None;
            }
        }
        let err = st.not_leader(&self.config.url);
        Self::fail_waiters(st, err);
        self.publish_leader(st);
        Ok(())
    }

    fn start_election(self: &Arc<Self>) -> Result<()> {
        let req = {
            let mut st = self.state.lock();
            let term = st.term() + 1;
            st.log.save_hard_state(HardState {
                term,
                voted_for: Some(self.config.id.clone()),
            })?;
            st.role = RaftRole::Candidate;
            st.leader_id = None;
            st.leader_url = None;
            st.votes.clear();
            st.votes.insert(self.config.id.clone());
            self.reset_deadline(&mut st);
            tracing::debug!("Raft node {} starting election for term {}", self.config.id, term);

            if st.votes.len() >= self.quorum() {
                self.become_leader(&mut st)?;
                return Ok(());
            }
            self.publish_leader(&st);
            VoteRequest {
                term,
                candidate_id: self.config.id.clone(),
                last_log_index: st.last_index(),
                last_log_term: st.last_term(),
            }
        };

        for peer in self.config.peers.clone() {
            let node = self.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let term = req.term;
                match node.transport.request_vote(&peer, req).await {
                    Ok(resp) => {
                        if let Err(e) = node.on_vote_response(&peer, term, resp) {
                            tracing::warn!("Vote handling failed: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!("Vote request to {} failed: {}", peer.id, e),
                }
            });
        }
        Ok(())
    }

    fn on_vote_response(&self, peer: &PeerConfig, term: u64, resp: VoteResponse) -> Result<()> {
        let mut st = self.state.lock();
        if resp.term > st.term() {
            return self.step_down(&mut st, resp.term, None);
        }
        if st.role != RaftRole::Candidate || st.term() != term || !resp.vote_granted {
            return Ok(());
        }
        st.votes.insert(peer.id.clone());
        if st.votes.len() >= self.quorum() {
            self.become_leader(&mut st)?;
        }
        Ok(())
    }

    fn become_leader(&self, st: &mut State) -> Result<()> {
        st.role = RaftRole::Leader;
        st.leader_id = Some(self.config.id.clone());
        st.leader_url = Some(self.config.url.clone());
        let next = st.last_index() + 1;
        st.next_index = self
            .config
            .peers
            .iter()
            .map(|p| (p.id.clone(), next))
            .collect();
        st.match_index = self.config.peers.iter().map(|p| (p.id.clone(), 0)).collect();
        st.inflight.clear();

        let noop = LogEntry {
            term: st.term(),
            index: next,
            data: Vec::new(),
        };
        st.log.append(&[noop])?;
        st.leader_ready_index = next;
        tracing::info!(
            "Raft node {} became leader for term {}",
            self.config.id,
            st.term()
        );
        self.publish_leader(st);
        self.advance_commit(st)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Replicate `data` and return the state machine's result once it
    /// is committed and applied on this leader.
    pub async fn propose(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.check_running()?;
        let (index, rx) = {
            let mut st = self.state.lock();
            if st.role != RaftRole::Leader {
                return Err(st.not_leader(&self.config.url));
            }
            let index = st.last_index() + 1;
            let term = st.term();
            st.log.append(&[LogEntry { term, index, data }])?;
            let (tx, rx) = oneshot::channel();
            st.waiters.insert(index, (term, tx));
            self.advance_commit(&mut st)?;
            (index, rx)
        };
        self.notify.notify_one();

        match tokio::time::timeout(self.config.propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::LeaderUnavailable),
            Err(_) => {
                self.state.lock().waiters.remove(&index);
                Err(Error::ConsensusTimeout)
            }
        }
    }

    fn broadcast(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.role != RaftRole::Leader {
            return;
        }
        let term = st.term();
        for peer in &self.config.peers {
            if st.inflight.contains(&peer.id) {
                continue;
            }
            let next = st.next_index.get(&peer.id).copied().unwrap_or(1);
            let node = self.clone();
            let peer = peer.clone();

            if next <= st.snapshot_index() {
                let req = SnapshotRequest {
                    term,
                    leader_id: self.config.id.clone(),
                    leader_url: self.config.url.clone(),
                    last_included_index: st.log.snapshot.last_index,
                    last_included_term: st.log.snapshot.last_term,
                    data: st.log.snapshot.data.clone(),
                };
                st.inflight.insert(peer.id.clone());
                tokio::spawn(async move {
                    let last = req.last_included_index;
                    let result = node.transport.install_snapshot(&peer, req).await;
                    node.on_snapshot_response(&peer, term, last, result);
                });
                continue;
            }

            let prev_log_index = next - 1;
            let Some(prev_log_term) = st.term_at(prev_log_index) else {
                continue;
            };
            let req = AppendRequest {
                term,
                leader_id: self.config.id.clone(),
                leader_url: self.config.url.clone(),
                prev_log_index,
                prev_log_term,
                entries: st.entries_from(next),
                leader_commit: st.commit_index,
            };
            st.inflight.insert(peer.id.clone());
            tokio::spawn(async move {
                let sent = req.entries.len() as u64;
                let result = node.transport.append_entries(&peer, req).await;
                node.on_append_response(&peer, term, prev_log_index, sent, result);
            });
        }
    }

    fn on_append_response(
        &self,
        peer: &PeerConfig,
        term: u64,
        prev_log_index: u64,
        sent: u64,
        result: Result<AppendResponse>,
    ) {
        let mut st = self.state.lock();
        st.inflight.remove(&peer.id);
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!("AppendEntries to {} failed: {}", peer.id, e);
                return;
            }
        };
        if resp.term > st.term() {
            if let Err(e) = self.step_down(&mut st, resp.term, None) {
                tracing::error!("Failed to step down: {}", e);
            }
            return;
        }
        if st.role != RaftRole::Leader || st.term() != term {
            return;
        }

        let last = st.last_index();
        if resp.success {
            let matched = prev_log_index + sent;
            let entry = st.match_index.entry(peer.id.clone()).or_insert(0);
            *entry = (*entry).max(matched);
            st.next_index.insert(peer.id.clone(), matched + 1);
            if let Err(e) = self.advance_commit(&mut st) {
                tracing::error!("Failed to advance commit: {}", e);
            }
            if matched < last {
                self.notify.notify_one();
            }
        } else {
            let current = st.next_index.get(&peer.id).copied().unwrap_or(1);
            let mut next = resp.conflict_index.clamp(1, last + 1);
            if next >= current {
                next = current.saturating_sub(1).max(1);
            }
            st.next_index.insert(peer.id.clone(), next);
            self.notify.notify_one();
        }
    }

    fn on_snapshot_response(
        &self,
        peer: &PeerConfig,
        term: u64,
        last_included: u64,
        result: Result<SnapshotResponse>,
    ) {
        let mut st = self.state.lock();
        st.inflight.remove(&peer.id);
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("InstallSnapshot to {} failed: {}", peer.id, e);
                return;
            }
        };
        if resp.term > st.term() {
            if let Err(e) = self.step_down(&mut st, resp.term, None) {
                tracing::error!("Failed to step down: {}", e);
            }
            return;
        }
        if st.role != RaftRole::Leader || st.term() != term {
            return;
        }
        let entry = st.match_index.entry(peer.id.clone()).or_insert(0);
        *entry = (*entry).max(last_included);
        st.next_index.insert(peer.id.clone(), last_included + 1);
        self.notify.notify_one();
    }

    /// Commit the highest current-term index stored on a majority.
    fn advance_commit(&self, st: &mut State) -> Result<()> {
        let term = st.term();
        let mut n = st.last_index();
        while n > st.commit_index {
            if st.term_at(n) == Some(term) {
                let replicas = 1 + st.match_index.values().filter(|m| **m >= n).count();
                if replicas >= self.quorum() {
                    st.commit_index = n;
                    break;
                }
            } else {
                break;
            }
            n -= 1;
        }
        self.apply_committed(st)
    }

    fn apply_committed(&self, st: &mut State) -> Result<()> {
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let Some(entry) = st.entry(index).cloned() else {
                return Err(Error::Internal(format!("raft entry {} missing", index)));
            };
            let result = self.state_machine.apply(entry.index, entry.term, &entry.data);
            st.last_applied = index;

            match st.waiters.remove(&index) {
                Some((term, tx)) if term == entry.term => {
                    let _ = tx.send(result);
                }
                Some((_, tx)) => {
                    let _ = tx.send(Err(st.not_leader(&self.config.url)));
                }
                None => {
                    if let Err(e) = result {
                        tracing::debug!("Entry {} rejected by state machine: {}", index, e);
                    }
                }
            }
        }
        self.maybe_compact(st)
    }

    fn maybe_compact(&self, st: &mut State) -> Result<()> {
        if self.config.snapshot_threshold == 0
            || st.last_applied - st.snapshot_index() < self.config.snapshot_threshold
        {
            return Ok(());
        }
        let last_index = st.last_applied;
        let Some(last_term) = st.term_at(last_index) else {
            return Ok(());
        };
        let data = self.state_machine.snapshot()?;
        st.log.install_snapshot(SnapshotFile {
            last_index,
            last_term,
            data,
        })?;
        tracing::info!(
            "Raft node {} compacted log through index {}",
            self.config.id,
            last_index
        );
        Ok(())
    }

    pub fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.check_running()?;
        let mut st = self.state.lock();

        // A follower that hears from a live leader ignores disruptive candidates
        let leader_alive = st.role == RaftRole::Follower
            && st.leader_id.is_some()
            && st
                .last_leader_contact
                .map(|t| t.elapsed() < self.config.election_timeout)
                .unwrap_or(false);
        if leader_alive && req.term > st.term() {
            return Ok(VoteResponse {
                term: st.term(),
                vote_granted: false,
            });
        }

        if req.term > st.term() {
            self.step_down(&mut st, req.term, None)?;
        }
        let up_to_date = (req.last_log_term, req.last_log_index) >= (st.last_term(), st.last_index());
        let can_vote = match &st.log.hard_state.voted_for {
            None => true,
            Some(id) => *id == req.candidate_id,
        };
        let granted = req.term == st.term() && can_vote && up_to_date;
        if granted {
            st.log.save_hard_state(HardState {
                term: req.term,
                voted_for: Some(req.candidate_id.clone()),
            })?;
            self.reset_deadline(&mut st);
            tracing::debug!(
                "Raft node {} voted for {} in term {}",
                self.config.id,
                req.candidate_id,
                req.term
            );
        }
        Ok(VoteResponse {
            term: st.term(),
            vote_granted: granted,
        })
    }

    pub fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse> {
        self.check_running()?;
        let mut st = self.state.lock();
        if req.term < st.term() {
            return Ok(AppendResponse {
                term: st.term(),
                success: false,
                conflict_index: 0,
            });
        }
        let leader_changed = st.leader_id.as_deref() != Some(req.leader_id.as_str());
        if req.term > st.term() || st.role != RaftRole::Follower || leader_changed {
            self.step_down(
                &mut st,
                req.term,
                Some((req.leader_id.clone(), req.leader_url.clone())),
            )?;
        }
        self.reset_deadline(&mut st);
        st.last_leader_contact = Some(Instant::now());
        let term = st.term();

        if req.prev_log_index < st.snapshot_index() {
            return Ok(AppendResponse {
                term,
                success: false,
                conflict_index: st.snapshot_index() + 1,
            });
        }
        if req.prev_log_index > st.last_index() {
            return Ok(AppendResponse {
                term,
                success: false,
                conflict_index: st.last_index() + 1,
            });
        }
        if let Some(local) = st.term_at(req.prev_log_index) {
            if local != req.prev_log_term {
                let mut first = req.prev_log_index;
                while first > st.snapshot_index() + 1 && st.term_at(first - 1) == Some(local) {
                    first -= 1;
                }
                return Ok(AppendResponse {
                    term,
                    success: false,
                    conflict_index: first,
                });
            }
        }

        let divergent = req
            .entries
            .iter()
            .position(|e| st.term_at(e.index) != Some(e.term));
        if let Some(pos) = divergent {
            let from = req.entries[pos].index;
            if from <= st.last_index() {
                if from <= st.commit_index {
                    return Err(Error::Internal(format!(
                        "leader {} would overwrite committed index {}",
                        req.leader_id, from
                    )));
                }
                st.log.truncate_from(from)?;
            }
            st.log.append(&req.entries[pos..])?;
        }

        let matched = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > st.commit_index {
            st.commit_index = req.leader_commit.min(matched);
            self.apply_committed(&mut st)?;
        }
        Ok(AppendResponse {
            term,
            success: true,
            conflict_index: matched,
        })
    }

    pub fn handle_snapshot(&self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        self.check_running()?;
        let mut st = self.state.lock();
        if req.term < st.term() {
            return Ok(SnapshotResponse { term: st.term() });
        }
        if req.term > st.term() || st.role != RaftRole::Follower {
            self.step_down(
                &mut st,
                req.term,
                Some((req.leader_id.clone(), req.leader_url.clone())),
            )?;
        }
        self.reset_deadline(&mut st);
        st.last_leader_contact = Some(Instant::now());

        if req.last_included_index <= st.commit_index {
            return Ok(SnapshotResponse { term: st.term() });
        }
        self.state_machine.restore(&req.data)?;
        st.log.install_snapshot(SnapshotFile {
            last_index: req.last_included_index,
            last_term: req.last_included_term,
            data: req.data,
        })?;
        st.commit_index = req.last_included_index;
        st.last_applied = req.last_included_index;
        tracing::info!(
            "Raft node {} installed snapshot through index {}",
            self.config.id,
            req.last_included_index
        );
        Ok(SnapshotResponse { term: st.term() })
    }
}

fn random_timeout(base: Duration) -> Duration {
    let ms = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(ms..ms * 2))
}

fn clone_error(err: &Error) -> Error {
    match err {
        Error::NotLeader(url) => Error::NotLeader(url.clone()),
        Error::LeaderUnavailable => Error::LeaderUnavailable,
        other => Error::Cancelled(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::raft_transport::MemoryNetwork;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl StateMachine for Recorder {
        fn apply(&self, index: u64, _term: u64, data: &[u8]) -> Result<Vec<u8>> {
            self.applied.lock().push((index, data.to_vec()));
            Ok(index.to_le_bytes().to_vec())
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(bincode::serialize(&*self.applied.lock())?)
        }

        fn restore(&self, data: &[u8]) -> Result<()> {
            *self.applied.lock() = bincode::deserialize(data)?;
            Ok(())
        }
    }

    fn config(id: &str, peers: &[&str]) -> RaftConfig {
        RaftConfig {
            id: id.into(),
            url: format!("http://{}", id),
            peers: peers
                .iter()
                .map(|p| PeerConfig {
                    id: p.to_string(),
                    url: format!("http://{}", p),
                })
                .collect(),
            election_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            propose_timeout: Duration::from_secs(2),
            snapshot_threshold: 0,
        }
    }

    #[tokio::test]
    async fn test_single_node_commits() {
        let net = MemoryNetwork::new();
        let sm = Arc::new(Recorder::default());
        let node = RaftNode::new(config("m1", &[]), sm.clone(), net.transport("m1"), None).unwrap();
        net.register(&node);
        node.start();

        let mut rx = node.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|l| l.is_self))
            .await
            .unwrap()
            .unwrap();

        let result = node.propose(b"cmd".to_vec()).await.unwrap();
        assert_eq!(result, 2u64.to_le_bytes().to_vec());
        let applied = sm.applied.lock().clone();
        assert_eq!(applied, vec![(1, vec![]), (2, b"cmd".to_vec())]);
        node.stop();
    }

    #[tokio::test]
    async fn test_follower_rejects_proposal() {
        let net = MemoryNetwork::new();
        let node = RaftNode::new(
            config("m1", &["m2", "m3"]),
            Arc::new(Recorder::default()),
            net.transport("m1"),
            None,
        )
        .unwrap();
        assert!(matches!(
            node.propose(b"x".to_vec()).await,
            Err(Error::LeaderUnavailable)
        ));
    }

    #[test]
    fn test_vote_rules() {
        let net = MemoryNetwork::new();
        let node = RaftNode::new(
            config("m1", &["m2", "m3"]),
            Arc::new(Recorder::default()),
            net.transport("m1"),
            None,
        )
        .unwrap();

        let granted = node
            .handle_vote(VoteRequest {
                term: 1,
                candidate_id: "m2".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(granted.vote_granted);

        // One vote per term
        let second = node
            .handle_vote(VoteRequest {
                term: 1,
                candidate_id: "m3".into(),
                last_log_index: 5,
                last_log_term: 1,
            })
            .unwrap();
        assert!(!second.vote_granted);

        // Stale term
        let stale = node
            .handle_vote(VoteRequest {
                term: 0,
                candidate_id: "m3".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!stale.vote_granted);
        assert_eq!(stale.term, 1);
    }

    #[test]
    fn test_append_conflict_hint() {
        let net = MemoryNetwork::new();
        let node = RaftNode::new(
            config("m2", &["m1", "m3"]),
            Arc::new(Recorder::default()),
            net.transport("m2"),
            None,
        )
        .unwrap();

        let entries = (1..=3)
            .map(|i| LogEntry {
                term: 1,
                index: i,
                data: vec![i as u8],
            })
            .collect();
        let resp = node
            .handle_append(AppendRequest {
                term: 1,
                leader_id: "m1".into(),
                leader_url: "http://m1".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries,
                leader_commit: 0,
            })
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.conflict_index, 3);

        // Gap beyond the log
        let resp = node
            .handle_append(AppendRequest {
                term: 2,
                leader_id: "m3".into(),
                leader_url: "http://m3".into(),
                prev_log_index: 7,
                prev_log_term: 2,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 4);

        // Mismatching term at prev: retry from the first index of that term
        let resp = node
            .handle_append(AppendRequest {
                term: 2,
                leader_id: "m3".into(),
                leader_url: "http://m3".into(),
                prev_log_index: 3,
                prev_log_term: 2,
                entries: vec![],
                leader_commit: 0,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 1);

        // Overwrite the uncommitted suffix
        let resp = node
            .handle_append(AppendRequest {
                term: 2,
                leader_id: "m3".into(),
                leader_url: "http://m3".into(),
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![LogEntry {
                    term: 2,
                    index: 2,
                    data: vec![9],
                }],
                leader_commit: 2,
            })
            .unwrap();
        assert!(resp.success);
        let status = node.status();
        assert_eq!(status.last_index, 2);
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.leader_url.as_deref(), Some("http://m3"));

        // A deposed leader's append is refused and leaves the log alone
        let resp = node
            .handle_append(AppendRequest {
                term: 1,
                leader_id: "m1".into(),
                leader_url: "http://m1".into(),
                prev_log_index: 2,
                prev_log_term: 2,
                entries: vec![LogEntry {
                    term: 1,
                    index: 3,
                    data: vec![7],
                }],
                leader_commit: 3,
            })
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 2);
        assert_eq!(node.status().last_index, 2);
    }
}
