//! Leader-based replication of the command log.
//!
//! Every node starts as a follower. A follower that hears nothing from a
//! leader before its randomized election deadline campaigns; a candidate that
//! collects a majority of votes leads the term. The leader appends proposed
//! entries, replicates them with append-entries, and commits an entry once a
//! majority stores it. Committed entries are applied in log order by a single
//! applier.
//!
//! Locking: the applier mutex is always taken before the core mutex, and the
//! core mutex is never held across an RPC. Responses are checked against the
//! term they were sent in.
//!
//! The leader replicates to each peer from its own task and keeps at most one
//! append-entries request outstanding per peer, so a peer that stops answering
//! never delays heartbeats to the others.

use crate::distributed::command::Command;
use crate::distributed::log::{EntryPayload, LogEntry, ReplicatedLog};
use crate::distributed::membership::Membership;
use crate::distributed::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, JoinRequest, JoinResponse, VoteRequest, VoteResponse,
};
use crate::distributed::state_machine::{Applied, StateMachine};
use crate::distributed::transport::Transport;
use crate::error::{Error, Result};
use crate::storage::raft_log::{HardState, LogStore};
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Append-entries rounds a proposal waits for before giving up on a majority
const REPLICATION_ROUNDS: usize = 3;
/// Upper bound on entries shipped in one append-entries request
const MAX_ENTRIES_PER_APPEND: u64 = 256;
/// Leader redirects followed by a joining node
const MAX_JOIN_REDIRECTS: usize = 3;

/// Timing and identity of one consensus node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    /// Address peers use to reach this node
    pub address: String,
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Do not campaign until a leader has made contact
    pub await_leader: bool,
}

impl RaftConfig {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            tick_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            await_leader: false,
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a node, for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub peers: BTreeMap<String, String>,
}

enum TickAction {
    Heartbeat,
    Campaign,
}

/// Everything guarded by the core mutex
struct Core {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    log: ReplicatedLog,
    commit_index: u64,
    last_applied: u64,
    membership: Membership,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    last_broadcast: Option<Instant>,
    awaiting_leader: bool,
    store: Box<dyn LogStore>,
    /// Leader commit index, watched by pending proposals
    commit_watch: watch::Sender<u64>,
}

impl Core {
    fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            last_applied: self.last_applied,
        }
    }

    fn persist(&mut self) -> Result<()> {
        let state = self.hard_state();
        self.store.save_hard_state(&state)
    }

    fn reset_election_deadline(&mut self, config: &RaftConfig) {
        self.election_deadline = Instant::now() + config.random_election_timeout();
    }

    /// Step down for `term`. Returns true when the term moved forward, in
    /// which case the hard state must be persisted.
    fn become_follower(&mut self, term: u64, config: &RaftConfig) -> bool {
        let advanced = term > self.current_term;
        if advanced {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.role != Role::Follower {
            info!(term = self.current_term, from = %self.role, "stepping down to follower");
            self.role = Role::Follower;
            self.reset_election_deadline(config);
        }
        advanced
    }

    /// Adopt a newer term seen in a vote request, clearing the vote
    fn become_follower_if_newer(&mut self, term: u64, config: &RaftConfig) -> bool {
        term > self.current_term && self.become_follower(term, config)
    }

    fn become_leader(&mut self, config: &RaftConfig) -> Result<()> {
        self.role = Role::Leader;
        self.leader_id = Some(config.node_id.clone());
        self.last_broadcast = None;
        let next = self.log.last_index() + 1;
        self.next_index = self.membership.peers().keys().map(|id| (id.clone(), next)).collect();
        self.match_index = self.membership.peers().keys().map(|id| (id.clone(), 0)).collect();

        // A fresh cluster records its founding members in the log so that nodes
        // joining later learn every address; otherwise a no-op lets entries from
        // earlier terms commit.
        let mut opening = Vec::new();
        if self.log.last_index() == 0 {
            opening.push(EntryPayload::Join {
                node_id: config.node_id.clone(),
                address: config.address.clone(),
            });
            for (id, address) in self.membership.peers() {
                opening.push(EntryPayload::Join {
                    node_id: id.clone(),
                    address: address.clone(),
                });
            }
        } else {
            opening.push(EntryPayload::Noop);
        }
        for payload in opening {
            if let Err(e) = self.append_local(payload) {
                self.role = Role::Follower;
                self.leader_id = None;
                return Err(e);
            }
        }
        self.advance_commit();
        info!(term = self.current_term, last_index = self.log.last_index(), "became leader");
        Ok(())
    }

    /// Persist, then append an entry of the current term
    fn append_local(&mut self, payload: EntryPayload) -> Result<LogEntry> {
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, payload);
        self.store.append(std::slice::from_ref(&entry))?;
        self.log.append(entry.term, entry.payload.clone());
        Ok(entry)
    }

    /// Move the commit index to the highest entry of the current term stored
    /// on a majority. Returns true if it moved.
    fn advance_commit(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let quorum = self.membership.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            // earlier terms only commit indirectly
            if self.log.term_at(index) != Some(self.current_term) {
                break;
            }
            let acks = 1 + self
                .membership
                .peers()
                .keys()
                .filter(|id| self.match_index.get(*id).copied().unwrap_or(0) >= index)
                .count();
            if acks >= quorum {
                debug!(from = self.commit_index, to = index, "commit index advanced");
                self.commit_index = index;
                self.commit_watch.send_replace(index);
                return true;
            }
            index -= 1;
        }
        false
    }

    fn on_append_response(
        &mut self,
        peer: &str,
        sent_term: u64,
        prev_log_index: u64,
        sent: u64,
        response: AppendEntriesResponse,
        config: &RaftConfig,
    ) -> Result<()> {
        if response.term > self.current_term {
            info!(peer, term = response.term, "peer has a newer term");
            if self.become_follower(response.term, config) {
                self.persist()?;
            }
            return Ok(());
        }
        if self.role != Role::Leader || self.current_term != sent_term {
            return Ok(());
        }
        if response.success {
            let matched = prev_log_index + sent;
            let known = self.match_index.entry(peer.to_string()).or_insert(0);
            if matched > *known {
                *known = matched;
            }
            let next = *known + 1;
            self.next_index.insert(peer.to_string(), next);
        } else {
            let current = self.next_index.get(peer).copied().unwrap_or(prev_log_index + 1);
            let next = (response.last_log_index + 1).min(current.saturating_sub(1)).max(1);
            trace!(peer, next, "log mismatch, backing off");
            self.next_index.insert(peer.to_string(), next);
        }
        Ok(())
    }

    fn append_request_for(&self, peer: &str, config: &RaftConfig) -> AppendEntriesRequest {
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next - 1;
        AppendEntriesRequest {
            term: self.current_term,
            leader_id: config.node_id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.range(next, next + MAX_ENTRIES_PER_APPEND - 1),
            leader_commit: self.commit_index,
        }
    }

    fn not_leader(&self) -> Error {
        Error::NotLeader {
            leader: self.leader_id.clone(),
        }
    }
}

/// One member of the consensus group
pub struct RaftNode {
    config: RaftConfig,
    core: Mutex<Core>,
    applier: Mutex<StateMachine>,
    transport: Arc<dyn Transport>,
    /// One slot per peer, held while an append-entries request to it is outstanding
    outstanding: DashMap<String, Arc<Mutex<()>>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<RaftNode>,
}

/// Append-entries sends planned for one replication round
struct PeerSend {
    peer: String,
    address: String,
    slot: Arc<Mutex<()>>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl RaftNode {
    /// Restore a node from `log_store` and replay every entry already known
    /// to be applied, which rebuilds the state machine's volatile state.
    pub async fn open(
        config: RaftConfig,
        membership: Membership,
        mut log_store: Box<dyn LogStore>,
        state_machine: StateMachine,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let (hard_state, entries) = log_store.load()?;
        let log = ReplicatedLog::from_entries(entries)?;
        let last_applied = hard_state.last_applied.min(log.last_index());

        let mut membership = membership;
        let mut machine = state_machine;
        for entry in log.range(machine.last_applied() + 1, last_applied) {
            if let Applied::MemberAdded { node_id, address } = machine.apply(&entry).await? {
                membership.add(node_id, address);
            }
        }
        if last_applied > 0 {
            info!(
                node = %config.node_id,
                term = hard_state.current_term,
                replayed = last_applied,
                log_len = log.last_index(),
                "consensus state restored"
            );
        }

        let core = Core {
            role: Role::Follower,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            log,
            commit_index: last_applied,
            last_applied,
            membership,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now() + config.random_election_timeout(),
            last_broadcast: None,
            awaiting_leader: config.await_leader,
            store: log_store,
            commit_watch: watch::Sender::new(last_applied),
        };

        Ok(Arc::new_cyclic(|this| Self {
            config,
            core: Mutex::new(core),
            applier: Mutex::new(machine),
            transport,
            outstanding: DashMap::new(),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
            this: this.clone(),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Token cancelled on shutdown; background services share it
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the background tick task. A node without peers that is not
    /// waiting for a leader elects itself before returning.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return Ok(());
        }
        let solo = {
            let core = self.core.lock().await;
            core.membership.is_single_node() && !core.awaiting_leader
        };
        if solo {
            self.campaign().await?;
        }

        let node = Arc::clone(self);
        let cancel = self.cancel.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => node.tick().await,
                }
            }
            debug!(node = %node.config.node_id, "tick loop stopped");
        }));
        Ok(())
    }

    /// Stop the tick task and wait for it to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.ticker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "tick task ended abnormally");
            }
        }
        info!(node = %self.config.node_id, "consensus node stopped");
    }

    /// One step of the timer: campaign if the election deadline passed, or
    /// send heartbeats if leading and the heartbeat interval elapsed.
    pub async fn tick(&self) {
        let action = {
            let core = self.core.lock().await;
            let now = Instant::now();
            match core.role {
                Role::Leader => {
                    let due = core
                        .last_broadcast
                        .map_or(true, |at| now.duration_since(at) >= self.config.heartbeat_interval);
                    due.then_some(TickAction::Heartbeat)
                }
                _ if core.awaiting_leader => None,
                _ => (now >= core.election_deadline).then_some(TickAction::Campaign),
            }
        };
        match action {
            Some(TickAction::Heartbeat) => {
                // peers answer on their own tasks
                self.dispatch(false).await;
            }
            Some(TickAction::Campaign) => {
                if let Err(e) = self.campaign().await {
                    warn!(error = %e, "election attempt failed");
                }
            }
            None => {}
        }
    }

    /// Run for leadership of the next term
    pub async fn campaign(&self) -> Result<()> {
        let (term, request, peers, quorum) = {
            let mut core = self.core.lock().await;
            if core.role == Role::Leader {
                return Ok(());
            }
            core.current_term += 1;
            core.role = Role::Candidate;
            core.voted_for = Some(self.config.node_id.clone());
            core.leader_id = None;
            core.awaiting_leader = false;
            core.reset_election_deadline(&self.config);
            core.persist()?;
            info!(node = %self.config.node_id, term = core.current_term, "starting election");

            let request = VoteRequest {
                term: core.current_term,
                candidate_id: self.config.node_id.clone(),
                last_log_index: core.log.last_index(),
                last_log_term: core.log.last_term(),
            };
            (core.current_term, request, core.membership.peers().clone(), core.membership.quorum())
        };

        // tally votes as they arrive; a silent peer must not hold up the outcome
        let mut pending: FuturesUnordered<_> = peers
            .iter()
            .map(|(peer, address)| {
                let request = request.clone();
                async move { (peer.as_str(), self.transport.request_vote(address, request).await) }
            })
            .collect();
        let mut votes = 1;
        let mut outstanding = pending.len();
        // stop waiting before any deadline can pass, so candidates that split
        // a vote retry at their own random times
        let give_up = Instant::now() + self.config.election_timeout_min;
        while votes < quorum && votes + outstanding >= quorum {
            let (peer, result) = match tokio::time::timeout_at(give_up, pending.next()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    debug!(term, "gave up waiting for votes");
                    break;
                }
            };
            outstanding -= 1;
            match result {
                Ok(response) if response.term > term => {
                    let mut core = self.core.lock().await;
                    if response.term > core.current_term {
                        info!(peer, term = response.term, "peer has a newer term");
                        if core.become_follower(response.term, &self.config) {
                            core.persist()?;
                        }
                    }
                    return Ok(());
                }
                Ok(response) if response.vote_granted => votes += 1,
                Ok(_) => {}
                Err(e) => debug!(peer, error = %e, "vote request failed"),
            }
        }
        drop(pending);

        if votes < quorum {
            debug!(term, votes, quorum, "election not won");
            return Ok(());
        }
        {
            let mut core = self.core.lock().await;
            if core.role != Role::Candidate || core.current_term != term {
                return Ok(());
            }
            core.become_leader(&self.config)?;
        }

        // announce the new term; slow peers are left to their own tasks
        if let Some(round) = self.dispatch(false).await {
            let _ = tokio::time::timeout(self.config.heartbeat_interval, join_all(round)).await;
        }
        if let Err(e) = self.apply_committed().await {
            warn!(error = %e, "applying committed entries failed");
        }
        Ok(())
    }

    /// Send one round of append-entries to every peer and wait until each has
    /// answered or failed. Returns false when this node is not the leader.
    pub async fn replicate(&self) -> bool {
        let Some(round) = self.dispatch(true).await else {
            return false;
        };
        for result in join_all(round).await {
            if let Err(e) = result {
                warn!(error = %e, "replication task ended abnormally");
            }
        }
        self.is_leader().await
    }

    /// Start one append-entries send per peer, each on its own task. A peer
    /// whose previous request is still outstanding is skipped unless `wait`
    /// is set, in which case its task queues behind that request. Returns
    /// `None` when this node is not the leader.
    async fn dispatch(&self, wait: bool) -> Option<Vec<JoinHandle<()>>> {
        let node = self.this.upgrade()?;
        let (term, sends) = {
            let mut core = self.core.lock().await;
            if core.role != Role::Leader {
                return None;
            }
            core.last_broadcast = Some(Instant::now());
            let mut sends = Vec::new();
            for (peer, address) in core.membership.peers() {
                let slot = Arc::clone(&self.outstanding.entry(peer.clone()).or_default());
                let permit = match Arc::clone(&slot).try_lock_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) if wait => None,
                    Err(_) => {
                        trace!(peer = %peer, "append entries still outstanding");
                        continue;
                    }
                };
                sends.push(PeerSend {
                    peer: peer.clone(),
                    address: address.clone(),
                    slot,
                    permit,
                });
            }
            (core.current_term, sends)
        };

        Some(
            sends
                .into_iter()
                .map(|send| {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move { node.replicate_to(send, term).await })
                })
                .collect(),
        )
    }

    /// Send `send.peer` whatever it is missing and fold in its answer
    async fn replicate_to(&self, send: PeerSend, term: u64) {
        let PeerSend {
            peer,
            address,
            slot,
            permit,
        } = send;
        let permit = match permit {
            Some(permit) => permit,
            None => slot.lock_owned().await,
        };

        let request = {
            let core = self.core.lock().await;
            if core.role != Role::Leader || core.current_term != term {
                return;
            }
            core.append_request_for(&peer, &self.config)
        };
        let prev_log_index = request.prev_log_index;
        let sent = request.entries.len() as u64;
        let result = self.transport.append_entries(&address, request).await;
        if self.cancel.is_cancelled() {
            return;
        }

        let advanced = {
            let mut core = self.core.lock().await;
            match result {
                Ok(response) => {
                    if let Err(e) =
                        core.on_append_response(&peer, term, prev_log_index, sent, response, &self.config)
                    {
                        warn!(peer = %peer, error = %e, "persisting hard state failed");
                    }
                }
                Err(e) => trace!(peer = %peer, error = %e, "append entries failed"),
            }
            core.role == Role::Leader && core.current_term == term && core.advance_commit()
        };
        drop(permit);

        if advanced {
            if let Err(e) = self.apply_committed().await {
                warn!(error = %e, "applying committed entries failed");
            }
        }
    }

    /// Alias for one replication round, used as an explicit heartbeat
    pub async fn heartbeat(&self) -> bool {
        self.replicate().await
    }

    /// Propose `command` and return its log index once committed and applied
    pub async fn apply(&self, command: Command) -> Result<u64> {
        command.validate()?;
        debug!(kind = command.kind(), key = command.key(), "proposing command");
        self.propose(EntryPayload::Command(command)).await
    }

    /// Add a node to the cluster through a replicated membership entry
    pub async fn join(&self, node_id: &str, address: &str) -> Result<u64> {
        if node_id.is_empty() || address.is_empty() {
            return Err(Error::Validation("node id and address must not be empty".to_string()));
        }
        if node_id == self.config.node_id {
            return Err(Error::Validation(format!("{node_id} is already a member")));
        }
        info!(node = node_id, address, "proposing new member");
        self.propose(EntryPayload::Join {
            node_id: node_id.to_string(),
            address: address.to_string(),
        })
        .await
    }

    async fn propose(&self, payload: EntryPayload) -> Result<u64> {
        let (index, term, mut committed) = {
            let mut core = self.core.lock().await;
            if core.role != Role::Leader {
                return Err(core.not_leader());
            }
            let entry = core.append_local(payload)?;
            core.advance_commit();
            (entry.index, entry.term, core.commit_watch.subscribe())
        };

        for _ in 0..REPLICATION_ROUNDS {
            if self.is_committed(index, term).await? {
                break;
            }
            let Some(round) = self.dispatch(false).await else {
                break;
            };
            let reached = async {
                loop {
                    let commit_index = *committed.borrow_and_update();
                    if commit_index >= index || committed.changed().await.is_err() {
                        break;
                    }
                }
            };
            // peers skipped this round get another chance after a tick
            let round_done = async {
                join_all(round).await;
                tokio::time::sleep(self.config.tick_interval).await;
            };
            tokio::select! {
                _ = reached => {}
                _ = round_done => {}
            }
        }
        if !self.is_committed(index, term).await? {
            return Err(Error::NotCommitted { index });
        }
        self.apply_committed().await?;
        Ok(index)
    }

    async fn is_committed(&self, index: u64, term: u64) -> Result<bool> {
        let core = self.core.lock().await;
        if core.log.term_at(index) != Some(term) {
            // overwritten by a newer leader
            return Err(core.not_leader());
        }
        Ok(core.commit_index >= index)
    }

    /// Apply every committed entry not yet applied, in order
    async fn apply_committed(&self) -> Result<()> {
        let mut machine = self.applier.lock().await;
        loop {
            let pending = {
                let core = self.core.lock().await;
                core.log.range(machine.last_applied() + 1, core.commit_index)
            };
            if pending.is_empty() {
                return Ok(());
            }
            for entry in pending {
                let applied = machine.apply(&entry).await?;

                let mut core = self.core.lock().await;
                if let Applied::MemberAdded { node_id, address } = applied {
                    if core.membership.add(node_id.clone(), address.clone()) {
                        info!(node = %node_id, %address, members = core.membership.size(), "member added");
                        if core.role == Role::Leader {
                            let next = core.log.last_index() + 1;
                            core.next_index.insert(node_id.clone(), next);
                            core.match_index.insert(node_id, 0);
                        }
                    }
                }
                core.last_applied = entry.index;
                if let Err(e) = core.persist() {
                    // a stale applied index only shortens replay on restart
                    warn!(index = entry.index, error = %e, "persisting applied index failed");
                }
            }
        }
    }

    pub async fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut core = self.core.lock().await;
        let previous = (
            core.current_term,
            core.voted_for.clone(),
            core.role,
            core.leader_id.clone(),
        );
        let mut changed = core.become_follower_if_newer(request.term, &self.config);

        let mut granted = false;
        if request.term == core.current_term {
            let up_to_date =
                (request.last_log_term, request.last_log_index) >= (core.log.last_term(), core.log.last_index());
            let free = core
                .voted_for
                .as_deref()
                .map_or(true, |v| v == request.candidate_id);
            if up_to_date && free {
                if core.voted_for.is_none() {
                    core.voted_for = Some(request.candidate_id.clone());
                    changed = true;
                }
                granted = true;
            }
        }

        if changed {
            if let Err(e) = core.persist() {
                warn!(error = %e, "persisting vote failed, refusing");
                (core.current_term, core.voted_for, core.role, core.leader_id) = previous;
                return VoteResponse {
                    term: core.current_term,
                    vote_granted: false,
                };
            }
        }
        if granted {
            core.reset_election_deadline(&self.config);
            debug!(candidate = %request.candidate_id, term = request.term, "vote granted");
        }
        VoteResponse {
            term: core.current_term,
            vote_granted: granted,
        }
    }

    pub async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (response, advanced) = self.accept_entries(request).await;
        if advanced {
            if let Err(e) = self.apply_committed().await {
                warn!(error = %e, "applying committed entries failed");
            }
        }
        response
    }

    async fn accept_entries(&self, request: AppendEntriesRequest) -> (AppendEntriesResponse, bool) {
        let mut core = self.core.lock().await;
        let reject = |core: &Core, last_log_index: u64| AppendEntriesResponse {
            term: core.current_term,
            success: false,
            last_log_index,
        };

        if request.term < core.current_term {
            return (reject(&*core, core.log.last_index()), false);
        }
        if core.become_follower(request.term, &self.config) {
            if let Err(e) = core.persist() {
                warn!(error = %e, "persisting term failed");
                return (reject(&*core, core.log.last_index()), false);
            }
        }
        if core.leader_id.as_deref() != Some(request.leader_id.as_str()) {
            info!(leader = %request.leader_id, term = request.term, "following leader");
            core.leader_id = Some(request.leader_id.clone());
        }
        core.awaiting_leader = false;
        core.reset_election_deadline(&self.config);

        if !core.log.matches(request.prev_log_index, request.prev_log_term) {
            let hint = core.log.last_index().min(request.prev_log_index.saturating_sub(1));
            return (reject(&*core, hint), false);
        }

        let plan = match core.log.plan_append(&request.entries, core.commit_index) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "rejecting append entries");
                return (reject(&*core, core.log.last_index()), false);
            }
        };
        if !plan.is_noop() {
            let persisted = match plan.truncate_from {
                Some(_) => {
                    let entries = core.log.preview(&plan);
                    core.store.rewrite(&entries)
                }
                None => core.store.append(&plan.new_entries),
            };
            if let Err(e) = persisted {
                warn!(error = %e, "persisting log entries failed");
                return (reject(&*core, core.log.last_index()), false);
            }
            if let Some(from) = plan.truncate_from {
                info!(from, "dropped conflicting log suffix");
            }
            debug!(count = plan.new_entries.len(), "entries appended");
            core.log.apply_plan(plan);
        }

        let last_new = request.prev_log_index + request.entries.len() as u64;
        let target = request.leader_commit.min(last_new);
        let advanced = target > core.commit_index;
        if advanced {
            core.commit_index = target;
        }
        (
            AppendEntriesResponse {
                term: core.current_term,
                success: true,
                last_log_index: core.log.last_index(),
            },
            advanced,
        )
    }

    /// Serve a join request from a node that wants in
    pub async fn handle_join(&self, request: JoinRequest) -> JoinResponse {
        match self.join(&request.node_id, &request.address).await {
            Ok(index) => JoinResponse {
                index: Some(index),
                leader: None,
                error: None,
            },
            Err(Error::NotLeader { leader }) => {
                let core = self.core.lock().await;
                JoinResponse {
                    index: None,
                    leader: leader.and_then(|id| core.membership.peers().get(&id).cloned()),
                    error: Some("not leader".to_string()),
                }
            }
            Err(e) => JoinResponse {
                index: None,
                leader: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Ask the node at `seed` (following leader redirects) to add this node
    pub async fn request_join(&self, seed: &str) -> Result<u64> {
        let mut target = seed.to_string();
        for _ in 0..=MAX_JOIN_REDIRECTS {
            let request = JoinRequest {
                node_id: self.config.node_id.clone(),
                address: self.config.address.clone(),
            };
            let response = self.transport.join(&target, request).await?;
            if let Some(index) = response.index {
                info!(via = %target, index, "joined cluster");
                return Ok(index);
            }
            match response.leader {
                Some(leader) if leader != target => {
                    debug!(from = %target, to = %leader, "join redirected");
                    target = leader;
                }
                _ => {
                    return Err(Error::Distributed(format!(
                        "join via {target} failed: {}",
                        response.error.unwrap_or_else(|| "no leader".to_string())
                    )))
                }
            }
        }
        Err(Error::Distributed("too many join redirects".to_string()))
    }

    /// Role name and current term
    pub async fn get_state(&self) -> (String, u64) {
        let core = self.core.lock().await;
        (core.role.as_str().to_string(), core.current_term)
    }

    pub async fn is_leader(&self) -> bool {
        self.core.lock().await.role == Role::Leader
    }

    pub async fn status(&self) -> NodeStatus {
        let core = self.core.lock().await;
        NodeStatus {
            node_id: self.config.node_id.clone(),
            role: core.role,
            term: core.current_term,
            leader_id: core.leader_id.clone(),
            commit_index: core.commit_index,
            last_applied: core.last_applied,
            last_log_index: core.log.last_index(),
            peers: core.membership.peers().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::TemporalStore;
    use crate::core::temporal::Timestamp;
    use crate::crdt::registry::CrdtRegistry;
    use crate::distributed::transport::ClusterRouter;
    use crate::storage::raft_log::{FileLogStore, InMemoryLogStore};
    use crate::storage::snapshot::JsonFilePersistence;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct TestNode {
        raft: Arc<RaftNode>,
        store: Arc<TemporalStore>,
        registry: Arc<CrdtRegistry>,
    }

    fn slow_config(id: &str) -> RaftConfig {
        // long timeouts so only explicit campaigns start elections
        let mut config = RaftConfig::new(id, id);
        config.election_timeout_min = Duration::from_secs(60);
        config.election_timeout_max = Duration::from_secs(120);
        config
    }

    async fn node(
        router: &Arc<ClusterRouter>,
        id: &str,
        peers: &[&str],
        log_store: Box<dyn LogStore>,
        store: Arc<TemporalStore>,
    ) -> TestNode {
        let registry = Arc::new(CrdtRegistry::new());
        let membership = Membership::with_peers(id, peers.iter().map(|p| (*p, *p)));
        let raft = RaftNode::open(
            slow_config(id),
            membership,
            log_store,
            StateMachine::new(Arc::clone(&store), Arc::clone(&registry)),
            router.transport(id),
        )
        .await
        .unwrap();
        router.register(id, &raft);
        TestNode { raft, store, registry }
    }

    async fn cluster(router: &Arc<ClusterRouter>) -> Vec<TestNode> {
        let ids = ["n1", "n2", "n3"];
        let mut nodes = Vec::new();
        for id in ids {
            let peers: Vec<&str> = ids.iter().copied().filter(|p| *p != id).collect();
            nodes.push(
                node(
                    router,
                    id,
                    &peers,
                    Box::new(InMemoryLogStore::new()),
                    Arc::new(TemporalStore::in_memory()),
                )
                .await,
            );
        }
        nodes
    }

    async fn leaders_by_term(nodes: &[TestNode]) -> HashMap<u64, usize> {
        let mut leaders = HashMap::new();
        for n in nodes {
            let (role, term) = n.raft.get_state().await;
            if role == "leader" {
                *leaders.entry(term).or_insert(0) += 1;
            }
        }
        leaders
    }

    /// Forwards to the router, except that calls to `dead` hang for `delay`
    /// and then fail, like a peer that stopped answering
    struct DeadPeer {
        inner: Arc<dyn Transport>,
        dead: String,
        delay: Duration,
    }

    impl DeadPeer {
        async fn check(&self, target: &str) -> Result<()> {
            if target == self.dead {
                tokio::time::sleep(self.delay).await;
                return Err(Error::Distributed(format!("rpc to {target} timed out")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for DeadPeer {
        async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
            self.check(target).await?;
            self.inner.request_vote(target, request).await
        }

        async fn append_entries(&self, target: &str, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
            self.check(target).await?;
            self.inner.append_entries(target, request).await
        }

        async fn join(&self, target: &str, request: JoinRequest) -> Result<JoinResponse> {
            self.check(target).await?;
            self.inner.join(target, request).await
        }
    }

    /// In-memory log store whose hard-state writes fail on demand
    struct FlakyLogStore {
        inner: InMemoryLogStore,
        fail: Arc<AtomicBool>,
    }

    impl LogStore for FlakyLogStore {
        fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)> {
            self.inner.load()
        }

        fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.inner.save_hard_state(state)
        }

        fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
            self.inner.append(entries)
        }

        fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()> {
            self.inner.rewrite(entries)
        }
    }

    fn file_node_parts(dir: &Path) -> (Box<dyn LogStore>, Arc<TemporalStore>) {
        let log_store = Box::new(FileLogStore::open(dir).unwrap());
        let persistence = Arc::new(JsonFilePersistence::new(dir).unwrap());
        (log_store, Arc::new(TemporalStore::open(persistence).unwrap()))
    }

    #[tokio::test]
    async fn test_single_node_leads_immediately() {
        let router = ClusterRouter::new();
        let n = node(
            &router,
            "solo",
            &[],
            Box::new(InMemoryLogStore::new()),
            Arc::new(TemporalStore::in_memory()),
        )
        .await;
        n.raft.start().await.unwrap();

        assert_eq!(n.raft.get_state().await, ("leader".to_string(), 1));
        let index = n.raft.apply(Command::increment("views", "solo", 3)).await.unwrap();
        assert!(index >= 2);
        assert_eq!(n.registry.counter_value("views").await, 3);
        n.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();

        let err = nodes[1]
            .raft
            .apply(Command::increment("views", "n2", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader { leader: Some(ref id) } if id == "n1"));
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_log() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();
        let before = nodes[0].raft.status().await.last_log_index;

        let err = nodes[0]
            .raft
            .apply(Command::increment("views", "n1", -1))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(nodes[0].raft.status().await.last_log_index, before);
    }

    #[tokio::test]
    async fn test_three_node_election_and_replication() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();
        assert_eq!(nodes[0].raft.get_state().await, ("leader".to_string(), 1));
        assert_eq!(nodes[1].raft.get_state().await, ("follower".to_string(), 1));

        let insert = Command::insert(
            "price",
            json!(100),
            Timestamp::from_ymd(2024, 1, 1).unwrap(),
            Timestamp::END_OF_TIME,
        )
        .unwrap();
        nodes[0].raft.apply(insert).await.unwrap();
        nodes[0].raft.apply(Command::increment("views", "n1", 3)).await.unwrap();
        // followers learn the final commit index from the next heartbeat
        nodes[0].raft.heartbeat().await;

        for n in &nodes {
            assert_eq!(n.store.query_current("price").await, Some(json!(100)));
            assert_eq!(n.registry.counter_value("views").await, 3);
            let status = n.raft.status().await;
            assert_eq!(status.commit_index, status.last_applied);
            assert_eq!(status.leader_id.as_deref(), Some("n1"));
        }
    }

    #[tokio::test]
    async fn test_at_most_one_leader_per_term() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;

        for round in 0..5 {
            // everyone campaigns at once; split votes are fine, two winners are not
            let _ = tokio::join!(
                nodes[0].raft.campaign(),
                nodes[1].raft.campaign(),
                nodes[2].raft.campaign()
            );
            for (term, count) in leaders_by_term(&nodes).await {
                assert!(count <= 1, "round {round}: {count} leaders in term {term}");
            }
            // a partitioned node campaigning alone must not win a new term;
            // if it already leads, campaigning is a no-op
            router.isolate("n3");
            let (_, before) = nodes[2].raft.get_state().await;
            let _ = nodes[2].raft.campaign().await;
            let (role, term) = nodes[2].raft.get_state().await;
            assert!(
                role != "leader" || term == before,
                "round {round}: isolated node won term {term}"
            );
            router.heal_all();
        }
    }

    #[tokio::test]
    async fn test_partitioned_leader_cannot_commit() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();

        router.isolate("n1");
        let err = nodes[0]
            .raft
            .apply(Command::increment("views", "n1", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotCommitted { .. }));
        assert_eq!(nodes[0].registry.counter_value("views").await, 0);

        // the majority side elects a new leader and makes progress
        nodes[1].raft.campaign().await.unwrap();
        assert!(nodes[1].raft.is_leader().await);
        nodes[1].raft.apply(Command::increment("views", "n2", 2)).await.unwrap();

        // once healed the old leader steps down and its uncommitted entry is replaced
        router.heal_all();
        nodes[1].raft.heartbeat().await;
        nodes[1].raft.heartbeat().await;
        let (role, term) = nodes[0].raft.get_state().await;
        assert_eq!(role, "follower");
        assert_eq!(term, nodes[1].raft.get_state().await.1);
        for n in &nodes {
            assert_eq!(n.registry.counter_value("views").await, 2);
        }
    }

    #[tokio::test]
    async fn test_lagging_follower_catches_up() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();

        router.isolate("n3");
        for delta in 1..=4 {
            nodes[0].raft.apply(Command::increment("views", "n1", delta)).await.unwrap();
        }
        assert_eq!(nodes[2].registry.counter_value("views").await, 0);

        router.heal_all();
        for _ in 0..3 {
            nodes[0].raft.heartbeat().await;
        }
        assert_eq!(nodes[2].registry.counter_value("views").await, 10);
        assert_eq!(
            nodes[2].raft.status().await.last_log_index,
            nodes[0].raft.status().await.last_log_index
        );
    }

    #[tokio::test]
    async fn test_join_adds_member_everywhere() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();

        let mut joiner_config = slow_config("n4");
        joiner_config.await_leader = true;
        let registry = Arc::new(CrdtRegistry::new());
        let joiner = RaftNode::open(
            joiner_config,
            Membership::new("n4"),
            Box::new(InMemoryLogStore::new()),
            StateMachine::new(Arc::new(TemporalStore::in_memory()), Arc::clone(&registry)),
            router.transport("n4"),
        )
        .await
        .unwrap();
        router.register("n4", &joiner);

        // asking a follower is redirected to the leader
        joiner.request_join("n2").await.unwrap();
        nodes[0].raft.apply(Command::increment("views", "n1", 7)).await.unwrap();
        nodes[0].raft.heartbeat().await;
        nodes[0].raft.heartbeat().await;

        assert_eq!(nodes[0].raft.status().await.peers.len(), 3);
        assert_eq!(nodes[1].raft.status().await.peers.len(), 3);
        let status = joiner.status().await;
        assert_eq!(status.leader_id.as_deref(), Some("n1"));
        // the founding entries taught the joiner every address
        assert_eq!(status.peers.keys().cloned().collect::<Vec<_>>(), vec!["n1", "n2", "n3"]);
        assert_eq!(registry.counter_value("views").await, 7);
    }

    #[tokio::test]
    async fn test_restart_keeps_vote_and_applies_once() {
        let dir = TempDir::new().unwrap();
        let router = ClusterRouter::new();
        {
            let (log_store, store) = file_node_parts(dir.path());
            let n = node(&router, "solo", &[], log_store, store).await;
            n.raft.start().await.unwrap();
            let insert = Command::insert("k", json!("v1"), Timestamp::from_secs(0), Timestamp::END_OF_TIME).unwrap();
            n.raft.apply(insert).await.unwrap();
            n.raft.apply(Command::increment("views", "solo", 4)).await.unwrap();
            n.raft.shutdown().await;
        }

        let (log_store, store) = file_node_parts(dir.path());
        let n = node(&router, "solo", &[], log_store, store).await;
        // replay rebuilt the counter and did not duplicate the insert
        assert_eq!(n.registry.counter_value("views").await, 4);
        assert_eq!(n.store.history("k").await.len(), 1);

        // term 1 vote went to itself and survives the restart
        let (_, term) = n.raft.get_state().await;
        assert_eq!(term, 1);
        let response = n
            .raft
            .handle_request_vote(VoteRequest {
                term: 1,
                candidate_id: "other".into(),
                last_log_index: 100,
                last_log_term: 1,
            })
            .await;
        assert!(!response.vote_granted);

        n.raft.start().await.unwrap();
        assert_eq!(n.raft.get_state().await, ("leader".to_string(), 2));
        n.raft.apply(Command::increment("views", "solo", 1)).await.unwrap();
        assert_eq!(n.registry.counter_value("views").await, 5);
        assert_eq!(n.store.history("k").await.len(), 1);
        n.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_term_append_is_rejected() {
        let router = ClusterRouter::new();
        let nodes = cluster(&router).await;
        nodes[0].raft.campaign().await.unwrap();
        nodes[1].raft.campaign().await.unwrap();

        let response = nodes[2]
            .raft
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "n1".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.term, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dead_peer_does_not_stall_heartbeats() {
        let router = ClusterRouter::new();
        let ids = ["n1", "n2", "n3"];
        let mut nodes = Vec::new();
        // n3 is never started; calls to it hang longer than an election timeout
        for id in ["n1", "n2"] {
            let mut config = RaftConfig::new(id, id);
            config.tick_interval = Duration::from_millis(10);
            config.heartbeat_interval = Duration::from_millis(30);
            config.election_timeout_min = Duration::from_millis(150);
            config.election_timeout_max = Duration::from_millis(300);
            let transport = Arc::new(DeadPeer {
                inner: router.transport(id),
                dead: "n3".to_string(),
                delay: Duration::from_millis(400),
            });
            let peers = ids.iter().copied().filter(|p| *p != id).map(|p| (p, p));
            let raft = RaftNode::open(
                config,
                Membership::with_peers(id, peers),
                Box::new(InMemoryLogStore::new()),
                StateMachine::new(Arc::new(TemporalStore::in_memory()), Arc::new(CrdtRegistry::new())),
                transport,
            )
            .await
            .unwrap();
            router.register(id, &raft);
            nodes.push(raft);
        }
        for raft in &nodes {
            raft.start().await.unwrap();
        }

        let mut elected = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for raft in &nodes {
                let (role, term) = raft.get_state().await;
                if role == "leader" {
                    elected = Some((raft.node_id().to_string(), term));
                }
            }
            if elected.is_some() {
                break;
            }
        }
        let (leader, term) = elected.expect("no leader elected");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        for raft in &nodes {
            let status = raft.status().await;
            assert_eq!(status.term, term, "{} moved to a new term", raft.node_id());
            assert_eq!(status.leader_id.as_deref(), Some(leader.as_str()));
        }
        let leader_node = nodes.iter().find(|r| r.node_id() == leader).unwrap();
        let index = leader_node.apply(Command::increment("views", &leader, 1)).await.unwrap();
        assert!(index > 0);

        for raft in &nodes {
            raft.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_failed_vote_persist_leaves_state_untouched() {
        let router = ClusterRouter::new();
        let fail = Arc::new(AtomicBool::new(false));
        let log_store = Box::new(FlakyLogStore {
            inner: InMemoryLogStore::new(),
            fail: Arc::clone(&fail),
        });
        let n = node(&router, "solo", &[], log_store, Arc::new(TemporalStore::in_memory())).await;
        n.raft.start().await.unwrap();
        let before = n.raft.status().await;
        assert_eq!(before.role, Role::Leader);

        fail.store(true, Ordering::SeqCst);
        let response = n
            .raft
            .handle_request_vote(VoteRequest {
                term: 2,
                candidate_id: "other".into(),
                last_log_index: 100,
                last_log_term: 1,
            })
            .await;
        assert!(!response.vote_granted);
        assert_eq!(response.term, 1);

        let after = n.raft.status().await;
        assert_eq!(after.role, Role::Leader);
        assert_eq!(after.term, 1);
        assert_eq!(after.leader_id.as_deref(), Some("solo"));
        n.raft.shutdown().await;
    }
}
