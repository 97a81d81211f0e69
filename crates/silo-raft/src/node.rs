//! The Raft node event loop.
//!
//! One task owns the whole node: role, durable metadata, log and leader
//! bookkeeping. Peer RPCs, client commands and both timers are multiplexed
//! through a single `select!` loop, so no lock ordering exists to get
//! wrong. Metadata and log writes always hit the durable store before the
//! reply that depends on them leaves the node.

use crate::config::RaftConfig;
use crate::error::{RaftError, RaftResult};
use crate::log::{LogEntry, LogIndex, RaftLog};
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, PeerMessage, RequestVoteReply, RequestVoteRequest,
};
use crate::state::{InflightWindow, LeaderVolatile, MetaStore, NodeState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use silo_types::Clock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifier of a cluster member.
pub type NodeId = u64;

/// Outbound half of the peer transport: `(destination, message)`.
pub type PeerSender = mpsc::UnboundedSender<(NodeId, PeerMessage)>;

/// Inbound half of the peer transport: `(source, message)`.
pub type PeerReceiver = mpsc::UnboundedReceiver<(NodeId, PeerMessage)>;

/// The replicated state machine entries are applied to.
///
/// `apply` is invoked exactly once per entry, in strictly increasing index
/// order, on every node that commits the entry.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply one committed entry.
    async fn apply(&mut self, entry: &LogEntry) -> anyhow::Result<()>;
}

/// Point-in-time view of a node, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// The node's id.
    pub node_id: NodeId,
    /// Current role.
    pub state: NodeState,
    /// Current term.
    pub term: u64,
    /// Last known leader, if any.
    pub leader_hint: Option<NodeId>,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub last_applied: LogIndex,
    /// Index of the last log entry.
    pub last_log_index: LogIndex,
}

enum ClientCommand {
    Propose {
        name: String,
        command: Vec<u8>,
        reply: oneshot::Sender<RaftResult<LogIndex>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

/// Client handle onto a running node.
#[derive(Clone)]
pub struct RaftHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    clock: Arc<dyn Clock>,
    propose_timeout: Duration,
    shutdown: CancellationToken,
}

impl RaftHandle {
    /// Propose a command to the cluster.
    ///
    /// Completes with the assigned index once the entry has been applied
    /// on this node, fails with [`RaftError::NotLeader`] on a non-leader,
    /// or with [`RaftError::Timeout`] after the configured bound.
    pub async fn propose(&self, name: impl Into<String>, command: Vec<u8>) -> RaftResult<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Propose {
                name: name.into(),
                command,
                reply,
            })
            .map_err(|_| RaftError::Shutdown)?;

        tokio::select! {
            result = rx => result.map_err(|_| RaftError::Shutdown)?,
            _ = self.clock.sleep(self.propose_timeout) => Err(RaftError::Timeout),
        }
    }

    /// Fetch the node's current status.
    pub async fn status(&self) -> RaftResult<StatusReport> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Status { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Stop the node's event loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// A single cluster member.
pub struct RaftNode {
    config: RaftConfig,
    clock: Arc<dyn Clock>,
    role: NodeState,
    meta: MetaStore,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_state: Option<LeaderVolatile>,
    votes: HashSet<NodeId>,
    leader_hint: Option<NodeId>,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    outbound: PeerSender,
    inbound: PeerReceiver,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    pending: HashMap<LogIndex, oneshot::Sender<RaftResult<LogIndex>>>,
    election_deadline: DateTime<Utc>,
    heartbeat_deadline: DateTime<Utc>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Open durable state under `dir`, start the event loop, and return a
    /// client handle plus the join handle of the loop task.
    pub async fn spawn(
        config: RaftConfig,
        dir: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        state_machine: Arc<Mutex<dyn StateMachine>>,
        outbound: PeerSender,
        inbound: PeerReceiver,
    ) -> RaftResult<(RaftHandle, JoinHandle<()>)> {
        config.validate()?;

        let meta = MetaStore::open(dir.as_ref()).await?;
        let log = RaftLog::open(dir.as_ref()).await?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let handle = RaftHandle {
            commands: command_tx,
            clock: Arc::clone(&clock),
            propose_timeout: config.propose_timeout,
            shutdown: shutdown.clone(),
        };

        let now = clock.now_utc();
        let node = Self {
            election_deadline: now,
            heartbeat_deadline: now,
            role: NodeState::Follower,
            leader_state: None,
            votes: HashSet::new(),
            leader_hint: None,
            commit_index: 0,
            last_applied: 0,
            pending: HashMap::new(),
            config,
            clock,
            meta,
            log,
            state_machine,
            outbound,
            inbound,
            commands: command_rx,
            shutdown,
        };

        let join = tokio::spawn(node.run());
        Ok((handle, join))
    }

    async fn run(mut self) {
        info!(node = self.config.node_id, "raft node starting");
        self.reset_election_deadline();

        loop {
            let election_wait = self.until(self.election_deadline);
            let heartbeat_wait = self.until(self.heartbeat_deadline);
            let is_leader = self.role == NodeState::Leader;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                message = self.inbound.recv() => match message {
                    Some((from, message)) => {
                        if let Err(e) = self.handle_peer_message(from, message).await {
                            error!(node = self.config.node_id, error = %e, "peer message handling failed");
                        }
                    }
                    None => break,
                },

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.handle_client_command(command).await {
                            error!(node = self.config.node_id, error = %e, "client command handling failed");
                        }
                    }
                    None => break,
                },

                _ = self.clock.sleep(election_wait), if !is_leader => {
                    if let Err(e) = self.on_election_timeout().await {
                        error!(node = self.config.node_id, error = %e, "election handling failed");
                    }
                }

                _ = self.clock.sleep(heartbeat_wait), if is_leader => {
                    if let Err(e) = self.on_heartbeat_tick().await {
                        error!(node = self.config.node_id, error = %e, "heartbeat handling failed");
                    }
                }
            }

            if let Err(e) = self.apply_committed().await {
                error!(node = self.config.node_id, error = %e, "apply failed");
            }
        }

        info!(node = self.config.node_id, "raft node stopped");
    }

    fn until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.clock.now_utc()).to_std().unwrap_or(Duration::ZERO)
    }

    fn reset_election_deadline(&mut self) {
        let timeout = self.config.random_election_timeout();
        self.election_deadline =
            self.clock.now_utc() + chrono::Duration::from_std(timeout).expect("timeout in range");
    }

    fn arm_heartbeat(&mut self, immediate: bool) {
        let interval = if immediate {
            Duration::ZERO
        } else {
            self.config.heartbeat_interval
        };
        self.heartbeat_deadline =
            self.clock.now_utc() + chrono::Duration::from_std(interval).expect("interval in range");
    }

    //───────────────────── peer messages ─────────────────────

    async fn handle_peer_message(&mut self, from: NodeId, message: PeerMessage) -> RaftResult<()> {
        if !self.config.is_member(from) {
            warn!(node = self.config.node_id, from, "message from non-member dropped");
            return Ok(());
        }

        // A higher term demotes the receiver immediately, before the
        // message is otherwise processed. Persisted before any reply.
        if message.term() > self.meta.current_term() {
            self.meta.advance_term(message.term()).await?;
            self.become_follower(None);
        }

        match message {
            PeerMessage::VoteRequest(request) => self.on_vote_request(from, request).await,
            PeerMessage::VoteReply(reply) => self.on_vote_reply(from, reply).await,
            PeerMessage::AppendRequest(request) => self.on_append_request(from, request).await,
            PeerMessage::AppendReply(reply) => self.on_append_reply(from, reply).await,
        }
    }

    async fn on_vote_request(&mut self, from: NodeId, request: RequestVoteRequest) -> RaftResult<()> {
        let up_to_date = request.last_log_term > self.log.last_term()
            || (request.last_log_term == self.log.last_term()
                && request.last_log_index >= self.log.last_index());

        let grant = request.term == self.meta.current_term()
            && self.meta.can_vote_for(request.candidate_id)
            && up_to_date;

        if grant {
            // The vote must be durable before the candidate can count it.
            self.meta.vote_for(request.candidate_id).await?;
            self.reset_election_deadline();
        }

        debug!(
            node = self.config.node_id,
            candidate = request.candidate_id,
            term = request.term,
            grant,
            "vote request"
        );

        self.send(
            from,
            PeerMessage::VoteReply(RequestVoteReply {
                rpc_id: request.rpc_id,
                term: self.meta.current_term(),
                vote_granted: grant,
            }),
        )
    }

    async fn on_vote_reply(&mut self, from: NodeId, reply: RequestVoteReply) -> RaftResult<()> {
        if self.role != NodeState::Candidate || reply.term != self.meta.current_term() {
            return Ok(());
        }
        if !reply.vote_granted {
            return Ok(());
        }

        self.votes.insert(from);
        if self.votes.len() >= self.config.quorum_size() {
            self.become_leader().await?;
        }
        Ok(())
    }

    async fn on_append_request(
        &mut self,
        from: NodeId,
        request: AppendEntriesRequest,
    ) -> RaftResult<()> {
        if request.term < self.meta.current_term() {
            return self.send(
                from,
                PeerMessage::AppendReply(AppendEntriesReply {
                    rpc_id: request.rpc_id,
                    term: self.meta.current_term(),
                    success: false,
                }),
            );
        }

        // Same term: a current leader exists, so candidates stand down.
        if self.role != NodeState::Follower {
            self.become_follower(Some(request.leader_id));
        } else {
            self.leader_hint = Some(request.leader_id);
        }
        self.reset_election_deadline();

        // Consistency check.
        if !self.log.matches(request.prev_log_index, request.prev_log_term) {
            debug!(
                node = self.config.node_id,
                prev = request.prev_log_index,
                "log mismatch, rejecting append"
            );
            return self.send(
                from,
                PeerMessage::AppendReply(AppendEntriesReply {
                    rpc_id: request.rpc_id,
                    term: self.meta.current_term(),
                    success: false,
                }),
            );
        }

        let rpc_id = request.rpc_id;
        let last_new_entry = request.prev_log_index + request.entries.len() as u64;

        for entry in request.entries {
            if entry.index <= self.log.last_index() {
                if self.log.term_at(entry.index)? == entry.term {
                    continue; // Already replicated.
                }
                // Conflict: same index, different term. Drop the local
                // suffix and take the leader's entries.
                self.log.truncate_from(entry.index).await?;
                self.log.append(entry).await?;
            } else {
                self.log.append(entry).await?;
            }
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(last_new_entry);
        }

        self.send(
            from,
            PeerMessage::AppendReply(AppendEntriesReply {
                rpc_id,
                term: self.meta.current_term(),
                success: true,
            }),
        )
    }

    async fn on_append_reply(&mut self, from: NodeId, reply: AppendEntriesReply) -> RaftResult<()> {
        if self.role != NodeState::Leader || reply.term != self.meta.current_term() {
            return Ok(());
        }

        let Some(leader_state) = self.leader_state.as_mut() else {
            return Ok(());
        };

        if reply.success {
            if leader_state.record_success(from, reply.rpc_id).is_some() {
                self.advance_commit()?;
            }
        } else if leader_state.record_rejection(from, reply.rpc_id) {
            // Probe backwards immediately rather than waiting a tick.
            self.send_append(from)?;
        }
        Ok(())
    }

    //───────────────────── client commands ─────────────────────

    async fn handle_client_command(&mut self, command: ClientCommand) -> RaftResult<()> {
        match command {
            ClientCommand::Propose {
                name,
                command,
                reply,
            } => {
                if self.role != NodeState::Leader {
                    let _ = reply.send(Err(RaftError::NotLeader {
                        node_id: self.config.node_id,
                        leader_hint: self.leader_hint,
                    }));
                    return Ok(());
                }

                let index = self.log.last_index() + 1;
                let entry = LogEntry::new(
                    index,
                    self.meta.current_term(),
                    name,
                    command,
                    self.clock.now_utc(),
                );
                // Local append is durable before replication fans out.
                self.log.append(entry).await?;
                self.pending.insert(index, reply);

                debug!(node = self.config.node_id, index, "proposal appended");
                self.broadcast_append()?;
                // A single-node cluster commits on its own quorum.
                self.advance_commit()?;
            }
            ClientCommand::Status { reply } => {
                let _ = reply.send(StatusReport {
                    node_id: self.config.node_id,
                    state: self.role,
                    term: self.meta.current_term(),
                    leader_hint: self.leader_hint,
                    commit_index: self.commit_index,
                    last_applied: self.last_applied,
                    last_log_index: self.log.last_index(),
                });
            }
        }
        Ok(())
    }

    //───────────────────── timers ─────────────────────

    async fn on_election_timeout(&mut self) -> RaftResult<()> {
        if self.role == NodeState::Leader {
            return Ok(());
        }
        if self.clock.now_utc() < self.election_deadline {
            return Ok(()); // Re-armed by a message since the sleep began.
        }

        // Term bump and self-vote are durable before any solicitation.
        let term = self.meta.begin_election(self.config.node_id).await?;
        self.role = NodeState::Candidate;
        self.leader_hint = None;
        self.votes = HashSet::from([self.config.node_id]);
        self.reset_election_deadline();

        info!(node = self.config.node_id, term, "election started");

        if self.votes.len() >= self.config.quorum_size() {
            return self.become_leader().await;
        }

        let request = RequestVoteRequest::new(
            term,
            self.config.node_id,
            self.log.last_index(),
            self.log.last_term(),
        );
        for &peer in &self.config.peers.clone() {
            self.send(peer, PeerMessage::VoteRequest(request.clone()))?;
        }
        Ok(())
    }

    async fn on_heartbeat_tick(&mut self) -> RaftResult<()> {
        if self.role != NodeState::Leader {
            return Ok(());
        }
        self.broadcast_append()
    }

    //───────────────────── role transitions ─────────────────────

    fn become_follower(&mut self, leader_hint: Option<NodeId>) {
        let was_leader = self.role == NodeState::Leader;
        self.role = NodeState::Follower;
        self.leader_state = None;
        self.votes.clear();
        self.leader_hint = leader_hint;
        self.reset_election_deadline();

        if was_leader {
            // Whoever wins the new term decides these entries' fate;
            // clients must re-propose against the new leader.
            for (_, reply) in self.pending.drain() {
                let _ = reply.send(Err(RaftError::NotLeader {
                    node_id: self.config.node_id,
                    leader_hint: self.leader_hint,
                }));
            }
        }
    }

    async fn become_leader(&mut self) -> RaftResult<()> {
        self.role = NodeState::Leader;
        self.leader_hint = Some(self.config.node_id);
        self.leader_state = Some(LeaderVolatile::new(&self.config.peers, self.log.last_index()));
        info!(
            node = self.config.node_id,
            term = self.meta.current_term(),
            "became leader"
        );

        // Immediate empty heartbeat asserts leadership.
        self.broadcast_append()?;
        Ok(())
    }

    //───────────────────── replication ─────────────────────

    fn broadcast_append(&mut self) -> RaftResult<()> {
        self.arm_heartbeat(false);
        for peer in self.config.peers.clone() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    fn send_append(&mut self, peer: NodeId) -> RaftResult<()> {
        let Some(leader_state) = self.leader_state.as_mut() else {
            return Ok(());
        };

        let next = leader_state.next_index.get(&peer).copied().unwrap_or(1);
        let prev = next.saturating_sub(1);
        let prev_term = self.log.term_at(prev)?;
        let entries = self
            .log
            .entries_from(next, self.config.max_entries_per_request);

        let request = AppendEntriesRequest::new(
            self.meta.current_term(),
            self.config.node_id,
            prev,
            prev_term,
            entries,
            self.commit_index,
        );
        leader_state.inflight.insert(
            peer,
            InflightWindow {
                rpc_id: request.rpc_id,
                prev,
                count: request.entries.len(),
            },
        );

        self.send(peer, PeerMessage::AppendRequest(request))
    }

    /// Advance the commit index to the largest quorum-replicated index
    /// whose entry is from the current term.
    fn advance_commit(&mut self) -> RaftResult<()> {
        let Some(leader_state) = self.leader_state.as_ref() else {
            return Ok(());
        };

        if let Some(n) = leader_state.quorum_match(
            self.commit_index,
            self.log.last_index(),
            self.config.quorum_size(),
        ) {
            // Entries from earlier terms only commit transitively; this is
            // the guard against the figure-8 anomaly.
            if self.log.term_at(n)? == self.meta.current_term() {
                debug!(node = self.config.node_id, commit = n, "commit index advanced");
                self.commit_index = n;
            }
        }
        Ok(())
    }

    //───────────────────── application ─────────────────────

    async fn apply_committed(&mut self) -> RaftResult<()> {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = self
                .log
                .entry(next)
                .cloned()
                .ok_or(RaftError::LogEntryNotFound { index: next })?;

            {
                let mut machine = self.state_machine.lock().await;
                if let Err(e) = machine.apply(&entry).await {
                    // Leave last_applied untouched; the entry retries on
                    // the next pass rather than being skipped.
                    error!(node = self.config.node_id, index = next, error = %e, "state machine apply failed");
                    return Ok(());
                }
            }

            self.last_applied = next;
            if let Some(reply) = self.pending.remove(&next) {
                let _ = reply.send(Ok(next));
            }
        }
        Ok(())
    }

    fn send(&self, to: NodeId, message: PeerMessage) -> RaftResult<()> {
        // Transport failures are logged and retried by the next tick; the
        // node never tears down because a peer is unreachable.
        if self.outbound.send((to, message)).is_err() {
            warn!(node = self.config.node_id, to, "peer transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::SystemClock;
    use tempfile::tempdir;

    pub(crate) struct RecordingMachine {
        pub applied: Arc<std::sync::Mutex<Vec<(LogIndex, String)>>>,
    }

    #[async_trait]
    impl StateMachine for RecordingMachine {
        async fn apply(&mut self, entry: &LogEntry) -> anyhow::Result<()> {
            self.applied
                .lock()
                .unwrap()
                .push((entry.index, String::from_utf8_lossy(&entry.command).to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_node_cluster_commits_its_own_proposals() {
        let dir = tempdir().unwrap();
        let applied = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (outbound, _sink) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound) = mpsc::unbounded_channel();

        let config = RaftConfig::new(1, vec![]).with_election_timeout(
            Duration::from_millis(50),
            Duration::from_millis(100),
        );
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..config
        };

        let (handle, join) = RaftNode::spawn(
            config,
            dir.path(),
            Arc::new(SystemClock),
            Arc::new(Mutex::new(RecordingMachine {
                applied: Arc::clone(&applied),
            })),
            outbound,
            inbound,
        )
        .await
        .unwrap();

        // Wait for the self-election.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = handle.status().await.unwrap();
            if status.state == NodeState::Leader {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no self-election");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let index = handle.propose("set", b"x=1".to_vec()).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(
            applied.lock().unwrap().as_slice(),
            &[(1, "x=1".to_string())]
        );

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn followers_reject_proposals_with_a_hint() {
        let dir = tempdir().unwrap();
        let (outbound, _sink) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound) = mpsc::unbounded_channel();

        // Long election timeout keeps the node a follower for the test.
        let config = RaftConfig::new(1, vec![2, 3])
            .with_election_timeout(Duration::from_secs(5), Duration::from_secs(10));

        let (handle, join) = RaftNode::spawn(
            config,
            dir.path(),
            Arc::new(SystemClock),
            Arc::new(Mutex::new(RecordingMachine {
                applied: Arc::new(std::sync::Mutex::new(Vec::new())),
            })),
            outbound,
            inbound,
        )
        .await
        .unwrap();

        let err = handle.propose("set", b"x=1".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_initial_follower_state() {
        let dir = tempdir().unwrap();
        let (outbound, _sink) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound) = mpsc::unbounded_channel();

        let config = RaftConfig::new(7, vec![8, 9])
            .with_election_timeout(Duration::from_secs(5), Duration::from_secs(10));
        let (handle, join) = RaftNode::spawn(
            config,
            dir.path(),
            Arc::new(SystemClock),
            Arc::new(Mutex::new(RecordingMachine {
                applied: Arc::new(std::sync::Mutex::new(Vec::new())),
            })),
            outbound,
            inbound,
        )
        .await
        .unwrap();

        let status = handle.status().await.unwrap();
        assert_eq!(status.node_id, 7);
        assert_eq!(status.state, NodeState::Follower);
        assert_eq!(status.term, 0);
        assert_eq!(status.commit_index, 0);

        handle.shutdown();
        join.await.unwrap();
    }
}
