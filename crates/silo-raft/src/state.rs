//! Node role, durable metadata and leader-side volatile state.

use crate::error::RaftResult;
use crate::log::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use silo_wal::DurableState;
use std::collections::HashMap;
use std::path::Path;

/// Role of a node within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Accepts replication and vote requests.
    Follower,
    /// Soliciting votes for a new term.
    Candidate,
    /// Replicating its log to the cluster.
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Follower => "Follower",
            NodeState::Candidate => "Candidate",
            NodeState::Leader => "Leader",
        };
        f.write_str(name)
    }
}

/// The metadata that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMeta {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate voted for in `current_term`, if any.
    pub voted_for: Option<u64>,
}

const META_KEY: &str = "meta";

/// Durable store for [`RaftMeta`].
///
/// Every mutation is written through before the caller proceeds, so no
/// vote or term acknowledgement can outrun its persistence.
#[derive(Debug)]
pub struct MetaStore {
    state: DurableState<RaftMeta>,
    cached: RaftMeta,
}

impl MetaStore {
    /// Open the metadata record under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let state: DurableState<RaftMeta> = DurableState::open(dir.as_ref(), "raft-meta").await?;
        let cached = state.try_get(META_KEY).unwrap_or_default();
        Ok(Self { state, cached })
    }

    /// Current term.
    pub fn current_term(&self) -> Term {
        self.cached.current_term
    }

    /// Vote cast in the current term.
    pub fn voted_for(&self) -> Option<u64> {
        self.cached.voted_for
    }

    /// Adopt a higher term, clearing the vote. Durable before return.
    pub async fn advance_term(&mut self, term: Term) -> RaftResult<()> {
        debug_assert!(term > self.cached.current_term);
        self.write(RaftMeta {
            current_term: term,
            voted_for: None,
        })
        .await
    }

    /// Record a vote for `candidate` in the current term. Durable before
    /// return.
    pub async fn vote_for(&mut self, candidate: u64) -> RaftResult<()> {
        let term = self.cached.current_term;
        self.write(RaftMeta {
            current_term: term,
            voted_for: Some(candidate),
        })
        .await
    }

    /// Start a new election term voting for ourselves. Durable before
    /// return.
    pub async fn begin_election(&mut self, node_id: u64) -> RaftResult<Term> {
        let term = self.cached.current_term + 1;
        self.write(RaftMeta {
            current_term: term,
            voted_for: Some(node_id),
        })
        .await?;
        Ok(term)
    }

    /// Whether this node may grant a vote to `candidate` in the current
    /// term.
    pub fn can_vote_for(&self, candidate: u64) -> bool {
        match self.cached.voted_for {
            Some(voted) => voted == candidate,
            None => true,
        }
    }

    async fn write(&mut self, meta: RaftMeta) -> RaftResult<()> {
        self.state.set(META_KEY, meta.clone()).await?;
        self.cached = meta;
        Ok(())
    }
}

/// The replication window shipped in one outstanding `AppendEntries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightWindow {
    /// Correlation id of the request.
    pub rpc_id: uuid::Uuid,
    /// `prev_log_index` of the request.
    pub prev: LogIndex,
    /// Number of entries shipped.
    pub count: usize,
}

/// Per-peer replication bookkeeping, reinitialized on election.
#[derive(Debug, Clone)]
pub struct LeaderVolatile {
    /// Next log index to send to each peer.
    pub next_index: HashMap<u64, LogIndex>,
    /// Highest index known replicated on each peer.
    pub match_index: HashMap<u64, LogIndex>,
    /// Outstanding request window per peer; replies must match its rpc id
    /// or they are stale and ignored.
    pub inflight: HashMap<u64, InflightWindow>,
}

impl LeaderVolatile {
    /// Fresh bookkeeping for a newly elected leader.
    pub fn new(peers: &[u64], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
        }
        Self {
            next_index,
            match_index,
            inflight: HashMap::new(),
        }
    }

    /// Record a success reply: everything shipped in the correlated
    /// request is now matched. Stale replies return `None`.
    pub fn record_success(&mut self, peer: u64, rpc_id: uuid::Uuid) -> Option<LogIndex> {
        let window = *self.inflight.get(&peer)?;
        if window.rpc_id != rpc_id {
            return None;
        }
        self.inflight.remove(&peer);
        let matched = window.prev + window.count as u64;
        self.match_index.insert(peer, matched);
        self.next_index.insert(peer, matched + 1);
        Some(matched)
    }

    /// Record a consistency-check rejection: probe one index back.
    /// Stale replies are ignored.
    pub fn record_rejection(&mut self, peer: u64, rpc_id: uuid::Uuid) -> bool {
        match self.inflight.get(&peer) {
            Some(window) if window.rpc_id == rpc_id => {}
            _ => return false,
        }
        self.inflight.remove(&peer);
        let next = self.next_index.get(&peer).copied().unwrap_or(1);
        self.next_index.insert(peer, next.saturating_sub(1).max(1));
        true
    }

    /// The largest index replicated on a quorum, counting the leader.
    ///
    /// Returns `None` when no index beyond `commit_index` has quorum.
    pub fn quorum_match(
        &self,
        commit_index: LogIndex,
        last_log_index: LogIndex,
        quorum: usize,
    ) -> Option<LogIndex> {
        let mut candidate = None;
        for n in (commit_index + 1)..=last_log_index {
            let replicas = 1 + self
                .match_index
                .values()
                .filter(|&&matched| matched >= n)
                .count();
            if replicas >= quorum {
                candidate = Some(n);
            }
        }
        candidate
    }
}
