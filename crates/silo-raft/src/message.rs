//! RPC message types exchanged between cluster members.
//!
//! Field names follow the fixed wire schema (`camelCase` on the wire) so
//! any transport that preserves message boundaries can carry them.

use crate::log::{LogEntry, LogIndex, Term};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates replies with the requests that caused them.
pub type RpcId = Uuid;

/// All messages a peer can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Vote solicitation from a candidate.
    VoteRequest(RequestVoteRequest),
    /// Reply to a vote solicitation.
    VoteReply(RequestVoteReply),
    /// Replication or heartbeat from a leader.
    AppendRequest(AppendEntriesRequest),
    /// Reply to a replication request.
    AppendReply(AppendEntriesReply),
}

impl PeerMessage {
    /// The term carried by the message.
    pub fn term(&self) -> Term {
        match self {
            PeerMessage::VoteRequest(m) => m.term,
            PeerMessage::VoteReply(m) => m.term,
            PeerMessage::AppendRequest(m) => m.term,
            PeerMessage::AppendReply(m) => m.term,
        }
    }
}

/// `RequestVote` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteRequest {
    /// Correlation id.
    pub rpc_id: RpcId,
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: u64,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

impl RequestVoteRequest {
    /// Build a vote request.
    pub fn new(term: Term, candidate_id: u64, last_log_index: LogIndex, last_log_term: Term) -> Self {
        Self {
            rpc_id: Uuid::new_v4(),
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// Reply to `RequestVote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteReply {
    /// Correlation id of the request.
    pub rpc_id: RpcId,
    /// Current term of the replying node, for the candidate to adopt.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// `AppendEntries` RPC; empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    /// Correlation id.
    pub rpc_id: RpcId,
    /// Leader's term.
    pub term: Term,
    /// The leader's id, so followers can hint redirected clients.
    pub leader_id: u64,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to replicate; empty for heartbeats.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Build a replication request.
    pub fn new(
        term: Term,
        leader_id: u64,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            rpc_id: Uuid::new_v4(),
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    /// Whether this request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reply to `AppendEntries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesReply {
    /// Correlation id of the request.
    pub rpc_id: RpcId,
    /// Current term of the replying node, for the leader to adopt.
    pub term: Term,
    /// Whether the follower's log matched at `prev_log_index`.
    pub success: bool,
}
