#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-raft** – Raft consensus engine for the Silo host.
//!
//! Maintains a replicated, totally-ordered command log and applies
//! committed entries to a user-supplied state machine in strict index
//! order. The implementation follows the canonical Raft safety rules:
//! randomized elections, the log up-to-date voting check, the
//! `AppendEntries` consistency check with conflict truncation, and the
//! current-term restriction on commit advancement.
//!
//! `(current_term, voted_for)` and the log itself are persisted through
//! the host's durable state primitive before any RPC reply that depends
//! on them, so a restarted node can never double-vote or regress its log.

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use config::RaftConfig;
pub use error::{RaftError, RaftResult};
pub use log::{LogEntry, LogIndex, LogStats, RaftLog, Term};
pub use message::{
    AppendEntriesReply, AppendEntriesRequest, PeerMessage, RequestVoteReply, RequestVoteRequest,
};
pub use node::{
    NodeId, PeerReceiver, PeerSender, RaftHandle, RaftNode, StateMachine, StatusReport,
};
pub use state::{InflightWindow, LeaderVolatile, MetaStore, NodeState, RaftMeta};
