//! Error types for the consensus engine.

use silo_types::Failure;
use thiserror::Error;

/// Result alias for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors raised by the consensus engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RaftError {
    /// This node is not the leader; proposals must go to the hinted node.
    #[error("node {node_id} is not the leader (known leader: {leader_hint:?})")]
    NotLeader {
        /// The rejecting node.
        node_id: u64,
        /// Last known leader, if any.
        leader_hint: Option<u64>,
    },

    /// A proposal was not applied before its deadline.
    #[error("proposal timed out waiting for commit")]
    Timeout,

    /// The log has no entry at the requested index.
    #[error("log entry not found at index {index}")]
    LogEntryNotFound {
        /// The missing index.
        index: u64,
    },

    /// Durable state could not be read or written.
    #[error("storage error: {message}")]
    Storage {
        /// Failure detail.
        message: String,
    },

    /// Configuration rejected at startup.
    #[error("configuration error: {message}")]
    Configuration {
        /// Failure detail.
        message: String,
    },

    /// The node's event loop has shut down.
    #[error("raft node is shut down")]
    Shutdown,

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal {
        /// Failure detail.
        message: String,
    },
}

impl RaftError {
    /// Build a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        RaftError::Storage {
            message: message.into(),
        }
    }

    /// Build a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        RaftError::Configuration {
            message: message.into(),
        }
    }

    /// Build an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        RaftError::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may usefully retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaftError::Timeout | RaftError::Shutdown)
    }

    /// Map into the host failure taxonomy.
    ///
    /// Proposal timeouts are transient and retried by callers; a
    /// `NotLeader` rejection is a logical redirect, not a retryable fault.
    pub fn to_failure(&self) -> Failure {
        match self {
            RaftError::Timeout => Failure::transient("Timeout", self.to_string()),
            RaftError::Shutdown => Failure::transient("RaftShutdown", self.to_string()),
            RaftError::NotLeader { .. } => Failure::logical("NotLeader", self.to_string()),
            RaftError::LogEntryNotFound { .. } | RaftError::Configuration { .. } => {
                Failure::logical("RaftRequest", self.to_string())
            }
            RaftError::Storage { .. } | RaftError::Internal { .. } => {
                Failure::system("RaftInternal", self.to_string())
            }
        }
    }
}

impl From<silo_wal::WalError> for RaftError {
    fn from(err: silo_wal::WalError) -> Self {
        RaftError::storage(err.to_string())
    }
}
