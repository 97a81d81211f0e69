//! Configuration for a Raft node.

use crate::error::{RaftError, RaftResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Unique identifier of this node.
    pub node_id: u64,

    /// Peer node ids (excluding this node).
    pub peers: Vec<u64>,

    /// Interval between leader heartbeats. Must be well below the minimum
    /// election timeout.
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,

    /// Maximum entries shipped in one `AppendEntries` request.
    pub max_entries_per_request: usize,

    /// Deadline applied to each outbound RPC by the transport.
    pub rpc_deadline: Duration,

    /// How long a proposal handle waits for its entry to apply before
    /// failing with a timeout.
    pub propose_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: vec![],
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_entries_per_request: 64,
            rpc_deadline: Duration::from_millis(500),
            propose_timeout: Duration::from_secs(3),
        }
    }
}

impl RaftConfig {
    /// Create a configuration with the default timers.
    pub fn new(node_id: u64, peers: Vec<u64>) -> Self {
        Self {
            node_id,
            peers,
            ..Default::default()
        }
    }

    /// Override the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Override the election timeout range.
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Override the proposal timeout.
    pub fn with_propose_timeout(mut self, timeout: Duration) -> Self {
        self.propose_timeout = timeout;
        self
    }

    /// Validate timer and membership constraints.
    pub fn validate(&self) -> RaftResult<()> {
        if self.node_id == 0 {
            return Err(RaftError::configuration("node id cannot be zero"));
        }
        if self.peers.contains(&self.node_id) {
            return Err(RaftError::configuration(
                "peer list cannot contain the node's own id",
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::configuration(
                "heartbeat interval must be strictly below the minimum election timeout",
            ));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::configuration(
                "election timeout minimum must be below the maximum",
            ));
        }
        if self.max_entries_per_request == 0 {
            return Err(RaftError::configuration(
                "max entries per request cannot be zero",
            ));
        }
        Ok(())
    }

    /// Cluster size including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the cluster.
    pub fn quorum_size(&self) -> usize {
        (self.cluster_size() / 2) + 1
    }

    /// Whether `node_id` belongs to the cluster.
    pub fn is_member(&self, node_id: u64) -> bool {
        node_id == self.node_id || self.peers.contains(&node_id)
    }

    /// A fresh election timeout drawn uniformly from the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = RaftConfig::new(1, vec![2, 3]);
        assert!(config.validate().is_ok());

        config.node_id = 0;
        assert!(config.validate().is_err());

        config.node_id = 1;
        config.peers = vec![1, 2];
        assert!(config.validate().is_err());

        let slow_heartbeat = RaftConfig {
            heartbeat_interval: Duration::from_millis(400),
            ..RaftConfig::new(1, vec![2, 3])
        };
        assert!(slow_heartbeat.validate().is_err());
    }

    #[test]
    fn quorum_arithmetic() {
        assert_eq!(RaftConfig::new(1, vec![2, 3]).quorum_size(), 2);
        assert_eq!(RaftConfig::new(1, vec![2, 3, 4, 5]).quorum_size(), 3);
        assert_eq!(RaftConfig::new(1, vec![]).quorum_size(), 1);
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let config = RaftConfig::new(1, vec![2, 3]);
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
