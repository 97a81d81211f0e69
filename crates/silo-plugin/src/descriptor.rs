//! Plugin descriptors and the lifecycle state machine.

use semver::Version;
use serde::{Deserialize, Serialize};

/// Reported health of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational with reduced capability.
    Degraded(String),
    /// Not operational.
    Unhealthy(String),
}

/// Everything the host knows about a plugin after its handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Stable plugin identifier; keys the host registry.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Plugin version.
    pub version: Version,
    /// Functional category, e.g. `ingest` or `indexing`.
    pub category: String,
    /// Ids of plugins that must be running before this one starts.
    pub dependencies: Vec<String>,
    /// Names of the capabilities the plugin publishes.
    pub capabilities: Vec<String>,
    /// Free-form discovery tags.
    pub semantic_tags: Vec<String>,
    /// Last reported health.
    pub health: HealthStatus,
}

/// Lifecycle states of a hosted plugin.
///
/// Transitions run strictly forward through the list; `Quarantined` is the
/// absorbing error sink reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginState {
    /// Present in the host registry, not yet handshaken.
    Discovered,
    /// Handshake in progress.
    Handshaking,
    /// Handshake complete; capabilities known but not yet published.
    Ready,
    /// Capabilities published and the run task spawned.
    Running,
    /// Stop requested; draining in-flight dispatches.
    Stopping,
    /// Run task joined; routes withdrawn.
    Stopped,
    /// Removed from the registry.
    Unloaded,
    /// Failed; no way out.
    Quarantined,
}

impl PluginState {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition(self, next: PluginState) -> bool {
        use PluginState::*;
        if self == Quarantined {
            return false;
        }
        if next == Quarantined {
            return true;
        }
        matches!(
            (self, next),
            (Discovered, Handshaking)
                | (Handshaking, Ready)
                | (Ready, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Unloaded)
        )
    }

    /// Whether the plugin is accepting dispatches.
    pub fn accepts_dispatches(self) -> bool {
        self == PluginState::Running
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PluginState::Discovered => "Discovered",
            PluginState::Handshaking => "Handshaking",
            PluginState::Ready => "Ready",
            PluginState::Running => "Running",
            PluginState::Stopping => "Stopping",
            PluginState::Stopped => "Stopped",
            PluginState::Unloaded => "Unloaded",
            PluginState::Quarantined => "Quarantined",
        };
        f.write_str(name)
    }
}
