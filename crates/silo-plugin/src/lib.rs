#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-plugin** – The plugin host.
//!
//! The host owns every feature plugin in the process: it performs the
//! handshake, registers the plugin's capabilities with the bus as one
//! atomic unit, starts plugins in topological order of their declared
//! dependencies, and stops them with a bounded drain. Plugins never hold
//! references to each other; they hold ids and consult the host registry,
//! so no ownership cycles exist.

mod contract;
mod dependency;
mod descriptor;
mod host;
mod policy;

pub use contract::{
    HandshakeRequest, HandshakeResponse, HostMode, Plugin, PROTOCOL_VERSION,
};
pub use dependency::resolve_start_order;
pub use descriptor::{HealthStatus, PluginDescriptor, PluginState};
pub use host::{Capability, HostConfig, PluginEvent, PluginHost};
pub use policy::AclRoutePolicy;

/// Result alias for host operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors raised by the plugin host.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A declared dependency is unknown or not ready, or the graph has a
    /// cycle.
    #[error("unresolved dependency for plugin '{plugin}': {detail}")]
    UnresolvedDependency {
        /// Plugin whose dependencies could not be satisfied.
        plugin: String,
        /// Missing dependency or cycle description.
        detail: String,
    },

    /// The plugin declined the handshake.
    #[error("handshake rejected by plugin: {reason}")]
    HandshakeRejected {
        /// Reason returned by the plugin.
        reason: String,
    },

    /// The plugin speaks an incompatible protocol major version.
    #[error("protocol mismatch: host speaks {host}, plugin '{plugin}' offered {offered}")]
    ProtocolMismatch {
        /// Host protocol version.
        host: semver::Version,
        /// Plugin id.
        plugin: String,
        /// Version offered by the plugin.
        offered: semver::Version,
    },

    /// A lifecycle transition was requested out of order.
    #[error("invalid lifecycle transition for '{plugin}': {from} -> {to}")]
    InvalidTransition {
        /// Plugin id.
        plugin: String,
        /// Current state.
        from: PluginState,
        /// Requested state.
        to: PluginState,
    },

    /// No plugin with that id is registered.
    #[error("unknown plugin '{0}'")]
    Unknown(String),

    /// A plugin with that id is already installed.
    #[error("plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    /// The verify health gate rejected the plugin after registration.
    #[error("verification failed for plugin '{plugin}': {reason}")]
    VerifyFailed {
        /// Plugin id.
        plugin: String,
        /// Failure detail from the plugin.
        reason: String,
    },

    /// The plugin's own start or stop hook failed.
    #[error("plugin '{plugin}' lifecycle hook failed: {source}")]
    Lifecycle {
        /// Plugin id.
        plugin: String,
        /// Underlying error.
        #[source]
        source: anyhow::Error,
    },
}
