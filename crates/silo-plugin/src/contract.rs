//! The contract every hosted plugin implements.

use crate::host::Capability;
use async_trait::async_trait;
use semver::Version;
use silo_types::Event;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Protocol version the host speaks during the handshake.
///
/// Plugins offering a different major version are rejected before any of
/// their capabilities publish.
pub static PROTOCOL_VERSION: Version = Version::new(1, 0, 0);

/// Mode the host is running in, disclosed to plugins at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    /// Normal operation.
    Normal,
    /// Reduced-capability maintenance window.
    Maintenance,
}

/// What the host sends to a plugin at load time.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Protocol version the host speaks.
    pub protocol_version: Version,
    /// Directory the plugin may use for its own files.
    pub root_path: PathBuf,
    /// Host mode.
    pub mode: HostMode,
}

/// What a plugin answers.
pub enum HandshakeResponse {
    /// The plugin is compatible and discloses its identity.
    Success {
        /// Stable plugin id.
        id: String,
        /// Human-readable name.
        name: String,
        /// Plugin version.
        version: Version,
        /// Protocol version the plugin speaks.
        protocol_version: Version,
        /// Functional category.
        category: String,
        /// Capabilities to publish on the bus, all-or-nothing.
        capabilities: Vec<Capability>,
        /// Ids of plugins that must run before this one.
        dependencies: Vec<String>,
    },
    /// The plugin declines to load.
    Failure {
        /// Why the plugin declined.
        reason: String,
    },
}

impl std::fmt::Debug for HandshakeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeResponse::Success {
                id,
                version,
                capabilities,
                dependencies,
                ..
            } => f
                .debug_struct("Success")
                .field("id", id)
                .field("version", version)
                .field("capabilities", &capabilities.len())
                .field("dependencies", dependencies)
                .finish_non_exhaustive(),
            HandshakeResponse::Failure { reason } => {
                f.debug_struct("Failure").field("reason", reason).finish()
            }
        }
    }
}

/// A hosted feature plugin.
///
/// Plugins own their state exclusively; they are reachable only through
/// the host registry, never through each other.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Validate compatibility and disclose identity plus capabilities.
    async fn handshake(&self, request: HandshakeRequest) -> HandshakeResponse;

    /// Run the plugin until the token fires. The host owns the spawned
    /// task and joins it on stop; plugins must not leak background tasks
    /// past cancellation.
    async fn start(&self, token: CancellationToken) -> anyhow::Result<()>;

    /// Release every handle the plugin holds. Runs after the run task has
    /// been joined; must not rely on drop-time cleanup.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Health gate between capability registration and start. A failure
    /// rolls the registrations back and unloads the plugin.
    async fn verify(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Optional asynchronous notification of host events.
    async fn on_message(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}
