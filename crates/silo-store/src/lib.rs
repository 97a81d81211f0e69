#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-store** – The unified storage pool.
//!
//! One logical content-addressed blob store over heterogeneous backends
//! grouped into hot, warm and cold tiers. Writes stage the payload while
//! hashing it, land it under `<scheme>://pool/<sha-256 hex>`, and
//! deduplicate on collision; reads resolve the owning node by URI scheme.
//! RAID-1 mirrors fail over transparently and self-heal through a bounded
//! repair queue, and WORM retention locks deny deletion until expiry.

mod dedup;
mod driver;
mod manifest;
mod mirror;
mod pool;
mod worm;

pub use dedup::DedupIndex;
pub use driver::{FileDriver, MemoryDriver, StorageDriver};
pub use manifest::{Availability, BlobManifest, Compression, StorageIntent, StorageTier};
pub use mirror::{MirrorDriver, RepairWorker};
pub use pool::{PoolNode, PoolStats, UnifiedPool};
pub use worm::WormRegistry;

use silo_types::Failure;

/// Result alias for pool operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the storage pool.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing driver failed.
    #[error("driver error for '{uri}': {source}")]
    Driver {
        /// URI the operation targeted.
        uri: String,
        /// Underlying driver failure.
        #[source]
        source: anyhow::Error,
    },

    /// No blob exists at the URI.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Deletion attempted before the retention lock expired.
    #[error("worm retention forbids deleting '{uri}' until {until}")]
    WormViolation {
        /// The locked URI.
        uri: String,
        /// When the lock expires.
        until: chrono::DateTime<chrono::Utc>,
    },

    /// No mounted node serves the requested tier.
    #[error("no node mounted for tier {0:?}")]
    NoNodeForTier(StorageTier),

    /// No mounted node serves the URI's scheme.
    #[error("no node mounted for scheme of '{0}'")]
    UnknownScheme(String),

    /// The URI is not a valid pool URI.
    #[error("malformed pool uri: {0}")]
    MalformedUri(String),

    /// The durable registry layer failed.
    #[error("registry storage error: {0}")]
    Registry(#[from] silo_wal::WalError),
}

impl StoreError {
    /// Map into the host failure taxonomy.
    ///
    /// Retention violations are security failures; missing blobs are
    /// logical; everything else is a transient infrastructure fault.
    pub fn to_failure(&self) -> Failure {
        match self {
            StoreError::WormViolation { .. } => {
                Failure::security("WormViolation", self.to_string())
            }
            StoreError::NotFound(_) | StoreError::MalformedUri(_) => {
                Failure::logical("BlobNotFound", self.to_string()).with_status(404)
            }
            _ => Failure::transient("StorageUnavailable", self.to_string()),
        }
    }
}
