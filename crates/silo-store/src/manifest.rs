//! Blob manifests, tiers and write intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Storage tier a blob currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageTier {
    /// Low latency, highest cost.
    Hot,
    /// The default middle ground.
    Warm,
    /// Archival, geo-redundant backends.
    Cold,
}

/// Compression preference declared by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// Store verbatim.
    None,
    /// Balanced ratio and speed.
    Balanced,
    /// Best ratio, slowest.
    Maximum,
}

/// Availability requirement declared by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    /// A single replica suffices.
    Single,
    /// Replicated within the zone.
    ZoneRedundant,
    /// Replicated across regions.
    GeoRedundant,
}

/// What the writer wants from the pool; decides the target tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageIntent {
    /// Compression preference.
    pub compression: Compression,
    /// Availability requirement.
    pub availability: Availability,
}

impl StorageIntent {
    /// The tier this intent lands in: verbatim single-replica data is
    /// hot, geo-redundant data is cold, everything else is warm.
    pub fn target_tier(&self) -> StorageTier {
        match (self.compression, self.availability) {
            (Compression::None, Availability::Single) => StorageTier::Hot,
            (_, Availability::GeoRedundant) => StorageTier::Cold,
            _ => StorageTier::Warm,
        }
    }
}

impl Default for StorageIntent {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            availability: Availability::Single,
        }
    }
}

/// Metadata record describing one stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobManifest {
    /// Manifest id.
    pub id: Uuid,
    /// Logical container the blob belongs to.
    pub container_id: String,
    /// Content-addressed URI of the blob.
    pub blob_uri: String,
    /// Owning principal.
    pub owner_id: String,
    /// When the blob was written.
    pub created_at: DateTime<Utc>,
    /// Last read access.
    pub last_accessed_at: DateTime<Utc>,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// Tier the blob currently lives in.
    pub current_tier: StorageTier,
    /// Lowercase hex SHA-256 of the payload.
    pub content_hash: String,
    /// Retention lock expiry, when WORM-locked.
    pub worm_expires_at: Option<DateTime<Utc>>,
}

impl BlobManifest {
    /// Build a manifest for a freshly written blob.
    pub fn new(
        container_id: impl Into<String>,
        owner_id: impl Into<String>,
        blob_uri: impl Into<String>,
        content_hash: impl Into<String>,
        size_bytes: u64,
        tier: StorageTier,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            container_id: container_id.into(),
            blob_uri: blob_uri.into(),
            owner_id: owner_id.into(),
            created_at: now,
            last_accessed_at: now,
            size_bytes,
            current_tier: tier,
            content_hash: content_hash.into(),
            worm_expires_at: None,
        }
    }

    /// Record a read access.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_tier_mapping() {
        let hot = StorageIntent {
            compression: Compression::None,
            availability: Availability::Single,
        };
        assert_eq!(hot.target_tier(), StorageTier::Hot);

        let cold = StorageIntent {
            compression: Compression::None,
            availability: Availability::GeoRedundant,
        };
        assert_eq!(cold.target_tier(), StorageTier::Cold);

        let warm = StorageIntent {
            compression: Compression::Balanced,
            availability: Availability::Single,
        };
        assert_eq!(warm.target_tier(), StorageTier::Warm);

        let warm_zone = StorageIntent {
            compression: Compression::None,
            availability: Availability::ZoneRedundant,
        };
        assert_eq!(warm_zone.target_tier(), StorageTier::Warm);
    }
}
