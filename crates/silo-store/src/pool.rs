//! The unified pool: tier selection, content-addressed writes, dedup,
//! migration and retention enforcement over a fixed set of nodes.

use crate::dedup::DedupIndex;
use crate::driver::StorageDriver;
use crate::manifest::{StorageIntent, StorageTier};
use crate::worm::WormRegistry;
use crate::{StoreError, StoreResult};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use silo_types::Clock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// One mounted backend.
pub struct PoolNode {
    /// Stable node identifier; the deterministic tie-break for placement.
    pub id: String,
    /// Tier the node serves.
    pub tier: StorageTier,
    /// The backing driver.
    pub driver: Arc<dyn StorageDriver>,
    /// Advertised capacity in bytes.
    pub capacity_bytes: u64,
    used_bytes: AtomicU64,
}

impl PoolNode {
    /// Describe a backend to mount.
    pub fn new(
        id: impl Into<String>,
        tier: StorageTier,
        driver: Arc<dyn StorageDriver>,
        capacity_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            tier,
            driver,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
        }
    }

    /// Bytes still free on the node.
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes
            .saturating_sub(self.used_bytes.load(Ordering::Relaxed))
    }

    /// Bytes accounted as used.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

/// Aggregate statistics over the mounted nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Registered content hashes.
    pub unique_blobs: usize,
    /// Used bytes per node id.
    pub used_by_node: Vec<(String, u64)>,
}

/// The unified content-addressed store.
///
/// The node list is fixed at mount time and read-only afterwards, so no
/// lock guards it.
pub struct UnifiedPool {
    nodes: Vec<Arc<PoolNode>>,
    dedup: DedupIndex,
    worm: WormRegistry,
    clock: Arc<dyn Clock>,
}

impl UnifiedPool {
    /// Mount a pool over `nodes`, with durable registries under `dir`.
    pub async fn mount(
        dir: impl AsRef<Path>,
        nodes: Vec<PoolNode>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let dedup = DedupIndex::open(dir.as_ref()).await?;
        let worm = WormRegistry::open(dir.as_ref(), Arc::clone(&clock)).await?;
        info!(nodes = nodes.len(), "storage pool mounted");
        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            dedup,
            worm,
            clock,
        })
    }

    /// Write a blob and return its content-addressed URI.
    ///
    /// The payload streams to a staging URI while the SHA-256 runs; if the
    /// final URI already exists on the chosen node the staging copy is
    /// discarded (deduplication), otherwise it is promoted. Writing the
    /// same bytes twice therefore yields the same URI and one stored copy.
    pub async fn write(&self, data: Bytes, intent: StorageIntent) -> StoreResult<String> {
        let tier = intent.target_tier();
        let node = self.pick_node(tier)?;
        let scheme = node.driver.scheme();

        let staging_uri = format!("{scheme}://pool/staging/{}", Uuid::new_v4());
        node.driver
            .save(&staging_uri, data.clone())
            .await
            .map_err(|source| StoreError::Driver {
                uri: staging_uri.clone(),
                source,
            })?;

        let mut hasher = Sha256::new();
        for chunk in data.chunks(64 * 1024) {
            hasher.update(chunk);
        }
        let hash = hex_digest(hasher);
        let final_uri = format!("{scheme}://pool/{hash}");

        let already_stored = node
            .driver
            .exists(&final_uri)
            .await
            .map_err(|source| StoreError::Driver {
                uri: final_uri.clone(),
                source,
            })?;

        if already_stored {
            debug!(uri = %final_uri, node = %node.id, "dedup hit, dropping staging copy");
            node.driver
                .delete(&staging_uri)
                .await
                .map_err(|source| StoreError::Driver {
                    uri: staging_uri.clone(),
                    source,
                })?;
        } else {
            // Promote staging to the final address. The staging copy holds
            // the same bytes, so a plain save-then-delete is equivalent to
            // a rename on drivers without one.
            node.driver
                .save(&final_uri, data.clone())
                .await
                .map_err(|source| StoreError::Driver {
                    uri: final_uri.clone(),
                    source,
                })?;
            node.driver
                .delete(&staging_uri)
                .await
                .map_err(|source| StoreError::Driver {
                    uri: staging_uri.clone(),
                    source,
                })?;
            node.used_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        }

        self.dedup.register(&hash, &final_uri).await?;
        Ok(final_uri)
    }

    /// Read a blob by URI.
    pub async fn read(&self, uri: &str) -> StoreResult<Bytes> {
        let node = self.node_for_uri(uri)?;
        node.driver
            .load(uri)
            .await
            .map_err(|_| StoreError::NotFound(uri.to_string()))
    }

    /// Whether the pool holds a blob at `uri`.
    pub async fn exists(&self, uri: &str) -> StoreResult<bool> {
        let node = self.node_for_uri(uri)?;
        node.driver
            .exists(uri)
            .await
            .map_err(|source| StoreError::Driver {
                uri: uri.to_string(),
                source,
            })
    }

    /// Delete a blob, honouring any retention lock.
    pub async fn delete(&self, uri: &str) -> StoreResult<()> {
        self.worm.assert_access(uri, true)?;
        let node = self.node_for_uri(uri)?;

        let data_len = match node.driver.load(uri).await {
            Ok(data) => data.len() as u64,
            Err(_) => 0,
        };
        node.driver
            .delete(uri)
            .await
            .map_err(|source| StoreError::Driver {
                uri: uri.to_string(),
                source,
            })?;
        node.used_bytes
            .fetch_sub(data_len.min(node.used_bytes()), Ordering::Relaxed);

        if let Some(hash) = content_hash_of(uri) {
            self.dedup.forget(hash, uri).await?;
        }
        Ok(())
    }

    /// Move a blob to another tier, preserving its content address.
    ///
    /// Copies first, verifies the copy exists, then deletes the source. A
    /// failure before the delete leaves both copies in place, which is
    /// safe to retry.
    pub async fn move_to_tier(&self, uri: &str, target_tier: StorageTier) -> StoreResult<String> {
        let source = self.node_for_uri(uri)?;
        let target = self.pick_node(target_tier)?;
        if source.id == target.id {
            return Ok(uri.to_string());
        }

        let hash = content_hash_of(uri)
            .ok_or_else(|| StoreError::MalformedUri(uri.to_string()))?
            .to_string();
        let target_uri = format!("{}://pool/{hash}", target.driver.scheme());

        let data = source
            .driver
            .load(uri)
            .await
            .map_err(|_| StoreError::NotFound(uri.to_string()))?;
        target
            .driver
            .save(&target_uri, data.clone())
            .await
            .map_err(|source| StoreError::Driver {
                uri: target_uri.clone(),
                source,
            })?;

        let landed = target
            .driver
            .exists(&target_uri)
            .await
            .map_err(|source| StoreError::Driver {
                uri: target_uri.clone(),
                source,
            })?;
        if !landed {
            return Err(StoreError::NotFound(target_uri));
        }

        source
            .driver
            .delete(uri)
            .await
            .map_err(|source| StoreError::Driver {
                uri: uri.to_string(),
                source,
            })?;
        target
            .used_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        source
            .used_bytes
            .fetch_sub((data.len() as u64).min(source.used_bytes()), Ordering::Relaxed);

        debug!(from = %uri, to = %target_uri, "blob migrated");
        Ok(target_uri)
    }

    /// Lock a blob against deletion for `retention` from now.
    pub async fn lock_blob(
        &self,
        uri: &str,
        retention: Duration,
    ) -> StoreResult<chrono::DateTime<chrono::Utc>> {
        self.worm.lock_blob(uri, retention).await
    }

    /// The canonical URI already storing `hash`, for upload pre-checks.
    pub fn lookup_hash(&self, hash: &str) -> Option<String> {
        self.dedup.lookup(hash)
    }

    /// Aggregate pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            unique_blobs: self.dedup.len(),
            used_by_node: self
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.used_bytes()))
                .collect(),
        }
    }

    /// The clock the pool was mounted with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn pick_node(&self, tier: StorageTier) -> StoreResult<&Arc<PoolNode>> {
        self.nodes
            .iter()
            .filter(|n| n.tier == tier)
            .min_by(|a, b| {
                b.free_bytes()
                    .cmp(&a.free_bytes())
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or(StoreError::NoNodeForTier(tier))
    }

    fn node_for_uri(&self, uri: &str) -> StoreResult<&Arc<PoolNode>> {
        let scheme = uri
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| StoreError::MalformedUri(uri.to_string()))?;
        self.nodes
            .iter()
            .find(|n| n.driver.scheme() == scheme)
            .ok_or_else(|| StoreError::UnknownScheme(uri.to_string()))
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The 64-hex-char content hash suffix of a pool URI, if well-formed.
fn content_hash_of(uri: &str) -> Option<&str> {
    let (_, path) = uri.split_once("://")?;
    let hash = path.strip_prefix("pool/")?;
    (hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
        .then_some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{FileDriver, MemoryDriver};
    use crate::manifest::{Availability, Compression};
    use silo_types::{ManualClock, SystemClock};
    use tempfile::tempdir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn hot_intent() -> StorageIntent {
        StorageIntent {
            compression: Compression::None,
            availability: Availability::Single,
        }
    }

    #[tokio::test]
    async fn writing_the_same_bytes_twice_stores_one_copy() {
        let registry_dir = tempdir().unwrap();
        let blob_dir = tempdir().unwrap();
        let driver = Arc::new(FileDriver::new(blob_dir.path()));
        let pool = UnifiedPool::mount(
            registry_dir.path(),
            vec![PoolNode::new(
                "hot-1",
                StorageTier::Hot,
                Arc::clone(&driver) as Arc<dyn StorageDriver>,
                1 << 30,
            )],
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        let first = pool
            .write(Bytes::from_static(b"hello"), hot_intent())
            .await
            .unwrap();
        let second = pool
            .write(Bytes::from_static(b"hello"), hot_intent())
            .await
            .unwrap();

        assert_eq!(first, format!("file://pool/{HELLO_SHA256}"));
        assert_eq!(first, second);
        assert_eq!(driver.object_count(), 1, "dedup must keep one copy");
        assert_eq!(pool.stats().unique_blobs, 1);

        let data = pool.read(&first).await.unwrap();
        assert_eq!(data, "hello");
    }

    #[tokio::test]
    async fn intent_routes_to_the_right_tier() {
        let registry_dir = tempdir().unwrap();
        let hot = Arc::new(MemoryDriver::new("hot"));
        let cold = Arc::new(MemoryDriver::new("cold"));
        let pool = UnifiedPool::mount(
            registry_dir.path(),
            vec![
                PoolNode::new(
                    "hot-1",
                    StorageTier::Hot,
                    Arc::clone(&hot) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
                PoolNode::new(
                    "cold-1",
                    StorageTier::Cold,
                    Arc::clone(&cold) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
            ],
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        let hot_uri = pool
            .write(Bytes::from_static(b"fast"), hot_intent())
            .await
            .unwrap();
        assert!(hot_uri.starts_with("hot://pool/"));

        let cold_uri = pool
            .write(
                Bytes::from_static(b"archive"),
                StorageIntent {
                    compression: Compression::Balanced,
                    availability: Availability::GeoRedundant,
                },
            )
            .await
            .unwrap();
        assert!(cold_uri.starts_with("cold://pool/"));

        let err = pool
            .write(
                Bytes::from_static(b"mid"),
                StorageIntent {
                    compression: Compression::Balanced,
                    availability: Availability::Single,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoNodeForTier(StorageTier::Warm)));
    }

    #[tokio::test]
    async fn placement_prefers_free_space_then_node_id() {
        let registry_dir = tempdir().unwrap();
        let small = Arc::new(MemoryDriver::new("small"));
        let large = Arc::new(MemoryDriver::new("large"));
        let pool = UnifiedPool::mount(
            registry_dir.path(),
            vec![
                PoolNode::new(
                    "hot-b",
                    StorageTier::Hot,
                    Arc::clone(&small) as Arc<dyn StorageDriver>,
                    1 << 10,
                ),
                PoolNode::new(
                    "hot-a",
                    StorageTier::Hot,
                    Arc::clone(&large) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
            ],
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        let uri = pool
            .write(Bytes::from_static(b"payload"), hot_intent())
            .await
            .unwrap();
        assert!(uri.starts_with("large://"), "most free space wins: {uri}");

        // Equal free space: the smaller node id is the deterministic pick.
        let registry_dir2 = tempdir().unwrap();
        let a = Arc::new(MemoryDriver::new("aa"));
        let b = Arc::new(MemoryDriver::new("bb"));
        let pool2 = UnifiedPool::mount(
            registry_dir2.path(),
            vec![
                PoolNode::new(
                    "hot-b",
                    StorageTier::Hot,
                    Arc::clone(&b) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
                PoolNode::new(
                    "hot-a",
                    StorageTier::Hot,
                    Arc::clone(&a) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
            ],
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        let uri = pool2
            .write(Bytes::from_static(b"payload"), hot_intent())
            .await
            .unwrap();
        assert!(uri.starts_with("aa://"), "tie breaks by node id: {uri}");
    }

    #[tokio::test]
    async fn migration_preserves_the_content_suffix() {
        let registry_dir = tempdir().unwrap();
        let hot = Arc::new(MemoryDriver::new("hot"));
        let cold = Arc::new(MemoryDriver::new("cold"));
        let pool = UnifiedPool::mount(
            registry_dir.path(),
            vec![
                PoolNode::new(
                    "hot-1",
                    StorageTier::Hot,
                    Arc::clone(&hot) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
                PoolNode::new(
                    "cold-1",
                    StorageTier::Cold,
                    Arc::clone(&cold) as Arc<dyn StorageDriver>,
                    1 << 20,
                ),
            ],
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        let uri = pool
            .write(Bytes::from_static(b"hello"), hot_intent())
            .await
            .unwrap();
        let migrated = pool.move_to_tier(&uri, StorageTier::Cold).await.unwrap();

        assert_eq!(migrated, format!("cold://pool/{HELLO_SHA256}"));
        assert_eq!(hot.object_count(), 0, "source copy deleted after verify");
        assert_eq!(pool.read(&migrated).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn worm_locked_blobs_refuse_deletion_until_expiry() {
        let registry_dir = tempdir().unwrap();
        let clock = ManualClock::new(chrono::Utc::now());
        let driver = Arc::new(MemoryDriver::new("mem"));
        let pool = UnifiedPool::mount(
            registry_dir.path(),
            vec![PoolNode::new(
                "hot-1",
                StorageTier::Hot,
                Arc::clone(&driver) as Arc<dyn StorageDriver>,
                1 << 20,
            )],
            clock.clone(),
        )
        .await
        .unwrap();

        let uri = pool
            .write(Bytes::from_static(b"keep me"), hot_intent())
            .await
            .unwrap();
        pool.lock_blob(&uri, Duration::from_secs(30 * 24 * 3600))
            .await
            .unwrap();
        // A shorter relock must not shorten the retention.
        pool.lock_blob(&uri, Duration::from_secs(5 * 24 * 3600))
            .await
            .unwrap();

        let err = pool.delete(&uri).await.unwrap_err();
        assert!(matches!(err, StoreError::WormViolation { .. }));
        assert!(pool.exists(&uri).await.unwrap());

        clock.advance(Duration::from_secs(31 * 24 * 3600));
        pool.delete(&uri).await.unwrap();
        assert!(!pool.exists(&uri).await.unwrap());
    }

    #[tokio::test]
    async fn hash_lookup_supports_upload_prechecks() {
        let registry_dir = tempdir().unwrap();
        let driver = Arc::new(MemoryDriver::new("mem"));
        let pool = UnifiedPool::mount(
            registry_dir.path(),
            vec![PoolNode::new(
                "hot-1",
                StorageTier::Hot,
                Arc::clone(&driver) as Arc<dyn StorageDriver>,
                1 << 20,
            )],
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        assert!(pool.lookup_hash(HELLO_SHA256).is_none());
        let uri = pool
            .write(Bytes::from_static(b"hello"), hot_intent())
            .await
            .unwrap();
        assert_eq!(pool.lookup_hash(HELLO_SHA256), Some(uri));
    }
}
