//! The durable deduplication index.
//!
//! Maps a content hash to the first URI that stored it, so callers can
//! pre-check before uploading. Registration is idempotent and the first
//! writer wins; later URIs for a known hash are discarded.

use silo_wal::{DurableState, WalResult};
use std::path::Path;
use tracing::debug;

/// Durable `content hash → first URI` map.
#[derive(Debug)]
pub struct DedupIndex {
    state: DurableState<String>,
}

impl DedupIndex {
    /// Open the index under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> WalResult<Self> {
        Ok(Self {
            state: DurableState::open(dir.as_ref(), "dedup").await?,
        })
    }

    /// Register `uri` for `hash`; returns the canonical URI.
    ///
    /// The first registration sticks; re-registering a known hash with a
    /// different URI returns the original.
    pub async fn register(&self, hash: &str, uri: &str) -> WalResult<String> {
        if let Some(existing) = self.state.try_get(hash) {
            if existing != uri {
                debug!(hash, uri, existing, "dedup hit, keeping first uri");
            }
            return Ok(existing);
        }
        self.state.set(hash, uri.to_string()).await?;
        Ok(uri.to_string())
    }

    /// The canonical URI for `hash`, if any.
    pub fn lookup(&self, hash: &str) -> Option<String> {
        self.state.try_get(hash)
    }

    /// Drop the entry for `hash` if it points at `uri`.
    pub async fn forget(&self, hash: &str, uri: &str) -> WalResult<()> {
        if self.state.try_get(hash).as_deref() == Some(uri) {
            self.state.remove(hash).await?;
        }
        Ok(())
    }

    /// Number of registered hashes.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_registration_wins() {
        let dir = tempdir().unwrap();
        let index = DedupIndex::open(dir.path()).await.unwrap();

        let first = index.register("abc123", "file://pool/abc123").await.unwrap();
        assert_eq!(first, "file://pool/abc123");

        // A different URI for the same hash is discarded.
        let second = index.register("abc123", "mem://pool/abc123").await.unwrap();
        assert_eq!(second, "file://pool/abc123");
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn forget_only_removes_matching_uri() {
        let dir = tempdir().unwrap();
        let index = DedupIndex::open(dir.path()).await.unwrap();
        index.register("h1", "file://pool/h1").await.unwrap();

        index.forget("h1", "mem://pool/h1").await.unwrap();
        assert!(index.lookup("h1").is_some());

        index.forget("h1", "file://pool/h1").await.unwrap();
        assert!(index.lookup("h1").is_none());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = DedupIndex::open(dir.path()).await.unwrap();
            index.register("h2", "file://pool/h2").await.unwrap();
        }
        let index = DedupIndex::open(dir.path()).await.unwrap();
        assert_eq!(index.lookup("h2").as_deref(), Some("file://pool/h2"));
    }
}
