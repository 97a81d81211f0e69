//! The storage driver contract and the two built-in drivers.
//!
//! Production backends (object stores, network volumes) live outside the
//! core and implement the same trait; the memory and local-file drivers
//! here are what tier nodes and tests mount.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One storage backend addressed by a URI scheme.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// URI scheme this driver serves, e.g. `file` or `mem`.
    fn scheme(&self) -> &str;

    /// Persist `data` at `uri`, overwriting any previous blob.
    async fn save(&self, uri: &str, data: Bytes) -> Result<()>;

    /// Load the blob at `uri`.
    async fn load(&self, uri: &str) -> Result<Bytes>;

    /// Remove the blob at `uri`; missing blobs are not an error.
    async fn delete(&self, uri: &str) -> Result<()>;

    /// Whether a blob exists at `uri`.
    async fn exists(&self, uri: &str) -> Result<bool>;
}

/// Strip `<scheme>://` and return the path portion of a pool URI.
pub(crate) fn uri_path<'a>(scheme: &str, uri: &'a str) -> Result<&'a str> {
    let prefix = format!("{scheme}://");
    uri.strip_prefix(&prefix)
        .ok_or_else(|| anyhow!("uri '{uri}' does not match scheme '{scheme}'"))
}

//─────────────────────────────
//  In-memory driver
//─────────────────────────────

/// Driver holding blobs in process memory; used by tests and hot tiers
/// that trade durability for latency.
#[derive(Debug)]
pub struct MemoryDriver {
    scheme: String,
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryDriver {
    /// Create a driver serving `scheme`.
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored blobs.
    pub fn object_count(&self) -> usize {
        self.blobs.lock().expect("blob lock poisoned").len()
    }

    /// Total stored bytes.
    pub fn total_bytes(&self) -> usize {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .values()
            .map(Bytes::len)
            .sum()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn save(&self, uri: &str, data: Bytes) -> Result<()> {
        uri_path(&self.scheme, uri)?;
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .insert(uri.to_string(), data);
        Ok(())
    }

    async fn load(&self, uri: &str) -> Result<Bytes> {
        self.blobs
            .lock()
            .expect("blob lock poisoned")
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow!("blob not found: {uri}"))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.blobs.lock().expect("blob lock poisoned").remove(uri);
        Ok(())
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self
            .blobs
            .lock()
            .expect("blob lock poisoned")
            .contains_key(uri))
    }
}

//─────────────────────────────
//  Local-file driver
//─────────────────────────────

/// Driver storing blobs as files under a root directory.
///
/// The URI path maps directly onto the directory layout, so a pool URI
/// `file://pool/<hash>` lands at `<root>/pool/<hash>`.
#[derive(Debug)]
pub struct FileDriver {
    scheme: String,
    root: PathBuf,
}

impl FileDriver {
    /// Create a driver rooted at `root`, serving the `file` scheme.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_scheme("file", root)
    }

    /// Create a driver with an explicit scheme, for multi-volume mounts.
    pub fn with_scheme(scheme: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            scheme: scheme.into(),
            root: root.into(),
        }
    }

    fn blob_path(&self, uri: &str) -> Result<PathBuf> {
        let path = uri_path(&self.scheme, uri)?;
        // Content-addressed paths never traverse upwards; reject anything
        // that tries.
        if path.split('/').any(|segment| segment == "..") {
            return Err(anyhow!("uri '{uri}' escapes the driver root"));
        }
        Ok(self.root.join(path))
    }

    /// Number of blobs currently stored under the root.
    pub fn object_count(&self) -> usize {
        fn walk(dir: &Path, count: &mut usize) {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path, count);
                    } else {
                        *count += 1;
                    }
                }
            }
        }
        let mut count = 0;
        walk(&self.root, &mut count);
        count
    }
}

#[async_trait]
impl StorageDriver for FileDriver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn save(&self, uri: &str, data: Bytes) -> Result<()> {
        let path = self.blob_path(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, uri: &str) -> Result<Bytes> {
        let path = self.blob_path(uri)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let path = self.blob_path(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!(e).context(format!("deleting {}", path.display()))),
        }
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.blob_path(uri)?.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_driver_round_trip() {
        let driver = MemoryDriver::new("mem");
        driver
            .save("mem://pool/abc", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert!(driver.exists("mem://pool/abc").await.unwrap());
        assert_eq!(driver.load("mem://pool/abc").await.unwrap(), "data");
        assert_eq!(driver.object_count(), 1);

        driver.delete("mem://pool/abc").await.unwrap();
        assert!(!driver.exists("mem://pool/abc").await.unwrap());
        assert!(driver.load("mem://pool/abc").await.is_err());
    }

    #[tokio::test]
    async fn file_driver_round_trip() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path());

        driver
            .save("file://pool/deadbeef", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(driver.exists("file://pool/deadbeef").await.unwrap());
        assert_eq!(driver.load("file://pool/deadbeef").await.unwrap(), "payload");
        assert_eq!(driver.object_count(), 1);

        // Deleting twice is fine.
        driver.delete("file://pool/deadbeef").await.unwrap();
        driver.delete("file://pool/deadbeef").await.unwrap();
        assert_eq!(driver.object_count(), 0);
    }

    #[tokio::test]
    async fn file_driver_rejects_escaping_uris() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path());
        assert!(driver
            .save("file://pool/../../etc/passwd", Bytes::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn wrong_scheme_is_rejected() {
        let driver = MemoryDriver::new("mem");
        assert!(driver
            .save("file://pool/abc", Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
