//! RAID-1 mirrored driver with background self-heal.
//!
//! Writes land on the primary synchronously and on the secondary
//! best-effort. Reads try the primary and fail over to the secondary,
//! enqueueing the URI on a bounded repair queue. The repair worker drains
//! the queue, copies from whichever side is healthy, and backs off
//! exponentially on repeated failure.

use crate::driver::StorageDriver;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use silo_types::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How many repair requests may queue before new ones are dropped.
const REPAIR_QUEUE_DEPTH: usize = 256;

/// Attempts per repair request before it is abandoned.
const REPAIR_MAX_ATTEMPTS: u32 = 5;

/// Mirrored pair of drivers presented as one.
pub struct MirrorDriver {
    scheme: String,
    primary: Arc<dyn StorageDriver>,
    secondary: Arc<dyn StorageDriver>,
    repair_tx: mpsc::Sender<String>,
}

impl MirrorDriver {
    /// Build a mirror and the worker that heals it.
    ///
    /// The caller owns the worker: spawn [`RepairWorker::run`] on its task
    /// pool and cancel it on unmount.
    pub fn new(
        scheme: impl Into<String>,
        primary: Arc<dyn StorageDriver>,
        secondary: Arc<dyn StorageDriver>,
        clock: Arc<dyn Clock>,
    ) -> (Self, RepairWorker) {
        let (repair_tx, repair_rx) = mpsc::channel(REPAIR_QUEUE_DEPTH);
        let driver = Self {
            scheme: scheme.into(),
            primary: Arc::clone(&primary),
            secondary: Arc::clone(&secondary),
            repair_tx,
        };
        let worker = RepairWorker {
            rx: repair_rx,
            primary,
            secondary,
            clock,
            base_backoff: Duration::from_millis(50),
        };
        (driver, worker)
    }

    fn request_repair(&self, uri: &str) {
        // A full queue drops the request; the next failed read re-files it.
        if self.repair_tx.try_send(uri.to_string()).is_err() {
            warn!(uri, "repair queue full, dropping request");
        }
    }

    fn rewrite(&self, uri: &str, side: &Arc<dyn StorageDriver>) -> String {
        // The mirror facade owns the public scheme; each side addresses
        // the same path under its own scheme.
        match uri.split_once("://") {
            Some((_, path)) => format!("{}://{path}", side.scheme()),
            None => uri.to_string(),
        }
    }
}

#[async_trait]
impl StorageDriver for MirrorDriver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn save(&self, uri: &str, data: Bytes) -> Result<()> {
        self.primary
            .save(&self.rewrite(uri, &self.primary), data.clone())
            .await?;

        if let Err(error) = self
            .secondary
            .save(&self.rewrite(uri, &self.secondary), data)
            .await
        {
            warn!(uri, %error, "secondary write failed, scheduling repair");
            self.request_repair(uri);
        }
        Ok(())
    }

    async fn load(&self, uri: &str) -> Result<Bytes> {
        match self.primary.load(&self.rewrite(uri, &self.primary)).await {
            Ok(data) => Ok(data),
            Err(primary_error) => {
                warn!(uri, %primary_error, "primary read failed, failing over");
                let data = self
                    .secondary
                    .load(&self.rewrite(uri, &self.secondary))
                    .await?;
                self.request_repair(uri);
                Ok(data)
            }
        }
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        self.primary
            .delete(&self.rewrite(uri, &self.primary))
            .await?;
        if let Err(error) = self
            .secondary
            .delete(&self.rewrite(uri, &self.secondary))
            .await
        {
            warn!(uri, %error, "secondary delete failed");
        }
        Ok(())
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        if self.primary.exists(&self.rewrite(uri, &self.primary)).await? {
            return Ok(true);
        }
        self.secondary
            .exists(&self.rewrite(uri, &self.secondary))
            .await
    }
}

/// Drains the mirror repair queue.
pub struct RepairWorker {
    rx: mpsc::Receiver<String>,
    primary: Arc<dyn StorageDriver>,
    secondary: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    base_backoff: Duration,
}

impl RepairWorker {
    /// Run until cancelled, repairing one URI at a time.
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let uri = tokio::select! {
                _ = token.cancelled() => break,
                uri = self.rx.recv() => match uri {
                    Some(uri) => uri,
                    None => break,
                },
            };

            for attempt in 0..REPAIR_MAX_ATTEMPTS {
                match self.repair_once(&uri).await {
                    Ok(()) => {
                        debug!(uri, "mirror repaired");
                        break;
                    }
                    Err(error) if attempt + 1 == REPAIR_MAX_ATTEMPTS => {
                        error!(uri, %error, "mirror repair abandoned");
                    }
                    Err(error) => {
                        let backoff = self.base_backoff * 2u32.pow(attempt);
                        warn!(uri, %error, ?backoff, "mirror repair failed, backing off");
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = self.clock.sleep(backoff) => {}
                        }
                    }
                }
            }
        }
    }

    fn side_uri(side: &Arc<dyn StorageDriver>, uri: &str) -> String {
        match uri.split_once("://") {
            Some((_, path)) => format!("{}://{path}", side.scheme()),
            None => uri.to_string(),
        }
    }

    async fn repair_once(&self, uri: &str) -> Result<()> {
        let primary_uri = Self::side_uri(&self.primary, uri);
        let secondary_uri = Self::side_uri(&self.secondary, uri);

        let on_primary = self.primary.exists(&primary_uri).await.unwrap_or(false);
        let on_secondary = self.secondary.exists(&secondary_uri).await.unwrap_or(false);

        match (on_primary, on_secondary) {
            (true, true) => Ok(()),
            (true, false) => {
                let data = self.primary.load(&primary_uri).await?;
                self.secondary.save(&secondary_uri, data).await
            }
            (false, true) => {
                let data = self.secondary.load(&secondary_uri).await?;
                self.primary.save(&primary_uri, data).await
            }
            (false, false) => Err(anyhow!("blob missing on both mirror sides: {uri}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use silo_types::SystemClock;

    /// Memory driver that fails reads while `broken` is set.
    struct FlakyDriver {
        inner: MemoryDriver,
        broken: std::sync::atomic::AtomicBool,
    }

    impl FlakyDriver {
        fn new(scheme: &str) -> Self {
            Self {
                inner: MemoryDriver::new(scheme),
                broken: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn set_broken(&self, broken: bool) {
            self.broken.store(broken, std::sync::atomic::Ordering::SeqCst);
        }

        fn is_broken(&self) -> bool {
            self.broken.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StorageDriver for FlakyDriver {
        fn scheme(&self) -> &str {
            self.inner.scheme()
        }

        async fn save(&self, uri: &str, data: Bytes) -> Result<()> {
            if self.is_broken() {
                return Err(anyhow!("disk offline"));
            }
            self.inner.save(uri, data).await
        }

        async fn load(&self, uri: &str) -> Result<Bytes> {
            if self.is_broken() {
                return Err(anyhow!("disk offline"));
            }
            self.inner.load(uri).await
        }

        async fn delete(&self, uri: &str) -> Result<()> {
            self.inner.delete(uri).await
        }

        async fn exists(&self, uri: &str) -> Result<bool> {
            if self.is_broken() {
                return Ok(false);
            }
            self.inner.exists(uri).await
        }
    }

    #[tokio::test]
    async fn writes_land_on_both_sides() {
        let primary = Arc::new(MemoryDriver::new("a"));
        let secondary = Arc::new(MemoryDriver::new("b"));
        let (mirror, _worker) = MirrorDriver::new(
            "mirror",
            Arc::clone(&primary) as Arc<dyn StorageDriver>,
            Arc::clone(&secondary) as Arc<dyn StorageDriver>,
            Arc::new(SystemClock),
        );

        mirror
            .save("mirror://pool/h1", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(primary.object_count(), 1);
        assert_eq!(secondary.object_count(), 1);
        assert_eq!(mirror.load("mirror://pool/h1").await.unwrap(), "data");
    }

    #[tokio::test]
    async fn reads_fail_over_and_self_heal() {
        let primary = Arc::new(FlakyDriver::new("a"));
        let secondary = Arc::new(MemoryDriver::new("b"));
        let (mirror, worker) = MirrorDriver::new(
            "mirror",
            Arc::clone(&primary) as Arc<dyn StorageDriver>,
            Arc::clone(&secondary) as Arc<dyn StorageDriver>,
            Arc::new(SystemClock),
        );

        let token = CancellationToken::new();
        let worker_task = tokio::spawn(worker.run(token.clone()));

        primary.set_broken(true);
        // The primary write fails outright while broken, so seed the
        // secondary and read through the mirror.
        secondary
            .save("b://pool/h2", Bytes::from_static(b"survivor"))
            .await
            .unwrap();

        let data = mirror.load("mirror://pool/h2").await.unwrap();
        assert_eq!(data, "survivor");

        // Heal the disk; the repair worker copies the blob back.
        primary.set_broken(false);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if primary.inner.exists("a://pool/h2").await.unwrap() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "repair never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        worker_task.await.unwrap();
    }

    #[tokio::test]
    async fn secondary_write_failure_is_tolerated() {
        let primary = Arc::new(MemoryDriver::new("a"));
        let secondary = Arc::new(FlakyDriver::new("b"));
        secondary.set_broken(true);
        let (mirror, _worker) = MirrorDriver::new(
            "mirror",
            Arc::clone(&primary) as Arc<dyn StorageDriver>,
            Arc::clone(&secondary) as Arc<dyn StorageDriver>,
            Arc::new(SystemClock),
        );

        mirror
            .save("mirror://pool/h3", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(primary.object_count(), 1);
    }
}
