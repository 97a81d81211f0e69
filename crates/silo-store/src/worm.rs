//! Write-once-read-many retention locks.
//!
//! A locked blob cannot be deleted before its expiry, and relocking may
//! only push the expiry further out, never pull it in.

use crate::{StoreError, StoreResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use silo_types::Clock;
use silo_wal::{DurableState, WalResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Durable registry of retention locks, keyed by blob URI.
pub struct WormRegistry {
    state: DurableState<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl WormRegistry {
    /// Open the registry under `dir`.
    pub async fn open(dir: impl AsRef<Path>, clock: Arc<dyn Clock>) -> WalResult<Self> {
        Ok(Self {
            state: DurableState::open(dir.as_ref(), "worm").await?,
            clock,
        })
    }

    /// Lock `uri` for `retention` from now.
    ///
    /// When a lock already exists, the later of the two expiries wins: a
    /// retention window can be extended but never shortened.
    pub async fn lock_blob(&self, uri: &str, retention: Duration) -> StoreResult<DateTime<Utc>> {
        let proposed = self.clock.now_utc()
            + ChronoDuration::from_std(retention).expect("retention out of range");

        let effective = match self.state.try_get(uri) {
            Some(existing) if existing >= proposed => {
                debug!(uri, %existing, %proposed, "keeping longer retention");
                existing
            }
            _ => {
                self.state.set(uri, proposed).await?;
                proposed
            }
        };
        Ok(effective)
    }

    /// The active expiry for `uri`, if any.
    pub fn expiry(&self, uri: &str) -> Option<DateTime<Utc>> {
        self.state.try_get(uri)
    }

    /// Enforce retention on an access: deletions of a locked blob fail
    /// with [`StoreError::WormViolation`] until the expiry passes.
    pub fn assert_access(&self, uri: &str, is_delete: bool) -> StoreResult<()> {
        if !is_delete {
            return Ok(());
        }
        match self.state.try_get(uri) {
            Some(until) if self.clock.now_utc() < until => Err(StoreError::WormViolation {
                uri: uri.to_string(),
                until,
            }),
            _ => Ok(()),
        }
    }
}
