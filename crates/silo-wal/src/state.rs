//! The durable key/value map built on [`DurableLog`].
//!
//! Writers are serialized by an internal mutex and fsync the log record
//! before the in-memory map changes. Readers never block on writers: they
//! clone an `Arc` snapshot of the map reference. A snapshot serializes the
//! map to `<name>.state.tmp`, fsyncs, renames over `<name>.state` and only
//! then truncates the log, so a crash at any point loses nothing.

use crate::log::{encode_value, DurableLog, WalRecord};
use crate::{WalError, WalResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Crash-consistent mapping from string keys to values of type `V`.
#[derive(Debug)]
pub struct DurableState<V> {
    name: String,
    state_path: PathBuf,
    map: RwLock<Arc<HashMap<String, V>>>,
    writer: tokio::sync::Mutex<Writer>,
}

#[derive(Debug)]
struct Writer {
    log: DurableLog,
    records_since_snapshot: usize,
}

impl<V> DurableState<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Open (or create) the named state under `dir` and recover it.
    ///
    /// Recovery loads `<name>.state` when present, then replays
    /// `<name>.wal` in append order. Undecodable snapshot or record values
    /// are logged and skipped; recovery never aborts the process.
    pub async fn open(dir: impl Into<PathBuf>, name: &str) -> WalResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let state_path = dir.join(format!("{name}.state"));
        let wal_path = dir.join(format!("{name}.wal"));

        let mut map: HashMap<String, V> = if state_path.exists() {
            let raw = tokio::fs::read(&state_path).await?;
            match serde_json::from_slice(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!(name, error = %e, "snapshot undecodable, recovering from wal only");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let records = DurableLog::replay(&wal_path).await?;
        let replayed = records.len();
        for record in records {
            match record {
                WalRecord::Set { key, value } => match serde_json::from_slice(&value) {
                    Ok(v) => {
                        map.insert(key, v);
                    }
                    Err(e) => {
                        warn!(name, key, error = %e, "skipping wal value that no longer decodes");
                    }
                },
                WalRecord::Del { key } => {
                    map.remove(&key);
                }
            }
        }
        debug!(name, entries = map.len(), replayed, "durable state recovered");

        let log = DurableLog::open(&wal_path).await?;
        Ok(Self {
            name: name.to_string(),
            state_path,
            map: RwLock::new(Arc::new(map)),
            writer: tokio::sync::Mutex::new(Writer {
                log,
                records_since_snapshot: replayed,
            }),
        })
    }

    /// Fetch a value. Never blocks on writers.
    pub fn try_get(&self, key: &str) -> Option<V> {
        self.reader_snapshot().get(key).cloned()
    }

    /// Whether the key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.reader_snapshot().contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.reader_snapshot().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A stable snapshot of the whole map for scan-style readers.
    pub fn reader_snapshot(&self) -> Arc<HashMap<String, V>> {
        Arc::clone(&self.map.read().expect("state map lock poisoned"))
    }

    /// Set `key` to `value`, durable before return.
    pub async fn set(&self, key: impl Into<String>, value: V) -> WalResult<()> {
        let key = key.into();
        let bytes = encode_value(&value)?;
        let mut writer = self.writer.lock().await;
        writer
            .log
            .append(&WalRecord::Set {
                key: key.clone(),
                value: bytes,
            })
            .await?;
        writer.records_since_snapshot += 1;
        self.mutate_map(|m| {
            m.insert(key, value);
        });
        Ok(())
    }

    /// Remove `key`, durable before return.
    pub async fn remove(&self, key: &str) -> WalResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .log
            .append(&WalRecord::Del { key: key.to_string() })
            .await?;
        writer.records_since_snapshot += 1;
        self.mutate_map(|m| {
            m.remove(key);
        });
        Ok(())
    }

    /// Serialize the map to disk and truncate the log.
    ///
    /// Idempotent: a no-op when nothing was written since the last
    /// snapshot. A failure before the rename leaves the previous snapshot
    /// and the full log intact.
    pub async fn snapshot(&self) -> WalResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.records_since_snapshot == 0 {
            return Ok(());
        }

        let map = self.reader_snapshot();
        let bytes =
            serde_json::to_vec(map.as_ref()).map_err(|e| WalError::Encode(e.to_string()))?;

        let tmp_path = self.state_path.with_extension("state.tmp");
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.state_path).await?;
        writer.log.truncate().await?;
        writer.records_since_snapshot = 0;
        debug!(name = %self.name, entries = map.len(), "snapshot written");
        Ok(())
    }

    fn mutate_map(&self, f: impl FnOnce(&mut HashMap<String, V>)) {
        let mut guard = self.map.write().expect("state map lock poisoned");
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}
