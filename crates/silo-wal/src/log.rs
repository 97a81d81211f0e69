//! The append-only write-ahead log file.
//!
//! Records are line-framed: `SET|<key>|<base64 value>\n` or `DEL|<key>\n`.
//! Keys are percent-escaped so the separator and line terminator never
//! appear raw. Replay is tolerant: the first undecodable record ends the
//! replay, treating everything from it onward as a torn tail.

use crate::{WalError, WalResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Key was set to the given value bytes.
    Set {
        /// The record's key.
        key: String,
        /// Serialized value bytes.
        value: Vec<u8>,
    },
    /// Key was removed.
    Del {
        /// The record's key.
        key: String,
    },
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_key(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hi = chars.next()?;
        let lo = chars.next()?;
        let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
        out.push(byte as char);
    }
    Some(out)
}

impl WalRecord {
    fn encode(&self) -> String {
        match self {
            WalRecord::Set { key, value } => {
                format!("SET|{}|{}\n", escape_key(key), BASE64.encode(value))
            }
            WalRecord::Del { key } => format!("DEL|{}\n", escape_key(key)),
        }
    }

    fn decode(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, '|');
        match parts.next()? {
            "SET" => {
                let key = unescape_key(parts.next()?)?;
                let value = BASE64.decode(parts.next()?).ok()?;
                Some(WalRecord::Set { key, value })
            }
            "DEL" => {
                let key = unescape_key(parts.next()?)?;
                if parts.next().is_some() {
                    return None;
                }
                Some(WalRecord::Del { key })
            }
            _ => None,
        }
    }
}

/// Handle on the open log file; appends are fsynced before returning.
#[derive(Debug)]
pub struct DurableLog {
    path: PathBuf,
    file: File,
}

impl DurableLog {
    /// Open the log at `path` for appending, creating it if absent.
    pub async fn open(path: impl Into<PathBuf>) -> WalResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    /// Append one record and fsync before returning.
    pub async fn append(&mut self, record: &WalRecord) -> WalResult<()> {
        self.file.write_all(record.encode().as_bytes()).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Discard every record; called after a successful snapshot rename.
    pub async fn truncate(&mut self) -> WalResult<()> {
        self.file.set_len(0).await?;
        self.file.sync_all().await?;
        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log at `path` in append order.
    ///
    /// Stops at the first undecodable record: a crash mid-append leaves a
    /// torn tail, and everything after the tear is unacknowledged work.
    pub async fn replay(path: &Path) -> WalResult<Vec<WalRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read(path).await?;
        let text = String::from_utf8_lossy(&raw);

        let mut records = Vec::new();
        let mut rest = text.as_ref();
        while let Some(newline) = rest.find('\n') {
            let line = &rest[..newline];
            rest = &rest[newline + 1..];
            match WalRecord::decode(line) {
                Some(record) => records.push(record),
                None => {
                    warn!(path = %path.display(), dropped = line.len(), "undecodable wal record, treating remainder as torn tail");
                    return Ok(records);
                }
            }
        }
        if !rest.is_empty() {
            // A record without its terminator is a torn append.
            warn!(path = %path.display(), dropped = rest.len(), "dropping unterminated wal tail");
        }
        Ok(records)
    }
}

/// Encode a serde value for a `SET` record.
pub(crate) fn encode_value<V: serde::Serialize>(value: &V) -> WalResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| WalError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_and_replay_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut log = DurableLog::open(&path).await.unwrap();
        log.append(&WalRecord::Set {
            key: "alpha".into(),
            value: b"1".to_vec(),
        })
        .await
        .unwrap();
        log.append(&WalRecord::Del { key: "alpha".into() })
            .await
            .unwrap();

        let records = DurableLog::replay(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], WalRecord::Del { key: "alpha".into() });
    }

    #[tokio::test]
    async fn keys_with_separators_survive_framing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let key = "weird|key\nwith%stuff";

        let mut log = DurableLog::open(&path).await.unwrap();
        log.append(&WalRecord::Set {
            key: key.into(),
            value: b"v".to_vec(),
        })
        .await
        .unwrap();

        let records = DurableLog::replay(&path).await.unwrap();
        assert_eq!(
            records,
            vec![WalRecord::Set {
                key: key.into(),
                value: b"v".to_vec()
            }]
        );
    }

    #[tokio::test]
    async fn torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut log = DurableLog::open(&path).await.unwrap();
        log.append(&WalRecord::Set {
            key: "a".into(),
            value: b"1".to_vec(),
        })
        .await
        .unwrap();
        drop(log);

        // Simulate a crash mid-append: an unterminated half record.
        let mut raw = tokio::fs::read(&path).await.unwrap();
        raw.extend_from_slice(b"SET|b|aGVsb");
        tokio::fs::write(&path, &raw).await.unwrap();

        let records = DurableLog::replay(&path).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn garbage_record_ends_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        tokio::fs::write(&path, b"SET|a|MQ==\nNOPE\nSET|b|Mg==\n")
            .await
            .unwrap();

        let records = DurableLog::replay(&path).await.unwrap();
        // Only the prefix before the garbage line survives.
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn truncate_empties_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut log = DurableLog::open(&path).await.unwrap();
        log.append(&WalRecord::Del { key: "x".into() }).await.unwrap();
        log.truncate().await.unwrap();

        assert!(DurableLog::replay(&path).await.unwrap().is_empty());
    }
}
