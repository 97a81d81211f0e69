//! The replicated command log.
//!
//! Entries live in memory for fast access and are written through to the
//! durable store on append, keyed by zero-padded index so recovery can
//! rebuild the sequence. Truncation removes both the in-memory suffix and
//! the durable records before returning.

use crate::error::{RaftError, RaftResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use silo_wal::DurableState;
use std::path::Path;
use tracing::warn;

/// Index of a log entry; the log starts at 1.
pub type LogIndex = u64;

/// Raft term number.
pub type Term = u64;

/// One replicated command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Position in the log.
    pub index: LogIndex,
    /// Term the entry was created in.
    pub term: Term,
    /// Logical command name, used by state machines for routing.
    pub name: String,
    /// Opaque command bytes.
    pub command: Vec<u8>,
    /// Wall-clock creation time on the proposing leader.
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    /// Create a command entry.
    pub fn new(
        index: LogIndex,
        term: Term,
        name: impl Into<String>,
        command: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            index,
            term,
            name: name.into(),
            command,
            created_at,
        }
    }
}

/// Snapshot of log positions for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStats {
    /// Number of entries held.
    pub total_entries: usize,
    /// Index of the last entry (0 when empty).
    pub last_index: LogIndex,
    /// Term of the last entry (0 when empty).
    pub last_term: Term,
}

fn store_key(index: LogIndex) -> String {
    format!("{index:020}")
}

/// The durable, in-memory-indexed log.
#[derive(Debug)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    store: DurableState<LogEntry>,
}

impl RaftLog {
    /// Open (or create) the log under `dir` and recover its entries.
    ///
    /// Recovery sorts the durable records by index and keeps the longest
    /// contiguous run starting at 1; anything after a gap is dropped with
    /// a warning, since it can only be debris from an interrupted
    /// truncation.
    pub async fn open(dir: impl AsRef<Path>) -> RaftResult<Self> {
        let store: DurableState<LogEntry> = DurableState::open(dir.as_ref(), "raft-log").await?;

        let mut recovered: Vec<LogEntry> = store.reader_snapshot().values().cloned().collect();
        recovered.sort_by_key(|entry| entry.index);

        let mut entries = Vec::with_capacity(recovered.len());
        for entry in recovered {
            if entry.index != entries.len() as u64 + 1 {
                warn!(
                    index = entry.index,
                    expected = entries.len() as u64 + 1,
                    "dropping non-contiguous log records"
                );
                break;
            }
            entries.push(entry);
        }

        Ok(Self { entries, store })
    }

    /// Index of the last entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as u64
    }

    /// Term of the last entry, 0 when empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry at `index`, if present.
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 || index > self.last_index() {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 has term 0.
    pub fn term_at(&self, index: LogIndex) -> RaftResult<Term> {
        if index == 0 {
            return Ok(0);
        }
        self.entry(index)
            .map(|e| e.term)
            .ok_or(RaftError::LogEntryNotFound { index })
    }

    /// Whether the log holds an entry at `index` with `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        if index == 0 {
            return term == 0;
        }
        self.entry(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Up to `max` entries starting at `from` (inclusive).
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Entries in the inclusive range `[from, to]`.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        if from == 0 || from > to || from > self.last_index() {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = to.min(self.last_index()) as usize;
        self.entries[start..end].to_vec()
    }

    /// Append one entry, durable before return.
    pub async fn append(&mut self, entry: LogEntry) -> RaftResult<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::internal(format!(
                "entry index {} does not match expected {expected}",
                entry.index
            )));
        }
        self.store.set(store_key(entry.index), entry.clone()).await?;
        self.entries.push(entry);
        Ok(())
    }

    /// Remove every entry at `index` and above, durable before return.
    pub async fn truncate_from(&mut self, index: LogIndex) -> RaftResult<()> {
        if index == 0 {
            return Err(RaftError::internal("cannot truncate from index 0"));
        }
        while self.last_index() >= index {
            let last = self.last_index();
            self.store.remove(&store_key(last)).await?;
            self.entries.pop();
        }
        Ok(())
    }

    /// Compact the durable backing into a snapshot file.
    pub async fn snapshot(&self) -> RaftResult<()> {
        self.store.snapshot().await?;
        Ok(())
    }

    /// Position statistics.
    pub fn stats(&self) -> LogStats {
        LogStats {
            total_entries: self.len(),
            last_index: self.last_index(),
            last_term: self.last_term(),
        }
    }
}
