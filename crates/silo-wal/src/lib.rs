#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-wal** – Crash-consistent durable state for the Silo host.
//!
//! This crate provides the durability primitive every stateful subsystem
//! builds on: an append-only write-ahead log paired with an in-memory map
//! and periodic atomic snapshots. Writes are fsynced before they are
//! acknowledged; recovery loads the last snapshot and replays the log,
//! silently dropping a torn tail left by a crash mid-append.
//!
//! Consumers include the ACL store, the Raft metadata record, the WORM
//! registry and the deduplication index. None of them touch the filesystem
//! directly.

mod log;
mod state;

pub use log::{DurableLog, WalRecord};
pub use state::DurableState;

/// Result alias for durability operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors raised by the durability layer.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// Underlying filesystem operation failed.
    #[error("wal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be serialized for the log or snapshot.
    #[error("wal encode error: {0}")]
    Encode(String),

    /// A snapshot could not be decoded during recovery.
    ///
    /// Individual undecodable log records are dropped, not surfaced; this
    /// variant only fires for a corrupt snapshot file.
    #[error("wal decode error: {0}")]
    Decode(String),
}
