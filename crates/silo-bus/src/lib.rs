#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-bus** – Typed message bus and governed dispatch pipeline.
//!
//! The bus routes a typed message to the single handler registered for its
//! type and logical name, running a fixed middleware chain around the
//! handler: exception capture, tracing, validation, access control,
//! deprecation, audit. Commands may be deduplicated through a process-local
//! idempotency cache; transient failures are retried per policy; messages
//! are pinned to one of a fixed set of worker queues by partition key so
//! per-sender ordering is preserved end to end.

use std::time::Duration;

mod bus;
mod idempotency;
mod pipeline;
mod policy;
mod request;
mod retry;
mod routing;

pub use bus::{BusEvent, MessageBus};
pub use idempotency::IdempotencyCache;
pub use policy::{
    AccessPolicy, AllowAllPolicy, AuditRecord, AuditSink, MemoryAuditSink, NullAuditSink,
};
pub use request::{DispatchRequest, DispatchState, MessageShape};
pub use retry::{RetryPolicy, RetryStrategy};
pub use routing::{Handler, HandlerFuture, HandlerRegistration, HandlerRegistry, RouteKey};

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised by the bus surface itself.
///
/// Handler-level failures travel inside [`silo_types::Response`]; these are
/// the cases where the bus could not even carry the message.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The target worker queue stayed full past the publish deadline.
    #[error("worker queue full for partition '{partition}' after {waited_ms}ms")]
    BackpressureExceeded {
        /// Partition key of the rejected message.
        partition: String,
        /// How long the publisher waited before giving up.
        waited_ms: u64,
    },
    /// The bus is shutting down and no longer accepts messages.
    #[error("bus is shutting down")]
    ShuttingDown,
}

/// Stable 64-bit message type identifier: FNV-1a over the canonical name.
///
/// The payload travels as opaque bytes; this id plus the optional logical
/// name is the whole routing key.
pub fn message_type_id(canonical_name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    canonical_name
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

/// Tunables for a bus instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Number of ordered worker queues.
    pub workers: usize,
    /// Bounded depth of each worker queue.
    pub queue_depth: usize,
    /// How long a publisher blocks on a full queue before
    /// [`BusError::BackpressureExceeded`].
    pub publish_deadline: Duration,
    /// Capacity of the idempotency cache.
    pub idempotency_capacity: usize,
    /// Time-to-live of idempotency entries.
    pub idempotency_ttl: Duration,
    /// Retry policy applied to transient handler failures.
    pub retry: RetryPolicy,
    /// Ring size of the bus event stream.
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 256,
            publish_deadline: Duration::from_millis(500),
            idempotency_capacity: 1024,
            idempotency_ttl: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ids_are_stable_and_distinct() {
        // FNV-1a reference vector.
        assert_eq!(message_type_id(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(
            message_type_id("warehouse.ingest.v1"),
            message_type_id("warehouse.ingest.v1")
        );
        assert_ne!(
            message_type_id("warehouse.ingest.v1"),
            message_type_id("warehouse.ingest.v2")
        );
    }
}
