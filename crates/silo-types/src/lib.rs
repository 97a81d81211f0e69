#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-types** – Shared primitive data structures for the Silo host.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the message envelope model, the response and failure taxonomy,
//! W3C trace context, and the injected clock capability. It intentionally
//! makes no assumptions about I/O, consensus, or storage.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum number of attachments a single envelope may carry.
pub const MAX_ATTACHMENTS: usize = 64;

/// Maximum size of a single attachment in bytes.
pub const MAX_ATTACHMENT_LEN: usize = 16 * 1024 * 1024;

/// Maximum number of flight-recorder lines retained per envelope.
pub const FLIGHT_RECORDER_CAPACITY: usize = 128;

/// Maximum length of a metadata key or value.
pub const MAX_METADATA_LEN: usize = 4096;

//─────────────────────────────
//  Modules
//─────────────────────────────

/// Injected wall-clock and sleep capability.
pub mod clock;
/// The base message record shared by commands, queries and events.
pub mod envelope;
/// Command, query and event specializations.
pub mod message;
/// Response payloads and the structured failure taxonomy.
pub mod response;
/// W3C trace context and secret redaction.
pub mod trace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{
    AuditChange, ClientForensics, Envelope, EnvelopeError, FlightRecorder, MessageId, PrincipalId,
    Scope,
};
pub use message::{Command, Event, Query};
pub use response::{BatchResponse, Failure, FailureCategory, Response};
pub use trace::{redact_line, redact_value, TraceContext, REDACTED};

//─────────────────────────────
//  Tenancy
//─────────────────────────────

/// Identifier of a tenant partition inside the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
