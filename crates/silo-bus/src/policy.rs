//! Injected governance seams: access control and audit.
//!
//! The bus itself has no opinion on who may dispatch what; the host wires
//! an [`AccessPolicy`] (typically backed by the ACL engine) and an
//! [`AuditSink`] into the pipeline.

use crate::request::DispatchRequest;
use chrono::{DateTime, Utc};
use silo_types::{redact_line, Failure, MessageId};
use std::sync::{Arc, Mutex};

/// Decides whether a dispatch may proceed to its handler.
pub trait AccessPolicy: Send + Sync {
    /// Authorize a dispatch; a returned failure short-circuits the chain.
    fn authorize(&self, request: &DispatchRequest) -> Result<(), Failure>;
}

/// Policy that admits everything; the default for closed-world hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

impl AccessPolicy for AllowAllPolicy {
    fn authorize(&self, _request: &DispatchRequest) -> Result<(), Failure> {
        Ok(())
    }
}

/// One audit record written by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Id of the audited message.
    pub message_id: MessageId,
    /// Sender principal.
    pub sender: String,
    /// Route description, `type_id[/name]`.
    pub route: String,
    /// Pipeline stage that wrote the record.
    pub stage: AuditStage,
    /// Outcome description; empty on the request path.
    pub outcome: String,
    /// When the record was written.
    pub at: DateTime<Utc>,
}

/// Which side of the handler a record was written on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStage {
    /// Before the handler ran.
    Request,
    /// After the handler (or a short-circuit) produced a response.
    Response,
}

/// Receives audit records from the pipeline.
///
/// Records written on the request path remain even when a later middleware
/// short-circuits the chain.
pub trait AuditSink: Send + Sync {
    /// Write one record. Must not block for long; sinks buffer internally.
    fn write(&self, record: AuditRecord);
}

/// Sink that drops every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn write(&self, _record: AuditRecord) {}
}

/// In-memory collecting sink used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of every record written so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit lock poisoned").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, record: AuditRecord) {
        self.records.lock().expect("audit lock poisoned").push(record);
    }
}

/// Build the request-path audit record for a dispatch.
pub(crate) fn request_record(request: &DispatchRequest, now: DateTime<Utc>) -> AuditRecord {
    AuditRecord {
        message_id: request.envelope.id(),
        sender: request.envelope.sender().to_string(),
        route: route_label(request),
        stage: AuditStage::Request,
        outcome: String::new(),
        at: now,
    }
}

/// Build the response-path audit record for a dispatch.
pub(crate) fn response_record(
    request: &DispatchRequest,
    outcome: &str,
    now: DateTime<Utc>,
) -> AuditRecord {
    AuditRecord {
        message_id: request.envelope.id(),
        sender: request.envelope.sender().to_string(),
        route: route_label(request),
        stage: AuditStage::Response,
        // Outcome strings may embed failure titles; scrub them the same way
        // flight-recorder lines are scrubbed.
        outcome: redact_line(outcome),
        at: now,
    }
}

fn route_label(request: &DispatchRequest) -> String {
    match &request.name {
        Some(name) => format!("{:#x}/{name}", request.type_id),
        None => format!("{:#x}", request.type_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{DispatchRequest, MessageShape};
    use bytes::Bytes;
    use silo_types::{Envelope, PrincipalId, TraceContext};

    fn request() -> DispatchRequest {
        DispatchRequest {
            type_id: 0xabcd,
            name: Some("ingest".into()),
            envelope: Envelope::new(
                PrincipalId::from("tester"),
                TraceContext::new(1, 1, false),
                Utc::now(),
            ),
            payload: Bytes::new(),
            shape: MessageShape::Query,
        }
    }

    #[test]
    fn memory_sink_collects_in_order() {
        let sink = MemoryAuditSink::new();
        let req = request();
        sink.write(request_record(&req, Utc::now()));
        sink.write(response_record(&req, "Completed", Utc::now()));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, AuditStage::Request);
        assert_eq!(records[1].stage, AuditStage::Response);
        assert_eq!(records[1].outcome, "Completed");
        assert!(records[0].route.ends_with("/ingest"));
    }
}
