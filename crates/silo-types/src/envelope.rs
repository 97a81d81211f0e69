//! The base message record every command, query and event is built on.
//!
//! An envelope is freely mutable until [`Envelope::lock`] is called; from
//! that point every state-changing operation fails with
//! [`EnvelopeError::ReadOnlyViolation`]. Cloning through
//! [`Envelope::clone_unlocked`] mints a fresh identity and clears the lock,
//! so downstream stages can derive new messages from sealed ones.

use crate::trace::{redact_line, redact_value, TraceContext};
use crate::{TenantId, FLIGHT_RECORDER_CAPACITY, MAX_ATTACHMENTS, MAX_ATTACHMENT_LEN, MAX_METADATA_LEN};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Unique identifier of a message within a process lifetime (UUID v4).
pub type MessageId = Uuid;

/// Identifier of the principal (user, plugin, node) that produced a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tenancy scope a message executes under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Visible to every tenant hosted by the process.
    Global,
    /// Constrained to a single tenant partition.
    Tenant(TenantId),
}

/// One recorded mutation of an envelope field, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditChange {
    /// Name of the mutated field.
    pub field: String,
    /// Previous value, redacted when the field is secret-bearing.
    pub old: String,
    /// New value, redacted when the field is secret-bearing.
    pub new: String,
    /// Caller-supplied reason for the change.
    pub reason: String,
}

/// Client-side forensics captured at the ingress edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientForensics {
    /// Remote address the message arrived from.
    pub ip: String,
    /// User agent reported by the client.
    pub user_agent: String,
}

/// Errors raised by envelope state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The envelope is locked; mutation is rejected.
    #[error("message {0} is locked and read-only")]
    ReadOnlyViolation(MessageId),
    /// An attachment exceeded the configured limits.
    #[error("attachment limit exceeded: {0}")]
    AttachmentLimit(String),
    /// A metadata key or value exceeded the configured length limit.
    #[error("metadata entry too long: {0}")]
    MetadataTooLong(String),
}

impl EnvelopeError {
    /// Map into the host failure taxonomy: envelope misuse is a logical
    /// fault of the caller, never retried.
    pub fn to_failure(&self) -> crate::response::Failure {
        let code = match self {
            EnvelopeError::ReadOnlyViolation(_) => "ReadOnlyViolation",
            EnvelopeError::AttachmentLimit(_) => "AttachmentLimit",
            EnvelopeError::MetadataTooLong(_) => "MetadataTooLong",
        };
        crate::response::Failure::logical(code, self.to_string())
    }
}

//─────────────────────────────
//  Flight recorder
//─────────────────────────────

/// Bounded ring of human-readable trace lines attached to a message.
///
/// Lines are redacted on entry; once the ring is full the oldest line is
/// evicted. The recorder travels with the envelope so a failed dispatch
/// carries its own diagnostic history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightRecorder {
    lines: VecDeque<String>,
}

impl FlightRecorder {
    /// Append a line, redacting secret-bearing `key=value` fragments.
    pub fn record(&mut self, line: &str) {
        if self.lines.len() == FLIGHT_RECORDER_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(redact_line(line));
    }

    /// Iterate the retained lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no lines have been recorded.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// The base message record.
///
/// All mutators return `Err(ReadOnlyViolation)` once the envelope is locked.
/// Accessors are infallible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    sender: PrincipalId,
    correlation_id: Option<MessageId>,
    causation_id: Option<MessageId>,
    trace: TraceContext,
    retry_count: u32,
    priority: Option<u8>,
    partition_key: Option<String>,
    scope: Scope,
    dry_run: bool,
    schema_version: u16,
    culture: Option<String>,
    metadata: HashMap<String, String>,
    #[serde(skip)]
    attachments: HashMap<String, Bytes>,
    audit_trail: Vec<AuditChange>,
    forensics: Option<ClientForensics>,
    recorder: FlightRecorder,
    locked: bool,
}

impl Envelope {
    /// Create a new unlocked envelope from the given sender at `now`.
    pub fn new(sender: PrincipalId, trace: TraceContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            expires_at: None,
            sender,
            correlation_id: None,
            causation_id: None,
            trace,
            retry_count: 0,
            priority: None,
            partition_key: None,
            scope: Scope::Global,
            dry_run: false,
            schema_version: 1,
            culture: None,
            metadata: HashMap::new(),
            attachments: HashMap::new(),
            audit_trail: Vec::new(),
            forensics: None,
            recorder: FlightRecorder::default(),
            locked: false,
        }
    }

    fn ensure_unlocked(&self) -> Result<(), EnvelopeError> {
        if self.locked {
            Err(EnvelopeError::ReadOnlyViolation(self.id))
        } else {
            Ok(())
        }
    }

    //───────────────────── accessors ─────────────────────

    /// Message identifier, unique within a process lifetime.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Optional expiry; expired messages are rejected at validation.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the envelope has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }

    /// The producing principal.
    pub fn sender(&self) -> &PrincipalId {
        &self.sender
    }

    /// Correlation id linking messages of one logical conversation.
    pub fn correlation_id(&self) -> Option<MessageId> {
        self.correlation_id
    }

    /// Id of the message that directly caused this one.
    pub fn causation_id(&self) -> Option<MessageId> {
        self.causation_id
    }

    /// Trace context for this message.
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Number of dispatch attempts already made.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Optional priority override (higher wins).
    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    /// Key the bus uses to pin the message to one ordered worker queue.
    ///
    /// Defaults to the sender id, preserving per-sender ordering.
    pub fn partition_key(&self) -> &str {
        self.partition_key.as_deref().unwrap_or(&self.sender.0)
    }

    /// Tenancy scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Whether the message is a dry run (executed without side effects).
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Payload schema version.
    pub fn schema_version(&self) -> u16 {
        self.schema_version
    }

    /// Culture tag for localized rendering, e.g. `en-GB`.
    pub fn culture(&self) -> Option<&str> {
        self.culture.as_deref()
    }

    /// Free-form metadata map.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Named opaque attachments.
    pub fn attachments(&self) -> &HashMap<String, Bytes> {
        &self.attachments
    }

    /// Ordered audit trail of envelope mutations.
    pub fn audit_trail(&self) -> &[AuditChange] {
        &self.audit_trail
    }

    /// Client forensics captured at ingress.
    pub fn forensics(&self) -> Option<&ClientForensics> {
        self.forensics.as_ref()
    }

    /// The attached flight recorder.
    pub fn recorder(&self) -> &FlightRecorder {
        &self.recorder
    }

    /// Whether the envelope has been sealed.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    //───────────────────── mutators ─────────────────────

    /// Set the expiry timestamp.
    pub fn set_expires_at(&mut self, at: DateTime<Utc>) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.expires_at = Some(at);
        Ok(())
    }

    /// Link this message to a conversation.
    pub fn set_correlation(&mut self, id: MessageId) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.correlation_id = Some(id);
        Ok(())
    }

    /// Record the message that caused this one.
    pub fn set_causation(&mut self, id: MessageId) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.causation_id = Some(id);
        Ok(())
    }

    /// Override the dispatch priority.
    pub fn set_priority(&mut self, priority: u8) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.priority = Some(priority);
        Ok(())
    }

    /// Override the partition key.
    pub fn set_partition_key(&mut self, key: impl Into<String>) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.partition_key = Some(key.into());
        Ok(())
    }

    /// Constrain the message to a tenant.
    pub fn set_scope(&mut self, scope: Scope) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.scope = scope;
        Ok(())
    }

    /// Mark the message as a dry run.
    pub fn set_dry_run(&mut self, dry_run: bool) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.dry_run = dry_run;
        Ok(())
    }

    /// Set the payload schema version.
    pub fn set_schema_version(&mut self, version: u16) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.schema_version = version;
        Ok(())
    }

    /// Set the culture tag.
    pub fn set_culture(&mut self, culture: impl Into<String>) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.culture = Some(culture.into());
        Ok(())
    }

    /// Attach client forensics.
    pub fn set_forensics(&mut self, forensics: ClientForensics) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.forensics = Some(forensics);
        Ok(())
    }

    /// Insert a metadata entry, recording the change in the audit trail.
    ///
    /// Secret-bearing values are redacted in the audit record but stored
    /// verbatim in the metadata map.
    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        let key = key.into();
        let value = value.into();
        if key.len() > MAX_METADATA_LEN || value.len() > MAX_METADATA_LEN {
            return Err(EnvelopeError::MetadataTooLong(key));
        }
        let old = self.metadata.get(&key).cloned().unwrap_or_default();
        self.audit_trail.push(AuditChange {
            field: format!("metadata.{key}"),
            old: redact_value(&key, &old).into_owned(),
            new: redact_value(&key, &value).into_owned(),
            reason: reason.into(),
        });
        self.metadata.insert(key, value);
        Ok(())
    }

    /// Attach a named opaque byte stream.
    pub fn attach(&mut self, name: impl Into<String>, data: Bytes) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        let name = name.into();
        if self.attachments.len() >= MAX_ATTACHMENTS {
            return Err(EnvelopeError::AttachmentLimit(format!(
                "too many attachments ({MAX_ATTACHMENTS} max)"
            )));
        }
        if data.len() > MAX_ATTACHMENT_LEN {
            return Err(EnvelopeError::AttachmentLimit(format!(
                "attachment '{name}' is {} bytes ({MAX_ATTACHMENT_LEN} max)",
                data.len()
            )));
        }
        self.attachments.insert(name, data);
        Ok(())
    }

    /// Append a line to the flight recorder.
    pub fn record_trace(&mut self, line: &str) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.recorder.record(line);
        Ok(())
    }

    /// Increment the retry counter; used by the bus on requeue.
    pub fn mark_retry(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_unlocked()?;
        self.retry_count += 1;
        Ok(())
    }

    /// Seal the envelope; every subsequent mutator fails.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Clone into a new message: fresh id and timestamp, lock cleared.
    ///
    /// The clone's causation id points back at the original so lineage is
    /// preserved across the copy.
    pub fn clone_unlocked(&self, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.created_at = now;
        copy.causation_id = Some(self.id);
        copy.locked = false;
        copy
    }
}
