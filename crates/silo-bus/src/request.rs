//! What travels through a worker queue, and the per-dispatch state machine.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use silo_types::{Command, Envelope, Event, Query};

/// Shape-specific fields of a dispatched message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageShape {
    /// Mutating intent; may carry an at-most-once key and a deadline.
    Command {
        /// Key for the idempotency cache, scoped to the sender.
        idempotency_key: Option<String>,
        /// Absolute deadline after which execution is rejected.
        deadline: Option<DateTime<Utc>>,
    },
    /// Non-mutating read expecting a response payload.
    Query,
    /// Past fact; fire-and-forget.
    Event {
        /// Whether the event should be replicated to cluster peers.
        propagate_cluster: bool,
    },
}

/// A routed message ready for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Stable type id of the payload (see [`crate::message_type_id`]).
    pub type_id: u64,
    /// Optional logical name refining the route.
    pub name: Option<String>,
    /// The base message record.
    pub envelope: Envelope,
    /// Opaque payload bytes; the handler owns deserialization.
    pub payload: Bytes,
    /// Shape-specific fields.
    pub shape: MessageShape,
}

impl DispatchRequest {
    /// Build a dispatch from a command.
    pub fn command(type_id: u64, name: Option<String>, command: Command) -> Self {
        let shape = MessageShape::Command {
            idempotency_key: command.idempotency_key().map(str::to_string),
            deadline: command.deadline(),
        };
        let payload = command.payload().clone();
        Self {
            type_id,
            name,
            envelope: command.envelope().clone(),
            payload,
            shape,
        }
    }

    /// Build a dispatch from a query.
    pub fn query<R>(type_id: u64, name: Option<String>, query: Query<R>) -> Self {
        let payload = query.payload().clone();
        Self {
            type_id,
            name,
            envelope: query.envelope().clone(),
            payload,
            shape: MessageShape::Query,
        }
    }

    /// Build a dispatch from an event.
    pub fn event(type_id: u64, name: Option<String>, event: Event) -> Self {
        let shape = MessageShape::Event {
            propagate_cluster: event.propagate_cluster(),
        };
        let payload = event.payload().clone();
        Self {
            type_id,
            name,
            envelope: event.envelope().clone(),
            payload,
            shape,
        }
    }

    /// The route key this request resolves against.
    pub fn route_key(&self) -> crate::routing::RouteKey {
        crate::routing::RouteKey {
            type_id: self.type_id,
            name: self.name.clone(),
        }
    }

    /// The idempotency key, when the shape carries one.
    pub fn idempotency_key(&self) -> Option<&str> {
        match &self.shape {
            MessageShape::Command {
                idempotency_key, ..
            } => idempotency_key.as_deref(),
            _ => None,
        }
    }

    /// The execution deadline, when the shape carries one.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match &self.shape {
            MessageShape::Command { deadline, .. } => *deadline,
            _ => None,
        }
    }

    /// Whether the shape expects a response payload.
    pub fn expects_response(&self) -> bool {
        !matches!(self.shape, MessageShape::Event { .. })
    }
}

/// Per-dispatch state machine.
///
/// `Retrying` re-enters `Queued` with an incremented retry count; exceeding
/// the policy's attempt budget lands in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting in a worker queue.
    Queued,
    /// Structural and expiry validation.
    Validating,
    /// Access-control evaluation.
    Authorizing,
    /// Handler running.
    Executing,
    /// Terminal: handler succeeded.
    Completed,
    /// Terminal: handler or middleware failed.
    Failed,
    /// Terminal: cancellation token fired.
    Cancelled,
    /// Transient failure; scheduled for another attempt.
    Retrying,
}

impl DispatchState {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchState::Completed | DispatchState::Failed | DispatchState::Cancelled
        )
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DispatchState::Queued => "Queued",
            DispatchState::Validating => "Validating",
            DispatchState::Authorizing => "Authorizing",
            DispatchState::Executing => "Executing",
            DispatchState::Completed => "Completed",
            DispatchState::Failed => "Failed",
            DispatchState::Cancelled => "Cancelled",
            DispatchState::Retrying => "Retrying",
        };
        f.write_str(name)
    }
}
