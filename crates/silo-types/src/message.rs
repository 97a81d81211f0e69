//! Command, query and event specializations of [`Envelope`].
//!
//! The payload itself travels as opaque bytes; handlers deserialize with the
//! schema implied by the route's type id. Wrappers only add the fields their
//! shape requires: idempotency + deadline for commands, a response-type
//! marker for queries, a cluster-propagation flag for events.

use crate::envelope::{Envelope, EnvelopeError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// A mutating intent addressed to exactly one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    envelope: Envelope,
    #[serde(skip)]
    payload: Bytes,
    idempotency_key: Option<String>,
    deadline: Option<DateTime<Utc>>,
}

impl Command {
    /// Wrap an envelope and payload into a command.
    pub fn new(envelope: Envelope, payload: Bytes) -> Self {
        Self {
            envelope,
            payload,
            idempotency_key: None,
            deadline: None,
        }
    }

    /// The underlying envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Mutable access to the underlying envelope.
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// At-most-once key consulted by the bus idempotency cache.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// Absolute deadline after which execution is pointless.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Set the idempotency key. Fails once the envelope is locked.
    pub fn set_idempotency_key(&mut self, key: impl Into<String>) -> Result<(), EnvelopeError> {
        if self.envelope.is_locked() {
            return Err(EnvelopeError::ReadOnlyViolation(self.envelope.id()));
        }
        self.idempotency_key = Some(key.into());
        Ok(())
    }

    /// Set the execution deadline. Fails once the envelope is locked.
    pub fn set_deadline(&mut self, deadline: DateTime<Utc>) -> Result<(), EnvelopeError> {
        if self.envelope.is_locked() {
            return Err(EnvelopeError::ReadOnlyViolation(self.envelope.id()));
        }
        self.deadline = Some(deadline);
        Ok(())
    }
}

/// A non-mutating read with an expected response type `R`.
///
/// `R` is a compile-time marker only; the wire payload stays opaque and the
/// responding handler is trusted to produce an `R`-shaped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query<R> {
    envelope: Envelope,
    #[serde(skip)]
    payload: Bytes,
    #[serde(skip)]
    _response: PhantomData<fn() -> R>,
}

impl<R> Query<R> {
    /// Wrap an envelope and payload into a query.
    pub fn new(envelope: Envelope, payload: Bytes) -> Self {
        Self {
            envelope,
            payload,
            _response: PhantomData,
        }
    }

    /// The underlying envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Mutable access to the underlying envelope.
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// A past fact broadcast to any number of subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    envelope: Envelope,
    #[serde(skip)]
    payload: Bytes,
    propagate_cluster: bool,
}

impl Event {
    /// Wrap an envelope and payload into an event.
    pub fn new(envelope: Envelope, payload: Bytes) -> Self {
        Self {
            envelope,
            payload,
            propagate_cluster: false,
        }
    }

    /// The underlying envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Mutable access to the underlying envelope.
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the event should be replicated to cluster peers.
    pub fn propagate_cluster(&self) -> bool {
        self.propagate_cluster
    }

    /// Request cluster propagation. Fails once the envelope is locked.
    pub fn set_propagate_cluster(&mut self, propagate: bool) -> Result<(), EnvelopeError> {
        if self.envelope.is_locked() {
            return Err(EnvelopeError::ReadOnlyViolation(self.envelope.id()));
        }
        self.propagate_cluster = propagate;
        Ok(())
    }
}
