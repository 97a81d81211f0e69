//! The fixed dispatch pipeline.
//!
//! Stage order is not configurable:
//! `Exception → Trace → Validation → AccessControl → Deprecation → Audit →
//! Handler → ReverseAudit → Response`. Any stage may short-circuit by
//! producing a response; audit records already written stay written. The
//! pipeline also owns the retry loop and the idempotency cache consultation.

use crate::idempotency::IdempotencyCache;
use crate::policy::{request_record, response_record, AccessPolicy, AuditSink};
use crate::request::{DispatchRequest, DispatchState};
use crate::retry::RetryPolicy;
use crate::routing::{HandlerRegistry, RouteKey};
use futures::FutureExt;
use silo_types::{redact_line, Clock, Failure, Response};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct Pipeline {
    registry: Arc<HandlerRegistry>,
    policy: Arc<dyn AccessPolicy>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    idempotency: IdempotencyCache,
    deprecation_seen: Mutex<HashSet<RouteKey>>,
}

impl Pipeline {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        policy: Arc<dyn AccessPolicy>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        idempotency: IdempotencyCache,
    ) -> Self {
        Self {
            registry,
            policy,
            audit,
            clock,
            retry,
            idempotency,
            deprecation_seen: Mutex::new(HashSet::new()),
        }
    }

    /// Run one dispatch to a terminal state.
    pub(crate) async fn run(
        &self,
        mut request: DispatchRequest,
        token: CancellationToken,
    ) -> (DispatchState, Response) {
        // Idempotency: a prior response within TTL short-circuits the whole
        // chain without re-invoking the handler.
        let sender = request.envelope.sender().to_string();
        if let Some(key) = request.idempotency_key().map(str::to_string) {
            if let Some(prior) = self.idempotency.get(&sender, &key) {
                debug!(message = %request.envelope.id(), key, "idempotency hit");
                return (DispatchState::Completed, prior);
            }
        }

        let mut attempts_made: u32 = 0;
        let (state, response) = loop {
            let outcome = self.run_attempt(&mut request, &token).await;
            attempts_made += 1;

            match outcome {
                AttemptOutcome::Cancelled => break (DispatchState::Cancelled, Response::Cancelled),
                AttemptOutcome::Done(response) => {
                    let category = response.failure().map(|f| f.category);
                    match category {
                        Some(category) if self.retry.allows_retry(category, attempts_made) => {
                            let delay = self.retry.delay_for(attempts_made);
                            debug!(
                                message = %request.envelope.id(),
                                attempt = attempts_made,
                                ?delay,
                                %category,
                                "dispatch retrying"
                            );
                            let _ = request.envelope.mark_retry();
                            // Retrying re-enters the queue after the backoff
                            // delay; cancellation wins over the sleep.
                            tokio::select! {
                                _ = token.cancelled() => {
                                    break (DispatchState::Cancelled, Response::Cancelled);
                                }
                                _ = self.clock.sleep(delay) => {}
                            }
                        }
                        Some(_) => break (DispatchState::Failed, response),
                        None => {
                            let state = if response.is_success() {
                                DispatchState::Completed
                            } else {
                                DispatchState::Cancelled
                            };
                            break (state, response);
                        }
                    }
                }
            }
        };

        // Cancelled dispatches must not populate the cache.
        if state != DispatchState::Cancelled {
            if let Some(key) = request.idempotency_key() {
                self.idempotency.store(&sender, key, response.clone());
            }
        }

        (state, response)
    }

    /// One pass through the middleware chain.
    async fn run_attempt(
        &self,
        request: &mut DispatchRequest,
        token: &CancellationToken,
    ) -> AttemptOutcome {
        if token.is_cancelled() {
            return AttemptOutcome::Cancelled;
        }

        // Trace: stamp the flight recorder; locked envelopes keep their
        // recorded history as-is.
        let _ = request.envelope.record_trace(&format!(
            "dispatch {} traceparent={}",
            request.envelope.id(),
            request.envelope.trace().traceparent()
        ));

        // Validation.
        if let Some(failure) = self.validate(request) {
            return AttemptOutcome::Done(Response::Failure(failure));
        }

        // Access control.
        if let Err(failure) = self.policy.authorize(request) {
            warn!(message = %request.envelope.id(), %failure, "dispatch rejected by access policy");
            return AttemptOutcome::Done(Response::Failure(failure));
        }

        let registration = match self.registry.resolve(&request.route_key()) {
            Some(registration) => registration,
            None => {
                return AttemptOutcome::Done(Response::Failure(
                    Failure::logical("NoRoute", "no handler registered for route")
                        .with_status(404),
                ));
            }
        };

        // Deprecation: warn once per route, never fail.
        if registration.deprecated {
            let first = self
                .deprecation_seen
                .lock()
                .expect("deprecation lock poisoned")
                .insert(request.route_key());
            if first {
                warn!(route = ?request.route_key(), owner = %registration.owner, "dispatch to deprecated route");
            }
        }

        // Audit (request path). Records written here remain even if the
        // handler short-circuits or fails.
        self.audit
            .write(request_record(request, self.clock.now_utc()));

        // Handler, guarded by the exception stage: a panic becomes a System
        // failure with the diagnostic redacted of secret-bearing fragments.
        let handler_future = registration.handler.handle(request.clone(), token.clone());
        let response = tokio::select! {
            _ = token.cancelled() => {
                self.audit
                    .write(response_record(request, "Cancelled", self.clock.now_utc()));
                return AttemptOutcome::Cancelled;
            }
            caught = AssertUnwindSafe(handler_future).catch_unwind() => match caught {
                Ok(response) => response,
                Err(panic) => {
                    let detail = panic_message(&panic);
                    warn!(message = %request.envelope.id(), detail, "handler panicked");
                    Response::Failure(Failure::system("HandlerPanicked", redact_line(&detail)))
                }
            },
        };

        // Reverse audit (response path).
        let outcome = match &response {
            Response::Success { .. } => "Completed".to_string(),
            Response::Failure(failure) => failure.to_string(),
            Response::Cancelled => "Cancelled".to_string(),
        };
        self.audit
            .write(response_record(request, &outcome, self.clock.now_utc()));

        AttemptOutcome::Done(response)
    }

    fn validate(&self, request: &DispatchRequest) -> Option<Failure> {
        let now = self.clock.now_utc();
        if request.envelope.is_expired(now) {
            return Some(Failure::logical("Expired", "message expired before dispatch"));
        }
        if let Some(deadline) = request.deadline() {
            if now >= deadline {
                return Some(Failure::logical(
                    "DeadlineExceeded",
                    "command deadline passed before execution",
                ));
            }
        }
        if request.envelope.schema_version() == 0 {
            return Some(Failure::logical(
                "SchemaVersion",
                "schema version must be non-zero",
            ));
        }
        None
    }
}

enum AttemptOutcome {
    Done(Response),
    Cancelled,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
