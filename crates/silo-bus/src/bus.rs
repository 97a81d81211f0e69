//! The bus itself: partitioned worker queues and the public dispatch API.
//!
//! Messages are pinned to a worker queue by partition key (default: the
//! sender id), so one sender's messages execute in submission order. Each
//! queue is bounded; a publisher that cannot enqueue before its deadline
//! fails with backpressure.

use crate::pipeline::Pipeline;
use crate::policy::{AccessPolicy, AuditSink};
use crate::request::{DispatchRequest, DispatchState};
use crate::routing::{HandlerRegistration, HandlerRegistry, RouteKey};
use crate::{BusConfig, BusError, BusResult, IdempotencyCache};
use silo_types::{Clock, Failure, MessageId, Response};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lifecycle notices published on the bus event stream.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A handler became the active registration for a route.
    HandlerRegistered {
        /// The route registered.
        route: RouteKey,
        /// Owner of the registration.
        owner: String,
    },
    /// Every registration of an owner was removed.
    HandlerUnregistered {
        /// The owner whose routes were removed.
        owner: String,
    },
    /// A dispatch reached a terminal state.
    DispatchFinished {
        /// Id of the dispatched message.
        message_id: MessageId,
        /// Terminal state.
        state: DispatchState,
    },
}

struct WorkItem {
    request: DispatchRequest,
    token: CancellationToken,
    responder: Option<oneshot::Sender<(DispatchState, Response)>>,
}

/// The typed message bus.
pub struct MessageBus {
    registry: Arc<HandlerRegistry>,
    queues: Vec<mpsc::Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
    events: broadcast::Sender<BusEvent>,
    clock: Arc<dyn Clock>,
    publish_deadline: std::time::Duration,
    shutdown: CancellationToken,
}

impl MessageBus {
    /// Build a bus and spawn its worker queues.
    pub fn new(
        config: BusConfig,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn AccessPolicy>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&registry),
            policy,
            audit,
            Arc::clone(&clock),
            config.retry,
            IdempotencyCache::new(config.idempotency_capacity, config.idempotency_ttl),
        ));

        let (events, _) = broadcast::channel(config.event_capacity);
        let shutdown = CancellationToken::new();

        let mut queues = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<WorkItem>(config.queue_depth.max(1));
            queues.push(tx);
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                Arc::clone(&pipeline),
                events.clone(),
                shutdown.clone(),
            )));
        }

        info!(workers = queues.len(), "message bus started");
        Self {
            registry,
            queues,
            workers,
            events,
            clock,
            publish_deadline: config.publish_deadline,
            shutdown,
        }
    }

    /// Register a handler; later registrations with higher priority
    /// supersede the active one.
    pub fn register_handler(&self, registration: HandlerRegistration) {
        let route = registration.route.clone();
        let owner = registration.owner.clone();
        self.registry.register(registration);
        let _ = self.events.send(BusEvent::HandlerRegistered { route, owner });
    }

    /// Remove every registration owned by `owner`.
    pub fn unregister_all(&self, owner: &str) {
        self.registry.unregister_all(owner);
        let _ = self.events.send(BusEvent::HandlerUnregistered {
            owner: owner.to_string(),
        });
    }

    /// Subscribe to the bus event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// The shared registry, for hosts that roll back registrations.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Dispatch a request/response message and await its outcome.
    ///
    /// Queue backpressure surfaces as a `Transient` failure response; every
    /// other outcome is whatever the pipeline produced.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        token: CancellationToken,
    ) -> Response {
        let message_id = request.envelope.id();
        let (tx, rx) = oneshot::channel();
        if let Err(err) = self.enqueue(request, token, Some(tx)).await {
            return Response::Failure(Failure::transient("BackpressureExceeded", err.to_string()));
        }

        match rx.await {
            Ok((_state, response)) => response,
            Err(_) => {
                debug!(%message_id, "worker dropped before responding");
                Response::Failure(Failure::system(
                    "BusShutdown",
                    "bus stopped before the dispatch completed",
                ))
            }
        }
    }

    /// Publish a fire-and-forget message.
    pub async fn publish(
        &self,
        request: DispatchRequest,
        token: CancellationToken,
    ) -> BusResult<()> {
        self.enqueue(request, token, None).await
    }

    /// Stop the workers, draining nothing: queued work is dropped and
    /// pending dispatchers observe a shutdown failure.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.queues.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        info!("message bus stopped");
    }

    async fn enqueue(
        &self,
        request: DispatchRequest,
        token: CancellationToken,
        responder: Option<oneshot::Sender<(DispatchState, Response)>>,
    ) -> BusResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::ShuttingDown);
        }

        let partition = request.envelope.partition_key().to_string();
        let queue = &self.queues[partition_index(&partition, self.queues.len())];
        let item = WorkItem {
            request,
            token,
            responder,
        };

        // Block on a full queue up to the publish deadline, then fail.
        let deadline = self.publish_deadline;
        tokio::select! {
            sent = queue.send(item) => sent.map_err(|_| BusError::ShuttingDown),
            _ = self.clock.sleep(deadline) => Err(BusError::BackpressureExceeded {
                partition,
                waited_ms: deadline.as_millis() as u64,
            }),
        }
    }
}

fn partition_index(partition: &str, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    partition.hash(&mut hasher);
    (hasher.finish() % buckets.max(1) as u64) as usize
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    pipeline: Arc<Pipeline>,
    events: broadcast::Sender<BusEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let message_id = item.request.envelope.id();
        let (state, response) = pipeline.run(item.request, item.token).await;
        debug!(worker_id, %message_id, %state, "dispatch finished");
        let _ = events.send(BusEvent::DispatchFinished { message_id, state });
        if let Some(responder) = item.responder {
            let _ = responder.send((state, response));
        }
    }
    debug!(worker_id, "bus worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AllowAllPolicy, AuditStage, MemoryAuditSink};
    use crate::request::MessageShape;
    use crate::retry::{RetryPolicy, RetryStrategy};
    use crate::routing::RouteKey;
    use crate::{message_type_id, BusConfig};
    use bytes::Bytes;
    use silo_types::{
        Command, Envelope, FailureCategory, PrincipalId, Response, SystemClock, TraceContext,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const INGEST: &str = "warehouse.ingest";

    fn envelope(sender: &str) -> Envelope {
        Envelope::new(
            PrincipalId::from(sender),
            TraceContext::new(9, 9, false),
            chrono::Utc::now(),
        )
    }

    fn command_request(sender: &str, payload: &str) -> DispatchRequest {
        DispatchRequest::command(
            message_type_id(INGEST),
            None,
            Command::new(envelope(sender), Bytes::from(payload.to_string())),
        )
    }

    fn registration(handler: Arc<dyn crate::Handler>) -> HandlerRegistration {
        HandlerRegistration {
            owner: "test".into(),
            route: RouteKey {
                type_id: message_type_id(INGEST),
                name: None,
            },
            priority: 10,
            deprecated: false,
            handler,
        }
    }

    fn test_bus(config: BusConfig) -> (MessageBus, Arc<MemoryAuditSink>) {
        let audit = MemoryAuditSink::new();
        let bus = MessageBus::new(
            config,
            Arc::new(SystemClock),
            Arc::new(AllowAllPolicy),
            audit.clone(),
        );
        (bus, audit)
    }

    #[tokio::test]
    async fn dispatch_reaches_the_registered_handler() {
        let (bus, audit) = test_bus(BusConfig::default());
        bus.register_handler(registration(Arc::new(
            |req: DispatchRequest, _token: CancellationToken| async move {
                Response::with_payload(req.payload)
            },
        )));

        let response = bus
            .dispatch(command_request("alice", "hello"), CancellationToken::new())
            .await;
        match response {
            Response::Success { payload } => assert_eq!(payload.unwrap(), "hello"),
            other => panic!("unexpected response: {other:?}"),
        }

        let records = audit.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, AuditStage::Request);
        assert_eq!(records[1].outcome, "Completed");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_route_is_a_logical_failure() {
        let (bus, _audit) = test_bus(BusConfig::default());
        let response = bus
            .dispatch(command_request("alice", "x"), CancellationToken::new())
            .await;
        let failure = response.failure().expect("expected failure");
        assert_eq!(failure.error_code, "NoRoute");
        assert_eq!(failure.category, FailureCategory::Logical);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let (bus, _audit) = test_bus(BusConfig {
            workers: 4,
            ..BusConfig::default()
        });

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.register_handler(registration(Arc::new(
            move |req: DispatchRequest, _token: CancellationToken| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&req.payload).to_string());
                    Response::ok()
                }
            },
        )));

        // join_all polls in order, so the enqueues happen in submission
        // order while the completions race.
        let waits: Vec<_> = (0..32)
            .map(|i| bus.dispatch(command_request("same-sender", &format!("m{i}")), CancellationToken::new()))
            .collect();
        for response in futures::future::join_all(waits).await {
            assert!(response.is_success());
        }

        let observed = seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..32).map(|i| format!("m{i}")).collect();
        assert_eq!(observed, expected);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn idempotency_key_returns_cached_response() {
        let (bus, _audit) = test_bus(BusConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        bus.register_handler(registration(Arc::new(
            move |_req: DispatchRequest, _token: CancellationToken| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Response::with_payload(Bytes::from_static(b"done"))
                }
            },
        )));

        let mut first = Command::new(envelope("alice"), Bytes::from_static(b"{}"));
        first.set_idempotency_key("op-9").unwrap();
        let mut second = Command::new(envelope("alice"), Bytes::from_static(b"{}"));
        second.set_idempotency_key("op-9").unwrap();

        let r1 = bus
            .dispatch(
                DispatchRequest::command(message_type_id(INGEST), None, first),
                CancellationToken::new(),
            )
            .await;
        let r2 = bus
            .dispatch(
                DispatchRequest::command(message_type_id(INGEST), None, second),
                CancellationToken::new(),
            )
            .await;

        assert!(r1.is_success() && r2.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let (bus, _audit) = test_bus(BusConfig {
            retry: RetryPolicy {
                strategy: RetryStrategy::Constant,
                max_attempts: 5,
                base_delay: std::time::Duration::from_millis(1),
            },
            ..BusConfig::default()
        });

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        bus.register_handler(registration(Arc::new(
            move |_req: DispatchRequest, _token: CancellationToken| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Response::Failure(silo_types::Failure::transient("Flaky", "not yet"))
                    } else {
                        Response::ok()
                    }
                }
            },
        )));

        let response = bus
            .dispatch(command_request("alice", "x"), CancellationToken::new())
            .await;
        assert!(response.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn security_failures_never_retry() {
        let (bus, _audit) = test_bus(BusConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        bus.register_handler(registration(Arc::new(
            move |_req: DispatchRequest, _token: CancellationToken| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Response::Failure(silo_types::Failure::security("Unauthorized", "no"))
                }
            },
        )));

        let response = bus
            .dispatch(command_request("alice", "x"), CancellationToken::new())
            .await;
        assert_eq!(
            response.failure().unwrap().category,
            FailureCategory::Security
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled_not_failure() {
        let (bus, _audit) = test_bus(BusConfig::default());
        bus.register_handler(registration(Arc::new(
            |_req: DispatchRequest, token: CancellationToken| async move {
                token.cancelled().await;
                Response::Cancelled
            },
        )));

        let token = CancellationToken::new();
        let dispatch = bus.dispatch(command_request("alice", "x"), token.clone());
        let cancel = async {
            tokio::task::yield_now().await;
            token.cancel();
        };
        let (response, ()) = tokio::join!(dispatch, cancel);
        assert_eq!(response, Response::Cancelled);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn handler_panic_becomes_system_failure() {
        let (bus, _audit) = test_bus(BusConfig::default());
        bus.register_handler(registration(Arc::new(
            |_req: DispatchRequest, _token: CancellationToken| async move {
                panic!("boom with password=hunter2");
            },
        )));

        let response = bus
            .dispatch(command_request("alice", "x"), CancellationToken::new())
            .await;
        let failure = response.failure().unwrap();
        assert_eq!(failure.category, FailureCategory::System);
        assert_eq!(failure.error_code, "HandlerPanicked");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_surfaces_backpressure() {
        let (bus, _audit) = test_bus(BusConfig {
            workers: 1,
            queue_depth: 1,
            publish_deadline: std::time::Duration::from_millis(20),
            ..BusConfig::default()
        });

        bus.register_handler(registration(Arc::new(
            |_req: DispatchRequest, token: CancellationToken| async move {
                // Park until cancelled so the worker stays occupied.
                token.cancelled().await;
                Response::Cancelled
            },
        )));

        let stall = CancellationToken::new();
        // First message occupies the single worker...
        bus.publish(command_request("alice", "0"), stall.clone())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        // ...second fills the one queue slot...
        bus.publish(command_request("alice", "1"), stall.clone())
            .await
            .unwrap();

        // ...so the third cannot enqueue before the publish deadline.
        let third = bus
            .dispatch(command_request("alice", "2"), stall.clone())
            .await;
        let failure = third.failure().expect("expected backpressure failure");
        assert_eq!(failure.error_code, "BackpressureExceeded");
        assert_eq!(failure.category, FailureCategory::Transient);

        stall.cancel();
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn expired_messages_fail_validation() {
        let (bus, _audit) = test_bus(BusConfig::default());
        bus.register_handler(registration(Arc::new(
            |_req: DispatchRequest, _token: CancellationToken| async move { Response::ok() },
        )));

        let mut env = envelope("alice");
        env.set_expires_at(chrono::Utc::now() - chrono::Duration::seconds(5))
            .unwrap();
        let request = DispatchRequest::command(
            message_type_id(INGEST),
            None,
            Command::new(env, Bytes::new()),
        );

        let response = bus.dispatch(request, CancellationToken::new()).await;
        assert_eq!(response.failure().unwrap().error_code, "Expired");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn events_are_fire_and_forget() {
        let (bus, _audit) = test_bus(BusConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        bus.register_handler(registration(Arc::new(
            move |_req: DispatchRequest, _token: CancellationToken| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Response::ok()
                }
            },
        )));

        let mut events = bus.subscribe();
        let request = DispatchRequest {
            type_id: message_type_id(INGEST),
            name: None,
            envelope: envelope("alice"),
            payload: Bytes::new(),
            shape: MessageShape::Event {
                propagate_cluster: false,
            },
        };
        bus.publish(request, CancellationToken::new()).await.unwrap();

        // The terminal event confirms the handler ran.
        loop {
            match events.recv().await.unwrap() {
                BusEvent::DispatchFinished { state, .. } => {
                    assert_eq!(state, DispatchState::Completed);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        bus.shutdown().await;
    }
}
