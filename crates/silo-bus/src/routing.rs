//! The handler registry.
//!
//! One handler is active per `(type id, logical name)` route. Registrations
//! carry a priority: a later registration with a higher priority supersedes
//! the active one, and removing it reactivates the next best (priority
//! descending, then registration order ascending). Route lookups are
//! wait-free: readers clone an `Arc` snapshot of the table while all writes
//! funnel through the registry's single writer lock.

use crate::request::DispatchRequest;
use silo_types::Response;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Route key: stable type id plus optional logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// FNV-1a id of the canonical payload type name.
    pub type_id: u64,
    /// Optional logical name refining the route.
    pub name: Option<String>,
}

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A message handler.
///
/// Handlers receive the full dispatch request and the dispatch's
/// cancellation token, and return a [`Response`]; failures travel inside
/// the response rather than as panics.
pub trait Handler: Send + Sync {
    /// Handle one dispatch.
    fn handle(&self, request: DispatchRequest, token: CancellationToken) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(DispatchRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(&self, request: DispatchRequest, token: CancellationToken) -> HandlerFuture {
        Box::pin(self(request, token))
    }
}

/// One handler registration.
#[derive(Clone)]
pub struct HandlerRegistration {
    /// Identifier of the owning component (plugin id, subsystem name).
    pub owner: String,
    /// Route this handler serves.
    pub route: RouteKey,
    /// Priority; higher supersedes lower.
    pub priority: u8,
    /// Whether dispatches to this route should emit a deprecation warning.
    pub deprecated: bool,
    /// The handler itself.
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("owner", &self.owner)
            .field("route", &self.route)
            .field("priority", &self.priority)
            .field("deprecated", &self.deprecated)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Ranked {
    registration: HandlerRegistration,
    sequence: u64,
}

type RouteTable = HashMap<RouteKey, Vec<Ranked>>;

/// The shared route registry.
#[derive(Default)]
pub struct HandlerRegistry {
    table: RwLock<Arc<RouteTable>>,
    sequence: std::sync::atomic::AtomicU64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns whether it became the active one.
    pub fn register(&self, registration: HandlerRegistration) -> bool {
        let sequence = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let route = registration.route.clone();
        let priority = registration.priority;

        let mut guard = self.table.write().expect("route table lock poisoned");
        let mut next = (**guard).clone();
        let slot = next.entry(route.clone()).or_default();
        slot.push(Ranked {
            registration,
            sequence,
        });
        // Active handler first: priority descending, then registration
        // order ascending as the deterministic tie-break.
        slot.sort_by(|a, b| {
            b.registration
                .priority
                .cmp(&a.registration.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        let active = slot[0].sequence == sequence && slot[0].registration.priority == priority;
        *guard = Arc::new(next);
        debug!(?route, priority, active, "handler registered");
        active
    }

    /// Remove every registration owned by `owner`.
    ///
    /// Routes whose active handler belonged to the owner fall back to the
    /// next best registration, or disappear entirely.
    pub fn unregister_all(&self, owner: &str) {
        let mut guard = self.table.write().expect("route table lock poisoned");
        let mut next = (**guard).clone();
        next.retain(|_, slot| {
            slot.retain(|ranked| ranked.registration.owner != owner);
            !slot.is_empty()
        });
        *guard = Arc::new(next);
        debug!(owner, "handler registrations removed");
    }

    /// Resolve the active handler for a route.
    ///
    /// Readers resolve against an immutable snapshot; concurrent writes
    /// never block a lookup.
    pub fn resolve(&self, route: &RouteKey) -> Option<HandlerRegistration> {
        let snapshot = Arc::clone(&self.table.read().expect("route table lock poisoned"));
        snapshot
            .get(route)
            .and_then(|slot| slot.first())
            .map(|ranked| ranked.registration.clone())
    }

    /// Number of routes with at least one registration.
    pub fn route_count(&self) -> usize {
        self.table.read().expect("route table lock poisoned").len()
    }

    /// Whether the owner has any registration.
    pub fn has_owner(&self, owner: &str) -> bool {
        let snapshot = Arc::clone(&self.table.read().expect("route table lock poisoned"));
        snapshot
            .values()
            .any(|slot| slot.iter().any(|r| r.registration.owner == owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_types::Response;

    fn registration(owner: &str, type_id: u64, priority: u8) -> HandlerRegistration {
        let marker = owner.to_string();
        HandlerRegistration {
            owner: owner.to_string(),
            route: RouteKey {
                type_id,
                name: None,
            },
            priority,
            deprecated: false,
            handler: Arc::new(
                move |_req: DispatchRequest, _token: CancellationToken| {
                    let marker = marker.clone();
                    async move { Response::with_payload(bytes::Bytes::from(marker.into_bytes())) }
                },
            ),
        }
    }

    fn active_owner(registry: &HandlerRegistry, type_id: u64) -> Option<String> {
        registry
            .resolve(&RouteKey {
                type_id,
                name: None,
            })
            .map(|r| r.owner)
    }

    #[test]
    fn higher_priority_supersedes() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(registration("low", 1, 10)));
        assert!(registry.register(registration("high", 1, 20)));
        assert_eq!(active_owner(&registry, 1).as_deref(), Some("high"));
    }

    #[test]
    fn equal_priority_keeps_the_earlier_registration() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(registration("first", 1, 10)));
        assert!(!registry.register(registration("second", 1, 10)));
        assert_eq!(active_owner(&registry, 1).as_deref(), Some("first"));
    }

    #[test]
    fn unregister_falls_back_to_next_best() {
        let registry = HandlerRegistry::new();
        registry.register(registration("a", 1, 10));
        registry.register(registration("b", 1, 20));
        registry.unregister_all("b");
        assert_eq!(active_owner(&registry, 1).as_deref(), Some("a"));

        registry.unregister_all("a");
        assert!(active_owner(&registry, 1).is_none());
        assert_eq!(registry.route_count(), 0);
    }

    #[test]
    fn names_partition_the_route_space() {
        let registry = HandlerRegistry::new();
        let mut named = registration("n", 1, 10);
        named.route.name = Some("special".into());
        registry.register(named);
        registry.register(registration("plain", 1, 10));

        assert_eq!(active_owner(&registry, 1).as_deref(), Some("plain"));
        assert_eq!(
            registry
                .resolve(&RouteKey {
                    type_id: 1,
                    name: Some("special".into())
                })
                .map(|r| r.owner)
                .as_deref(),
            Some("n")
        );
    }
}
