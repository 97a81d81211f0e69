//! Bridges the ACL engine into the bus access-control stage.

use silo_acl::{AclEngine, Permission};
use silo_bus::{AccessPolicy, DispatchRequest, MessageShape};
use silo_types::Failure;
use std::sync::Arc;

/// Access policy evaluating bus routes against the ACL engine.
///
/// Routes map to resource paths under `bus/`: `bus/<type id in hex>` or
/// `bus/<type id>/<name>`. Commands and events require `WRITE`, queries
/// require `READ`. Hosts that want coarser or finer resources grant at the
/// `bus` prefix or at full route paths respectively.
pub struct AclRoutePolicy {
    engine: Arc<AclEngine>,
}

impl AclRoutePolicy {
    /// Wrap an ACL engine.
    pub fn new(engine: Arc<AclEngine>) -> Self {
        Self { engine }
    }

    /// The resource path a dispatch is evaluated against.
    pub fn resource_path(request: &DispatchRequest) -> String {
        match &request.name {
            Some(name) => format!("bus/{:x}/{name}", request.type_id),
            None => format!("bus/{:x}", request.type_id),
        }
    }
}

impl AccessPolicy for AclRoutePolicy {
    fn authorize(&self, request: &DispatchRequest) -> Result<(), Failure> {
        let required = match request.shape {
            MessageShape::Query => Permission::READ,
            MessageShape::Command { .. } | MessageShape::Event { .. } => Permission::WRITE,
        };
        self.engine.check_access(
            &Self::resource_path(request),
            request.envelope.sender(),
            required,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use silo_types::{Envelope, PrincipalId, TraceContext};

    fn request(sender: &str, shape: MessageShape) -> DispatchRequest {
        DispatchRequest {
            type_id: 0xbeef,
            name: None,
            envelope: Envelope::new(
                PrincipalId::from(sender),
                TraceContext::new(3, 3, false),
                chrono::Utc::now(),
            ),
            payload: Bytes::new(),
            shape,
        }
    }

    #[tokio::test]
    async fn queries_need_read_commands_need_write() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(AclEngine::open(dir.path()).await.unwrap());
        engine.allow("bus", "reader", Permission::READ).await.unwrap();
        let policy = AclRoutePolicy::new(engine);

        assert!(policy.authorize(&request("reader", MessageShape::Query)).is_ok());
        let denied = policy
            .authorize(&request(
                "reader",
                MessageShape::Command {
                    idempotency_key: None,
                    deadline: None,
                },
            ))
            .unwrap_err();
        assert_eq!(denied.error_code, "Unauthorized");
    }
}
