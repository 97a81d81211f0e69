//! The plugin host: registry, lifecycle driver and capability publication.

use crate::contract::{HandshakeRequest, HandshakeResponse, HostMode, Plugin, PROTOCOL_VERSION};
use crate::dependency::resolve_start_order;
use crate::descriptor::{HealthStatus, PluginDescriptor, PluginState};
use crate::{PluginError, PluginResult};
use silo_bus::{Handler, HandlerFuture, HandlerRegistration, MessageBus, RouteKey};
use silo_types::{Clock, Event, Failure, Response};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One route a plugin publishes on the bus.
pub struct Capability {
    /// Capability name recorded in the descriptor.
    pub name: String,
    /// Route the handler serves.
    pub route: RouteKey,
    /// Registration priority.
    pub priority: u8,
    /// Whether dispatches should emit a deprecation warning.
    pub deprecated: bool,
    /// The handler; the host wraps it with a lifecycle guard before it
    /// reaches the bus.
    pub handler: Arc<dyn Handler>,
}

/// Host tunables.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory disclosed to plugins at handshake time.
    pub root_path: PathBuf,
    /// Mode disclosed to plugins at handshake time.
    pub mode: HostMode,
    /// How long a stop waits for in-flight dispatches and the run task.
    pub drain_deadline: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("plugins"),
            mode: HostMode::Normal,
            drain_deadline: Duration::from_secs(5),
        }
    }
}

/// Lifecycle notices published on the host event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    /// A plugin completed its handshake.
    Discovered {
        /// Plugin id.
        id: String,
    },
    /// A plugin entered the host registry.
    Loaded {
        /// Plugin id.
        id: String,
    },
    /// A plugin's capabilities published and its run task spawned.
    Started {
        /// Plugin id.
        id: String,
    },
    /// A plugin stopped and withdrew its routes.
    Stopped {
        /// Plugin id.
        id: String,
    },
    /// A plugin was quarantined.
    Failed {
        /// Plugin id.
        id: String,
        /// Why the plugin failed.
        reason: String,
    },
}

struct Managed {
    descriptor: PluginDescriptor,
    plugin: Arc<dyn Plugin>,
    capabilities: Vec<Capability>,
    state: Arc<RwLock<PluginState>>,
    inflight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    run_task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Managed {
    fn state(&self) -> PluginState {
        *self.state.read().expect("plugin state lock poisoned")
    }

    fn transition(&self, to: PluginState) -> PluginResult<()> {
        let mut guard = self.state.write().expect("plugin state lock poisoned");
        if !guard.can_transition(to) {
            return Err(PluginError::InvalidTransition {
                plugin: self.descriptor.id.clone(),
                from: *guard,
                to,
            });
        }
        *guard = to;
        Ok(())
    }

    fn quarantine(&self) {
        *self.state.write().expect("plugin state lock poisoned") = PluginState::Quarantined;
    }
}

/// The plugin host.
///
/// Owns every plugin and every task a plugin spawns through its run hook;
/// nothing outlives a stop. Plugins are keyed by id, and the host registry
/// is the only path from one plugin to another.
pub struct PluginHost {
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    config: HostConfig,
    plugins: tokio::sync::Mutex<HashMap<String, Managed>>,
    events: broadcast::Sender<PluginEvent>,
}

impl PluginHost {
    /// Create a host bound to the given bus.
    pub fn new(bus: Arc<MessageBus>, clock: Arc<dyn Clock>, config: HostConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bus,
            clock,
            config,
            plugins: tokio::sync::Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the host lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    /// Handshake a plugin and admit it to the registry in `Ready` state.
    ///
    /// Returns the plugin id disclosed by the handshake.
    pub async fn install(&self, plugin: Arc<dyn Plugin>) -> PluginResult<String> {
        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION.clone(),
            root_path: self.config.root_path.clone(),
            mode: self.config.mode,
        };

        let response = plugin.handshake(request).await;
        let (id, name, version, protocol_version, category, capabilities, dependencies) =
            match response {
                HandshakeResponse::Success {
                    id,
                    name,
                    version,
                    protocol_version,
                    category,
                    capabilities,
                    dependencies,
                } => (id, name, version, protocol_version, category, capabilities, dependencies),
                HandshakeResponse::Failure { reason } => {
                    return Err(PluginError::HandshakeRejected { reason });
                }
            };

        if protocol_version.major != PROTOCOL_VERSION.major {
            return Err(PluginError::ProtocolMismatch {
                host: PROTOCOL_VERSION.clone(),
                plugin: id,
                offered: protocol_version,
            });
        }

        let _ = self.events.send(PluginEvent::Discovered { id: id.clone() });

        let descriptor = PluginDescriptor {
            id: id.clone(),
            name,
            version,
            category,
            dependencies,
            capabilities: capabilities.iter().map(|c| c.name.clone()).collect(),
            semantic_tags: Vec::new(),
            health: HealthStatus::Healthy,
        };

        let mut plugins = self.plugins.lock().await;
        if plugins.contains_key(&id) {
            return Err(PluginError::AlreadyInstalled(id));
        }

        // Discovered -> Handshaking -> Ready happened inside the handshake
        // call; the registry records the settled state.
        plugins.insert(
            id.clone(),
            Managed {
                descriptor,
                plugin,
                capabilities,
                state: Arc::new(RwLock::new(PluginState::Ready)),
                inflight: Arc::new(AtomicUsize::new(0)),
                cancel: CancellationToken::new(),
                run_task: None,
            },
        );
        drop(plugins);

        info!(plugin = %id, "plugin installed");
        let _ = self.events.send(PluginEvent::Loaded { id: id.clone() });
        Ok(id)
    }

    /// Start every `Ready` plugin in topological dependency order.
    ///
    /// Fails fast: the first plugin that cannot start aborts the sweep,
    /// leaving already-started plugins running.
    pub async fn start_all(&self) -> PluginResult<Vec<String>> {
        let descriptors: Vec<PluginDescriptor> = {
            let plugins = self.plugins.lock().await;
            plugins.values().map(|m| m.descriptor.clone()).collect()
        };
        let order = resolve_start_order(&descriptors)?;

        let mut started = Vec::new();
        for id in order {
            let state = self.state(&id).await.ok_or_else(|| PluginError::Unknown(id.clone()))?;
            if state == PluginState::Ready {
                self.start(&id).await?;
                started.push(id);
            }
        }
        Ok(started)
    }

    /// Start one plugin: publish its capabilities, run the verify gate,
    /// then spawn its run task.
    pub async fn start(&self, id: &str) -> PluginResult<()> {
        let (plugin, capabilities_meta, dependencies) = {
            let mut plugins = self.plugins.lock().await;
            let managed = plugins
                .get_mut(id)
                .ok_or_else(|| PluginError::Unknown(id.to_string()))?;

            if managed.state() != PluginState::Ready {
                return Err(PluginError::InvalidTransition {
                    plugin: id.to_string(),
                    from: managed.state(),
                    to: PluginState::Running,
                });
            }

            // Capability registration is all-or-nothing; the guard shares
            // the plugin's state cell so a stop instantly fences dispatches.
            let registrations: Vec<HandlerRegistration> = managed
                .capabilities
                .iter()
                .map(|capability| HandlerRegistration {
                    owner: id.to_string(),
                    route: capability.route.clone(),
                    priority: capability.priority,
                    deprecated: capability.deprecated,
                    handler: Arc::new(GuardedHandler {
                        state: Arc::clone(&managed.state),
                        inflight: Arc::clone(&managed.inflight),
                        inner: Arc::clone(&capability.handler),
                    }),
                })
                .collect();
            for registration in registrations {
                self.bus.register_handler(registration);
            }

            (
                Arc::clone(&managed.plugin),
                managed.capabilities.len(),
                managed.descriptor.dependencies.clone(),
            )
        };

        // Dependencies must already be running.
        for dependency in &dependencies {
            match self.state(dependency).await {
                Some(PluginState::Running) => {}
                other => {
                    self.bus.unregister_all(id);
                    return Err(PluginError::UnresolvedDependency {
                        plugin: id.to_string(),
                        detail: format!(
                            "dependency '{dependency}' is {}",
                            other.map(|s| s.to_string()).unwrap_or_else(|| "missing".into())
                        ),
                    });
                }
            }
        }

        // Verify gate between registration and start.
        if let Err(reason) = plugin.verify().await {
            self.bus.unregister_all(id);
            let reason = reason.to_string();
            self.fail_plugin(id, &reason).await;
            return Err(PluginError::VerifyFailed {
                plugin: id.to_string(),
                reason,
            });
        }

        {
            let mut plugins = self.plugins.lock().await;
            let managed = plugins
                .get_mut(id)
                .ok_or_else(|| PluginError::Unknown(id.to_string()))?;
            managed.transition(PluginState::Running)?;

            let token = managed.cancel.clone();
            let run_plugin = Arc::clone(&managed.plugin);
            let plugin_id = id.to_string();
            managed.run_task = Some(tokio::spawn(async move {
                let result = run_plugin.start(token).await;
                if let Err(ref error) = result {
                    warn!(plugin = %plugin_id, %error, "plugin run task failed");
                }
                result
            }));
        }

        info!(plugin = %id, capabilities = capabilities_meta, "plugin started");
        let _ = self.events.send(PluginEvent::Started { id: id.to_string() });
        Ok(())
    }

    /// Stop one plugin with a bounded drain.
    ///
    /// New dispatches are fenced with a `PluginStopping` transient failure
    /// the moment the state flips; in-flight dispatches get until the drain
    /// deadline to finish, then the run task is cancelled and joined.
    pub async fn stop(&self, id: &str) -> PluginResult<()> {
        let (inflight, cancel, run_task, plugin) = {
            let mut plugins = self.plugins.lock().await;
            let managed = plugins
                .get_mut(id)
                .ok_or_else(|| PluginError::Unknown(id.to_string()))?;
            managed.transition(PluginState::Stopping)?;
            (
                Arc::clone(&managed.inflight),
                managed.cancel.clone(),
                managed.run_task.take(),
                Arc::clone(&managed.plugin),
            )
        };

        // Bounded drain of in-flight dispatches.
        let drain_started = Instant::now();
        while inflight.load(Ordering::SeqCst) > 0 {
            if drain_started.elapsed() >= self.config.drain_deadline {
                warn!(plugin = %id, pending = inflight.load(Ordering::SeqCst), "drain deadline hit");
                break;
            }
            self.clock.sleep(Duration::from_millis(5)).await;
        }

        self.bus.unregister_all(id);
        cancel.cancel();

        if let Some(mut task) = run_task {
            tokio::select! {
                joined = &mut task => {
                    if let Err(join_error) = joined {
                        warn!(plugin = %id, %join_error, "run task join failed");
                    }
                }
                _ = self.clock.sleep(self.config.drain_deadline) => {
                    warn!(plugin = %id, "run task ignored cancellation, aborting");
                    task.abort();
                }
            }
        }

        if let Err(error) = plugin.stop().await {
            let reason = error.to_string();
            self.fail_plugin(id, &reason).await;
            return Err(PluginError::Lifecycle {
                plugin: id.to_string(),
                source: error,
            });
        }

        {
            let plugins = self.plugins.lock().await;
            if let Some(managed) = plugins.get(id) {
                managed.transition(PluginState::Stopped)?;
            }
        }

        info!(plugin = %id, "plugin stopped");
        let _ = self.events.send(PluginEvent::Stopped { id: id.to_string() });
        Ok(())
    }

    /// Stop every running plugin, dependents before their dependencies.
    pub async fn stop_all(&self) -> PluginResult<()> {
        let descriptors: Vec<PluginDescriptor> = {
            let plugins = self.plugins.lock().await;
            plugins.values().map(|m| m.descriptor.clone()).collect()
        };
        let mut order = resolve_start_order(&descriptors)?;
        order.reverse();

        for id in order {
            if self.state(&id).await == Some(PluginState::Running) {
                self.stop(&id).await?;
            }
        }
        Ok(())
    }

    /// Remove a stopped plugin from the registry.
    pub async fn unload(&self, id: &str) -> PluginResult<()> {
        let mut plugins = self.plugins.lock().await;
        let managed = plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::Unknown(id.to_string()))?;
        managed.transition(PluginState::Unloaded)?;
        plugins.remove(id);
        info!(plugin = %id, "plugin unloaded");
        Ok(())
    }

    /// Deliver a host event to every running plugin's `on_message` hook.
    pub async fn broadcast(&self, event: &Event) {
        let recipients: Vec<(String, Arc<dyn Plugin>)> = {
            let plugins = self.plugins.lock().await;
            plugins
                .values()
                .filter(|m| m.state() == PluginState::Running)
                .map(|m| (m.descriptor.id.clone(), Arc::clone(&m.plugin)))
                .collect()
        };
        for (id, plugin) in recipients {
            if let Err(error) = plugin.on_message(event).await {
                warn!(plugin = %id, %error, "on_message hook failed");
            }
        }
    }

    /// Descriptor of an installed plugin.
    pub async fn descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        self.plugins.lock().await.get(id).map(|m| m.descriptor.clone())
    }

    /// Lifecycle state of an installed plugin.
    pub async fn state(&self, id: &str) -> Option<PluginState> {
        self.plugins.lock().await.get(id).map(|m| m.state())
    }

    async fn fail_plugin(&self, id: &str, reason: &str) {
        let plugins = self.plugins.lock().await;
        if let Some(managed) = plugins.get(id) {
            managed.quarantine();
        }
        drop(plugins);
        let _ = self.events.send(PluginEvent::Failed {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Wraps a capability handler with the owning plugin's lifecycle fence and
/// in-flight accounting.
struct GuardedHandler {
    state: Arc<RwLock<PluginState>>,
    inflight: Arc<AtomicUsize>,
    inner: Arc<dyn Handler>,
}

struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Handler for GuardedHandler {
    fn handle(
        &self,
        request: silo_bus::DispatchRequest,
        token: CancellationToken,
    ) -> HandlerFuture {
        let state = *self.state.read().expect("plugin state lock poisoned");
        if !state.accepts_dispatches() {
            return Box::pin(async move {
                Response::Failure(Failure::transient(
                    "PluginStopping",
                    "target plugin is not accepting dispatches",
                ))
            });
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard(Arc::clone(&self.inflight));
        let future = self.inner.handle(request, token);
        Box::pin(async move {
            let _guard = guard;
            future.await
        })
    }
}
