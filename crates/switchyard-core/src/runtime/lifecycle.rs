//! Runtime lifecycle management including consumer references and graceful shutdown.

use crate::{
    address::{AddressHolder, DIRECT_GROUP},
    config::{AppConfig, ConsumerConfig},
    connection::{holder_for, ConnectionHealthChecker},
    filter::FilterChain,
    invoker::{ClientProxyInvoker, ClusterInvoker},
    regulation::{RegulatedConsumer, RegulationLoop},
    router::RouterChain,
    stat::StatRegistry,
    types::EndpointInfo,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    builder::{DispatchRuntimeBuilder, RuntimeError, RuntimeOptions},
    consumer::AddressSync,
    ConsumerClient, RuntimeComponents,
};

/// Main runtime container managing consumers and background tasks.
///
/// Background tasks (the regulation loop and one connection health checker per consumer)
/// listen on a broadcast channel. [`DispatchRuntime::shutdown`] signals them, waits for them
/// and closes every consumer's connections.
pub struct DispatchRuntime {
    components: RuntimeComponents,
    shutdown_tx: broadcast::Sender<()>,
    config: AppConfig,
    enable_health_checks: bool,
    consumers: DashMap<Arc<str>, Arc<ConsumerClient>>,
    health_tasks: DashMap<Arc<str>, JoinHandle<()>>,
    regulation_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_initiated: AtomicBool,
}

impl DispatchRuntime {
    /// Creates a new builder for constructing a `DispatchRuntime`.
    #[must_use]
    pub fn builder() -> DispatchRuntimeBuilder {
        DispatchRuntimeBuilder::new()
    }

    /// Called by `DispatchRuntimeBuilder` during initialization.
    pub(super) fn new(
        components: RuntimeComponents,
        shutdown_tx: broadcast::Sender<()>,
        config: AppConfig,
        options: RuntimeOptions,
    ) -> Self {
        let regulation_task = components.regulation().map(|regulation| {
            let handle = regulation.start_with_shutdown(shutdown_tx.subscribe());
            debug!("Regulation loop task started");
            handle
        });

        Self {
            components,
            shutdown_tx,
            config,
            enable_health_checks: options.enable_health_checks,
            consumers: DashMap::new(),
            health_tasks: DashMap::new(),
            regulation_task: Mutex::new(regulation_task),
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn components(&self) -> &RuntimeComponents {
        &self.components
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<StatRegistry> {
        self.components.stats()
    }

    #[must_use]
    pub fn regulation(&self) -> Option<&Arc<RegulationLoop>> {
        self.components.regulation()
    }

    #[must_use]
    pub fn consumer(&self, id: &str) -> Option<Arc<ConsumerClient>> {
        self.consumers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<ConsumerClient>> {
        self.consumers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Creates a new shutdown receiver for external shutdown coordination.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// References a service: builds its address holder, connection holder, router chain,
    /// load balancer, filter chain and proxy, and registers it for regulation.
    ///
    /// A `direct_url` is parsed into the `direct` address group before the client is returned.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if the runtime is shutting down, the consumer id is taken, the
    /// config is invalid or an extension alias cannot be resolved.
    pub async fn refer(&self, config: ConsumerConfig) -> Result<Arc<ConsumerClient>, RuntimeError> {
        if self.is_shutting_down() {
            return Err(RuntimeError::ShuttingDown);
        }
        config.validate().map_err(RuntimeError::ConfigValidation)?;
        let id: Arc<str> = Arc::from(config.consumer_id());
        if self.consumers.contains_key(&id) {
            return Err(RuntimeError::DuplicateConsumer(id.to_string()));
        }
        let direct = match config.direct_url.as_deref() {
            Some(raw) => Some(EndpointInfo::parse_list(raw).map_err(|e| {
                RuntimeError::ConfigValidation(format!("consumer {id}: direct_url: {e}"))
            })?),
            None => None,
        };

        let consumer = Arc::new(config);
        let extensions = self.components.extensions();
        let routers = RouterChain::build(&consumer, extensions)?;
        let balancer = extensions.resolve_load_balancer(&consumer.load_balancer)?;
        let holder =
            holder_for(&id, &consumer.connection, Arc::clone(self.components.transport()));
        let addresses = Arc::new(AddressHolder::new());
        addresses.subscribe(Arc::new(AddressSync::new(
            &id,
            Arc::clone(&holder),
            Arc::clone(self.components.stats()),
        )));

        let cluster = ClusterInvoker::new(
            Arc::clone(&consumer),
            routers,
            Arc::clone(&addresses),
            Arc::clone(&holder),
            balancer,
            Arc::clone(self.components.stats()),
        )
        .with_probe_share(self.components.probe_share());
        let chain = FilterChain::build(Arc::clone(&consumer), extensions, Arc::new(cluster))?;
        debug!(consumer = %id, filters = ?chain.aliases(), "Filter chain built");
        let proxy = ClientProxyInvoker::new(Arc::clone(&consumer), Arc::new(chain));

        let client = Arc::new(ConsumerClient::new(consumer, addresses, Arc::clone(&holder), proxy));
        if let Some(direct) = direct {
            client.update_endpoints(DIRECT_GROUP, direct).await;
        }

        // A concurrent refer of the same id may have finished while this one was building.
        let claimed = match self.consumers.entry(Arc::clone(&id)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&client));
                true
            }
        };
        if !claimed {
            client.close().await;
            return Err(RuntimeError::DuplicateConsumer(id.to_string()));
        }

        if let Some(regulation) = self.components.regulation() {
            regulation.register(Arc::clone(&client) as Arc<dyn RegulatedConsumer>);
        }
        if self.enable_health_checks {
            let checker = ConnectionHealthChecker::new(
                &id,
                holder,
                client.config().connection.health_check_interval(),
            );
            let handle = checker.start_with_shutdown(self.shutdown_tx.subscribe());
            self.health_tasks.insert(Arc::clone(&id), handle);
        }

        info!(
            consumer = %id,
            service = %client.config().service,
            holder = ?client.config().connection.holder,
            load_balancer = %client.config().load_balancer,
            "Consumer referenced"
        );
        Ok(client)
    }

    /// References every consumer listed in the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Consumers referenced before it stay referenced.
    pub async fn refer_configured(&self) -> Result<Vec<Arc<ConsumerClient>>, RuntimeError> {
        let mut clients = Vec::with_capacity(self.config.consumers.len());
        for consumer in self.config.consumers.clone() {
            clients.push(self.refer(consumer).await?);
        }
        Ok(clients)
    }

    /// Drops a consumer: stops its health checker, unregisters it from regulation, rejects
    /// further calls and closes its connections.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownConsumer`] if nothing is referenced under `id`.
    pub async fn unrefer(&self, id: &str) -> Result<(), RuntimeError> {
        let (_, client) =
            self.consumers.remove(id).ok_or_else(|| RuntimeError::UnknownConsumer(id.to_string()))?;
        if let Some((_, handle)) = self.health_tasks.remove(id) {
            handle.abort();
        }
        if let Some(regulation) = self.components.regulation() {
            regulation.unregister(id);
        }
        client.close().await;
        self.components.stats().remove_consumer(id);
        info!(consumer = id, "Consumer unreferenced");
        Ok(())
    }

    /// Initiates graceful shutdown.
    ///
    /// Broadcasts the shutdown signal, waits for background tasks, then closes every consumer.
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Shutdown already initiated, ignoring duplicate call");
            return;
        }

        info!("Initiating dispatch runtime shutdown");
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!(error = %e, "No background task was listening for shutdown");
        }

        let regulation_task = self.regulation_task.lock().take();
        if let Some(task) = regulation_task {
            await_task("regulation loop", task).await;
        }
        let health_keys: Vec<Arc<str>> =
            self.health_tasks.iter().map(|entry| Arc::clone(entry.key())).collect();
        for key in health_keys {
            if let Some((_, task)) = self.health_tasks.remove(&key) {
                await_task("connection health checker", task).await;
            }
        }

        for client in self.consumers() {
            client.close().await;
        }
        info!(consumers = self.consumers.len(), "Dispatch runtime shutdown complete");
    }

    /// Waits for a shutdown signal from another holder of the channel, then shuts down.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("Shutdown signal received, runtime terminating");
        self.shutdown().await;
    }
}

async fn await_task(name: &str, task: JoinHandle<()>) {
    match task.await {
        Ok(()) => debug!(task = name, "Background task completed"),
        Err(e) if e.is_cancelled() => debug!(task = name, "Background task cancelled"),
        Err(e) => error!(task = name, error = %e, "Background task failed"),
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<DispatchRuntime>;
    let _ = assert_sync::<DispatchRuntime>;
};
