//! The extension manager: owns the extension table, orchestrates the
//! dependency-ordered lifecycle, exposes lookups, and serializes teardown.
//!
//! Phase order: `pre_init` over all extensions, then `init`, then
//! `post_init`, each in topological order. Phase failures are collected,
//! not aborting; an extension that failed one phase is not advanced
//! through later ones.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerPolicy, BreakerRegistry, BreakerSnapshot, CircuitBreaker};
use crate::config::{ExtensionConfig, GrpcConfig};
use crate::contracts::{
    Broker, CallCtx, DataBackend, DiscoveryRegistry, Extension, ExtensionCtx, ExtensionMetadata,
    GrpcClientRegistry, GrpcServiceReg, Service,
};
use crate::cross_service::{CallOptions, CallResult, CrossServiceRegistry, ServiceDispatcher};
use crate::errors::ExtensionError;
use crate::events::EventDispatcher;
use crate::loader::PluginLoader;
use crate::metrics::{Metrics, MetricsCollector, MetricsSink, MetricsSnapshot};
use crate::registry;
use crate::task::{run_caught, spawn_detached, with_timeout};

const INIT_UMBRELLA_TIMEOUT: Duration = Duration::from_secs(300);
const PRE_INIT_TIMEOUT: Duration = Duration::from_secs(30);
const INIT_TIMEOUT: Duration = Duration::from_secs(120);
const POST_INIT_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-extension lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Unregistered,
    Registered,
    Initializing,
    Active,
    Error,
    Stopping,
    Stopped,
}

/// Pairs a metadata snapshot with the live instance.
pub struct ExtensionWrapper {
    metadata: ExtensionMetadata,
    instance: Arc<dyn Extension>,
    status: RwLock<ExtensionStatus>,
}

impl ExtensionWrapper {
    fn new(instance: Arc<dyn Extension>) -> Self {
        Self {
            metadata: instance.metadata(),
            instance,
            status: RwLock::new(ExtensionStatus::Registered),
        }
    }

    pub fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    pub fn instance(&self) -> &Arc<dyn Extension> {
        &self.instance
    }

    pub fn status(&self) -> ExtensionStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: ExtensionStatus) {
        *self.status.write() = status;
    }
}

struct ManagerState {
    wrappers: HashMap<String, Arc<ExtensionWrapper>>,
    /// Topological order computed by the last successful dependency check.
    order: Vec<String>,
    initialized: bool,
}

/// Collaborator handles and configuration handed to [`ExtensionManager::new`].
#[derive(Default)]
pub struct ManagerOptions {
    pub config: ExtensionConfig,
    pub grpc: GrpcConfig,
    /// Per-extension config bags, keyed by extension name.
    pub settings: HashMap<String, Value>,
    pub broker: Option<Arc<dyn Broker>>,
    pub grpc_clients: Option<Arc<dyn GrpcClientRegistry>>,
    pub discovery: Option<Arc<dyn DiscoveryRegistry>>,
    pub data_layer: Option<Arc<dyn DataBackend>>,
    pub metrics_sink: Option<Arc<dyn MetricsSink>>,
}

pub struct ExtensionManager {
    state: RwLock<ManagerState>,
    config: ExtensionConfig,
    grpc_config: GrpcConfig,
    settings: HashMap<String, Value>,

    cross_services: Arc<CrossServiceRegistry>,
    handlers: Arc<CrossServiceRegistry>,
    dispatcher: ServiceDispatcher,
    events: Arc<EventDispatcher>,
    breakers: BreakerRegistry,
    metrics: Arc<Metrics>,
    collector: MetricsCollector,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    loader: PluginLoader,

    discovery: RwLock<Option<Arc<dyn DiscoveryRegistry>>>,
    data_layer: Mutex<Option<Arc<dyn DataBackend>>>,
    grpc_services: Mutex<Vec<GrpcServiceReg>>,

    cancel: CancellationToken,
    weak: Weak<Self>,
}

impl ExtensionManager {
    pub fn new(opts: ManagerOptions) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let cross_services = Arc::new(CrossServiceRegistry::new());
        let events = Arc::new(EventDispatcher::new(metrics.clone()));
        events.set_broker(opts.broker);

        let dispatcher = ServiceDispatcher::new(cross_services.clone(), metrics.clone());
        dispatcher.set_grpc_registry(opts.grpc_clients);

        let collector = MetricsCollector::new(
            metrics.clone(),
            opts.config.metrics.retention,
            opts.config.metrics.batch_size,
        );

        Arc::new_cyclic(|weak| Self {
            state: RwLock::new(ManagerState {
                wrappers: HashMap::new(),
                order: Vec::new(),
                initialized: false,
            }),
            loader: PluginLoader::new(opts.config.clone()),
            config: opts.config,
            grpc_config: opts.grpc,
            settings: opts.settings,
            cross_services,
            handlers: Arc::new(CrossServiceRegistry::new()),
            dispatcher,
            events,
            breakers: BreakerRegistry::new(BreakerPolicy::default(), metrics.clone()),
            collector,
            metrics_sink: opts.metrics_sink,
            metrics,
            discovery: RwLock::new(opts.discovery),
            data_layer: Mutex::new(opts.data_layer),
            grpc_services: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &ExtensionConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_security_policy(&self, policy: Option<Arc<dyn crate::loader::SecurityPolicy>>) {
        self.loader.set_security_policy(policy);
    }

    pub fn set_resource_monitor(&self, monitor: Option<Arc<dyn crate::loader::ResourceMonitor>>) {
        self.loader.set_resource_monitor(monitor);
    }

    /* ------------------------- registration ------------------------- */

    /// Add an extension to the table. Refused once initialization has
    /// completed; plugin loading is the door after that.
    pub fn register_extension(&self, instance: Arc<dyn Extension>) -> Result<(), ExtensionError> {
        let mut state = self.state.write();
        if state.initialized {
            return Err(ExtensionError::PostInitialized);
        }
        let name = instance.name().to_string();
        if state.wrappers.contains_key(&name) {
            return Err(ExtensionError::AlreadyRegistered(name));
        }
        tracing::debug!(extension = %name, "extension registered");
        state
            .wrappers
            .insert(name, Arc::new(ExtensionWrapper::new(instance)));
        self.metrics.incr("extensions_registered_total");
        Ok(())
    }

    /// Insert a wrapper after init, used by the plugin loader.
    pub(crate) fn insert_loaded(
        &self,
        instance: Arc<dyn Extension>,
    ) -> Result<Arc<ExtensionWrapper>, ExtensionError> {
        let mut state = self.state.write();
        let name = instance.name().to_string();
        if state.wrappers.contains_key(&name) {
            return Err(ExtensionError::AlreadyRegistered(name));
        }
        let wrapper = Arc::new(ExtensionWrapper::new(instance));
        state.wrappers.insert(name.clone(), wrapper.clone());
        state.order.push(name);
        Ok(wrapper)
    }

    pub(crate) fn remove_wrapper(&self, name: &str) -> Option<Arc<ExtensionWrapper>> {
        let mut state = self.state.write();
        state.order.retain(|n| n != name);
        state.wrappers.remove(name)
    }

    pub fn extension_count(&self) -> usize {
        self.state.read().wrappers.len()
    }

    /* ------------------------- initialization ----------------------- */

    /// Run the full three-phase initialization over the dependency order.
    pub async fn init_extensions(self: &Arc<Self>) -> Result<(), ExtensionError> {
        if self.state.read().initialized {
            tracing::warn!("init_extensions called twice; ignoring");
            return Ok(());
        }
        with_timeout("init_extensions", INIT_UMBRELLA_TIMEOUT, self.init_inner()).await?
    }

    async fn init_inner(self: &Arc<Self>) -> Result<(), ExtensionError> {
        // Merge discovered extensions (compiled-in registry or plugin
        // directory, include/exclude filtered) before the dependency check.
        for ext in self.loader.resolve_startup_instances()? {
            match self.register_extension(ext) {
                Ok(()) | Err(ExtensionError::AlreadyRegistered(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let deps: HashMap<String, Vec<String>> = {
            let state = self.state.read();
            state
                .wrappers
                .values()
                .map(|w| (w.metadata.name.clone(), w.metadata.dependencies.clone()))
                .collect()
        };
        let order = registry::resolve_order(&deps)?;
        tracing::info!(order = ?order, "extension dependency order resolved");

        let wrappers: Vec<Arc<ExtensionWrapper>> = {
            let mut state = self.state.write();
            state.order = order.clone();
            order
                .iter()
                .filter_map(|n| state.wrappers.get(n).cloned())
                .collect()
        };

        let mut failures: Vec<ExtensionError> = Vec::new();

        // Phase 1: pre_init
        for w in &wrappers {
            w.set_status(ExtensionStatus::Initializing);
            let inst = w.instance.clone();
            if let Err(source) = Self::run_hook(PRE_INIT_TIMEOUT, "pre_init", async move {
                inst.pre_init().await
            })
            .await
            {
                tracing::error!(extension = %w.metadata.name, error = %source, "pre_init failed");
                w.set_status(ExtensionStatus::Error);
                failures.push(ExtensionError::PreInit {
                    module: w.metadata.name.clone(),
                    source,
                });
            }
        }

        // Phase 2: init
        for w in &wrappers {
            if w.status() == ExtensionStatus::Error {
                continue;
            }
            let inst = w.instance.clone();
            let ctx = self.extension_ctx(&w.metadata.name);
            if let Err(source) = Self::run_hook(INIT_TIMEOUT, "init", async move {
                inst.init(&ctx).await
            })
            .await
            {
                tracing::error!(extension = %w.metadata.name, error = %source, "init failed");
                w.set_status(ExtensionStatus::Error);
                failures.push(ExtensionError::Init {
                    module: w.metadata.name.clone(),
                    source,
                });
            }
        }

        // Phase 3: post_init; successes become Active and announce ready.
        for w in &wrappers {
            if w.status() == ExtensionStatus::Error {
                continue;
            }
            let inst = w.instance.clone();
            match Self::run_hook(POST_INIT_TIMEOUT, "post_init", async move {
                inst.post_init().await
            })
            .await
            {
                Ok(()) => {
                    self.wire_extension(w);
                    w.set_status(ExtensionStatus::Active);
                    self.metrics.incr("extensions_initialized_total");
                    self.events
                        .publish(
                            &format!("exts.{}.ready", w.metadata.name),
                            json!({"name": w.metadata.name}),
                        )
                        .await;
                }
                Err(source) => {
                    tracing::error!(extension = %w.metadata.name, error = %source, "post_init failed");
                    w.set_status(ExtensionStatus::Error);
                    failures.push(ExtensionError::PostInit {
                        module: w.metadata.name.clone(),
                        source,
                    });
                }
            }
        }

        if !failures.is_empty() {
            self.metrics
                .incr_by("extension_init_failures_total", failures.len() as u64);
            self.rollback_initializing(&wrappers).await;
            return Err(ExtensionError::PhaseFailed { errors: failures });
        }

        self.start_optional_services(&wrappers).await;

        self.state.write().initialized = true;
        self.metrics
            .gauge_set("extensions_active", wrappers.len() as i64);
        self.events
            .publish(
                "exts.all.initialized",
                json!({"status": "completed", "count": wrappers.len()}),
            )
            .await;
        tracing::info!(count = wrappers.len(), "all extensions initialized");
        Ok(())
    }

    async fn run_hook<F>(
        timeout: Duration,
        what: &str,
        fut: F,
    ) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        match with_timeout(what, timeout, run_caught(fut)).await {
            Ok(result) => result,
            Err(timeout_err) => Err(anyhow::Error::from(timeout_err)),
        }
    }

    pub(crate) fn extension_ctx(&self, name: &str) -> ExtensionCtx {
        ExtensionCtx::new(
            name.to_string(),
            self.settings.get(name).cloned().unwrap_or(Value::Null),
            self.cancel.child_token(),
            self.weak.clone(),
        )
    }

    /// Register services/handlers/subscriptions for one extension.
    pub(crate) fn wire_extension(&self, wrapper: &ExtensionWrapper) {
        let name = &wrapper.metadata.name;
        self.cross_services
            .rebuild_extension(name, &wrapper.instance.services());
        self.handlers
            .rebuild_extension(name, &wrapper.instance.handlers());
        for (event, handler) in wrapper.instance.subscriber().into_entries() {
            self.events.subscribe(event, handler);
        }
    }

    async fn rollback_initializing(&self, wrappers: &[Arc<ExtensionWrapper>]) {
        for w in wrappers.iter().rev() {
            if w.status() != ExtensionStatus::Initializing {
                continue;
            }
            tracing::warn!(extension = %w.metadata.name, "rolling back partial init");
            let inst = w.instance.clone();
            if let Err(e) =
                Self::run_hook(CLEANUP_TIMEOUT, "cleanup", async move { inst.cleanup().await })
                    .await
            {
                tracing::warn!(extension = %w.metadata.name, error = %e, "rollback cleanup failed");
            }
            w.set_status(ExtensionStatus::Stopped);
        }
    }

    /// Bring up optional services. gRPC collection and discovery
    /// registration are detached; their failures demote to warnings.
    async fn start_optional_services(self: &Arc<Self>, wrappers: &[Arc<ExtensionWrapper>]) {
        if self.config.metrics.enabled {
            self.collector.start(
                &self.cancel,
                self.config.metrics.flush_interval,
                self.metrics_sink.clone(),
            );
        }

        if self.grpc_config.enabled {
            let manager = self.weak.clone();
            spawn_detached("grpc_bringup", &self.cancel, Duration::from_secs(5), async move {
                let Some(manager) = manager.upgrade() else {
                    return Ok(());
                };
                let mut collected = Vec::new();
                for w in manager.wrappers_snapshot() {
                    if let Some(registrar) = w.instance.as_grpc() {
                        collected.extend(registrar.grpc_services());
                    }
                }
                let count = collected.len();
                *manager.grpc_services.lock() = collected;
                tracing::info!(count, "gRPC service registrations collected");
                Ok(())
            });
        }

        let discovery = self.discovery.read().clone();
        if let Some(discovery) = discovery {
            let infos: Vec<_> = wrappers
                .iter()
                .filter(|w| w.instance.needs_service_discovery())
                .filter_map(|w| w.instance.service_info())
                .collect();
            if !infos.is_empty() {
                spawn_detached(
                    "discovery_register",
                    &self.cancel,
                    Duration::from_secs(5),
                    async move {
                        for info in infos {
                            if let Err(e) = discovery.register(&info).await {
                                tracing::warn!(service = %info.name, error = %e, "discovery registration failed");
                            }
                        }
                        Ok(())
                    },
                );
            }
        }
    }

    /* --------------------------- lookups ---------------------------- */

    pub fn is_fully_initialized(&self) -> bool {
        let state = self.state.read();
        state.initialized
            && state
                .wrappers
                .values()
                .all(|w| w.status() == ExtensionStatus::Active)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn get_extension_by_name(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.state
            .read()
            .wrappers
            .get(name)
            .map(|w| w.instance.clone())
    }

    pub(crate) fn get_wrapper(&self, name: &str) -> Option<Arc<ExtensionWrapper>> {
        self.state.read().wrappers.get(name).cloned()
    }

    fn wrappers_snapshot(&self) -> Vec<Arc<ExtensionWrapper>> {
        self.state.read().wrappers.values().cloned().collect()
    }

    pub fn list_extensions(&self) -> Vec<ExtensionMetadata> {
        let mut out: Vec<_> = self
            .state
            .read()
            .wrappers
            .values()
            .map(|w| w.metadata.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Group -> extension names, backing the admin listing.
    pub fn list_extensions_grouped(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for meta in self.list_extensions() {
            grouped.entry(meta.group.clone()).or_default().push(meta.name);
        }
        grouped
    }

    pub fn get_metadata(&self, name: &str) -> Option<ExtensionMetadata> {
        self.state
            .read()
            .wrappers
            .get(name)
            .map(|w| w.metadata.clone())
    }

    pub fn get_status(&self, name: &str) -> Option<ExtensionStatus> {
        self.state.read().wrappers.get(name).map(|w| w.status())
    }

    pub fn status_report(&self) -> BTreeMap<String, ExtensionStatus> {
        self.state
            .read()
            .wrappers
            .iter()
            .map(|(n, w)| (n.clone(), w.status()))
            .collect()
    }

    /// Resolve a service: dotted names walk the cross-service table, bare
    /// names resolve through the owning extension's single service.
    pub fn get_service_by_name(&self, name: &str) -> Option<Arc<dyn Service>> {
        if let Some((extension, path)) = name.split_once('.') {
            return self.cross_services.resolve(extension, path);
        }
        let mut services = self.cross_services.services_of(name);
        if services.len() == 1 {
            return services.pop().map(|(_, s)| s);
        }
        None
    }

    pub fn list_services(&self) -> Vec<String> {
        self.cross_services.keys()
    }

    pub fn get_handler_by_name(&self, name: &str) -> Option<Arc<dyn Service>> {
        if let Some((extension, path)) = name.split_once('.') {
            return self.handlers.resolve(extension, path);
        }
        let mut handlers = self.handlers.services_of(name);
        if handlers.len() == 1 {
            return handlers.pop().map(|(_, s)| s);
        }
        None
    }

    pub fn list_handlers(&self) -> Vec<String> {
        self.handlers.keys()
    }

    /// Rebuild the cross-service and handler tables from live wrappers.
    pub fn refresh_cross_services(&self) {
        for w in self.wrappers_snapshot() {
            self.cross_services
                .rebuild_extension(&w.metadata.name, &w.instance.services());
            self.handlers
                .rebuild_extension(&w.metadata.name, &w.instance.handlers());
        }
    }

    pub fn get_cross_service(&self, extension: &str, path: &str) -> Option<Arc<dyn Service>> {
        self.cross_services.resolve(extension, path)
    }

    pub fn cross_service_keys(&self) -> Vec<String> {
        self.cross_services.keys()
    }

    /* ------------------------- call dispatch ------------------------ */

    /// Unified service call: circuit breaker, strategy routing, metrics.
    pub async fn call_service(
        &self,
        ctx: &CallCtx,
        service: &str,
        method: &str,
        request: Value,
        opts: CallOptions,
    ) -> CallResult {
        let extension = service.split('.').next().unwrap_or(service).to_string();
        let breaker = self.breakers.get_or_create(&extension);

        if let Err(e) = breaker.admit() {
            return CallResult {
                response: None,
                error: Some(e.to_string()),
                is_local: false,
                is_remote: false,
                duration: Duration::ZERO,
            };
        }

        let fallback = self.get_service_by_name(service);
        let result = self
            .dispatcher
            .call(ctx, service, method, request, &opts, fallback)
            .await;

        if result.is_ok() {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        result
    }

    /// Run arbitrary work under an extension's breaker. The breaker must
    /// already exist; absence means the extension was never routed.
    pub async fn execute_with_circuit_breaker<T, F>(
        &self,
        name: &str,
        fut: F,
    ) -> Result<T, ExtensionError>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let breaker = self
            .breakers
            .get(name)
            .ok_or_else(|| ExtensionError::NotFound(format!("circuit breaker '{name}'")))?;
        breaker.call(fut).await
    }

    pub fn register_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(name)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn breaker_count(&self) -> usize {
        self.breakers.len()
    }

    /* --------------------------- events ----------------------------- */

    pub fn subscribe(&self, event: impl Into<String>, handler: crate::contracts::EventHandler) {
        self.events.subscribe(event, handler);
    }

    pub async fn publish_event(&self, event_type: &str, data: Value) {
        self.events.publish(event_type, data).await;
    }

    pub async fn publish_event_with_retry(&self, event_type: &str, data: Value, retries: u32) {
        self.events
            .publish_with_retry(event_type, data, None, retries)
            .await;
    }

    /* --------------------------- plugins ---------------------------- */

    pub async fn load_plugin(self: &Arc<Self>, name: &str) -> Result<(), ExtensionError> {
        self.loader.load(self, name).await
    }

    pub async fn unload_plugin(self: &Arc<Self>, name: &str) -> Result<(), ExtensionError> {
        self.loader.unload(self, name).await
    }

    pub async fn reload_plugin(self: &Arc<Self>, name: &str) -> Result<(), ExtensionError> {
        self.loader.reload(self, name).await
    }

    /// Cross-service cleanup shared by unload and teardown.
    pub(crate) async fn deregister_extension_facets(&self, name: &str) {
        self.cross_services.remove_extension(name);
        self.handlers.remove_extension(name);
        self.breakers.remove(name);
        let discovery = self.discovery.read().clone();
        if let Some(discovery) = discovery {
            if let Err(e) = discovery.deregister(name).await {
                tracing::warn!(extension = %name, error = %e, "discovery deregistration failed");
            }
        }
    }

    /* --------------------------- metrics ---------------------------- */

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_history(&self) -> Vec<MetricsSnapshot> {
        self.collector.history()
    }

    /* --------------------------- teardown --------------------------- */

    /// Tear the whole graph down: cancel background work, stop the metrics
    /// collector, deregister discovery, run extension cleanup hooks in
    /// reverse order, reset every table, and close the data layer last.
    ///
    /// A second call is a no-op.
    pub async fn cleanup(&self) {
        self.cancel.cancel();
        self.collector.stop();

        let (wrappers, order) = {
            let state = self.state.read();
            let mut order = state.order.clone();
            if order.is_empty() {
                order = state.wrappers.keys().cloned().collect();
                order.sort();
            }
            (state.wrappers.clone(), order)
        };

        if !wrappers.is_empty() {
            tracing::info!(count = wrappers.len(), "cleaning up extensions");
        }

        *self.grpc_services.lock() = Vec::new();

        for name in order.iter().rev() {
            let Some(w) = wrappers.get(name) else { continue };
            w.set_status(ExtensionStatus::Stopping);

            let inst = w.instance.clone();
            if let Err(e) = Self::run_hook(CLEANUP_TIMEOUT, "pre_cleanup", async move {
                inst.pre_cleanup().await
            })
            .await
            {
                tracing::warn!(extension = %name, error = %e, "pre_cleanup failed");
            }

            let inst = w.instance.clone();
            if let Err(e) =
                Self::run_hook(CLEANUP_TIMEOUT, "cleanup", async move { inst.cleanup().await })
                    .await
            {
                tracing::error!(extension = %name, error = %e, "cleanup failed");
            }
            self.deregister_extension_facets(name).await;
            w.set_status(ExtensionStatus::Stopped);
        }

        self.events.clear_subscribers();
        self.cross_services.clear();
        self.handlers.clear();
        self.breakers.clear();
        self.metrics.gauge_set("extensions_active", 0);

        {
            let mut state = self.state.write();
            state.wrappers.clear();
            state.order.clear();
            state.initialized = false;
        }

        // Data connections close last.
        let data_layer = self.data_layer.lock().take();
        if let Some(data) = data_layer {
            for e in data.close().await {
                tracing::warn!(error = %e, "data layer close error");
            }
        }
        tracing::info!("extension manager cleanup complete");
    }
}
