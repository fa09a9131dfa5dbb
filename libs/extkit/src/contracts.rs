use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::events::EventData;

/// Classification of a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Core,
    Business,
    Plugin,
    Direct,
    Custom,
}

/// Immutable metadata snapshot taken at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    pub name: String,
    pub version: String,
    pub kind: ExtensionKind,
    pub group: String,
    pub dependencies: Vec<String>,
}

/// Service-discovery registration payload for extensions that want it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Request-scoped values that must survive into detached work.
///
/// Cancellation is deliberately NOT part of this type: a finished request
/// must not poison background tasks spawned on its behalf.
#[derive(Debug, Clone, Default)]
pub struct CallCtx {
    pub request_id: Option<String>,
    pub values: BTreeMap<String, String>,
}

impl CallCtx {
    pub fn with_request_id(id: impl Into<String>) -> Self {
        Self {
            request_id: Some(id.into()),
            values: BTreeMap::new(),
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// A callable unit exposed by an extension.
///
/// Replaces runtime reflection with an explicit dispatch seam: the manager
/// routes `call_service` invocations here by method name, and walks nested
/// dotted paths through `subservice`.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn call(&self, ctx: &CallCtx, method: &str, request: Value) -> anyhow::Result<Value>;

    /// Method names this service answers to. Used to pick a target when the
    /// caller addressed the extension rather than a specific field.
    fn methods(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Resolve one step of a dotted cross-service path.
    fn subservice(&self, _name: &str) -> Option<Arc<dyn Service>> {
        None
    }
}

/// Named set of services (or handlers) an extension exposes.
///
/// Iteration order is the key order, which keeps cross-service rebuilds
/// deterministic.
#[derive(Default, Clone)]
pub struct ServiceSet {
    entries: BTreeMap<String, Arc<dyn Service>>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        self.entries.insert(name.into(), service);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, service: Arc<dyn Service>) {
        self.entries.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Service>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Async handler invoked for each delivered event.
pub type EventHandler =
    Arc<dyn Fn(EventData) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventData) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Event subscriptions an extension wants wired at bring-up.
#[derive(Default)]
pub struct SubscriptionSet {
    entries: Vec<(String, EventHandler)>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, event: impl Into<String>, handler: EventHandler) -> Self {
        self.entries.push((event.into(), handler));
        self
    }

    pub fn into_entries(self) -> Vec<(String, EventHandler)> {
        self.entries
    }
}

/// Unified broker seam. Concrete clients (kafka, rabbitmq, …) live outside
/// the kernel; destination/key routing is theirs to interpret.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, destination: &str, key: &str, payload: &[u8]) -> anyhow::Result<()>;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Client side of the gRPC collaborator: hands out a connection for a named
/// service so the dispatcher can fall back to remote invocation.
#[async_trait]
pub trait GrpcClientRegistry: Send + Sync {
    async fn connection(&self, service: &str) -> anyhow::Result<GrpcConnection>;
}

/// Resolved remote endpoint. Typed stubs are the collaborator's business.
#[derive(Debug, Clone)]
pub struct GrpcConnection {
    pub target: String,
}

/// A gRPC service an extension wants exposed on the shared server.
#[derive(Debug, Clone)]
pub struct GrpcServiceReg {
    pub service_name: &'static str,
}

/// Capability for extensions that export gRPC services. Collected during
/// the optional-service bring-up and handed to the hub collaborator.
pub trait GrpcRegistrar: Send + Sync {
    fn grpc_services(&self) -> Vec<GrpcServiceReg>;
}

/// Service-registry seam (consul et al. stay outside the kernel).
#[async_trait]
pub trait DiscoveryRegistry: Send + Sync {
    async fn register(&self, info: &ServiceInfo) -> anyhow::Result<()>;
    async fn deregister(&self, name: &str) -> anyhow::Result<()>;
}

/// Data-layer handle the manager co-owns: closed last during cleanup.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn close(&self) -> Vec<anyhow::Error>;
}

/// Per-extension view handed to `init`.
pub struct ExtensionCtx {
    name: String,
    config: Value,
    cancel: CancellationToken,
    manager: Weak<crate::manager::ExtensionManager>,
}

impl ExtensionCtx {
    pub(crate) fn new(
        name: String,
        config: Value,
        cancel: CancellationToken,
        manager: Weak<crate::manager::ExtensionManager>,
    ) -> Self {
        Self {
            name,
            config,
            cancel,
            manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw config section for this extension (`extension.<name>` bag).
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Deserialize this extension's config section.
    pub fn config_typed<T: serde::de::DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(self.config.clone())?)
    }

    /// Root cancellation token; background work must derive from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle back to the owning manager, e.g. for cross-service calls.
    pub fn manager(&self) -> Option<Arc<crate::manager::ExtensionManager>> {
        self.manager.upgrade()
    }
}

/// The extension contract: a uniquely named unit contributing handlers,
/// services and optional discovery/broker bindings to the host.
///
/// All lifecycle hooks default to no-ops so simple extensions only
/// implement `name` and `init`.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Business
    }

    /// Grouping label for listings; defaults to the extension name.
    fn group(&self) -> &str {
        self.name()
    }

    fn dependencies(&self) -> &[&str] {
        &[]
    }

    fn metadata(&self) -> ExtensionMetadata {
        ExtensionMetadata {
            name: self.name().to_string(),
            version: self.version().to_string(),
            kind: self.kind(),
            group: self.group().to_string(),
            dependencies: self.dependencies().iter().map(|d| d.to_string()).collect(),
        }
    }

    // Lifecycle. Phase semantics live in the manager; hooks just do work.
    async fn pre_init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn init(&self, ctx: &ExtensionCtx) -> anyhow::Result<()>;

    async fn post_init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    // Exposure
    fn services(&self) -> ServiceSet {
        ServiceSet::default()
    }

    fn handlers(&self) -> ServiceSet {
        ServiceSet::default()
    }

    fn publisher(&self) -> Option<Arc<dyn Broker>> {
        None
    }

    fn subscriber(&self) -> SubscriptionSet {
        SubscriptionSet::default()
    }

    // Discovery hints
    fn needs_service_discovery(&self) -> bool {
        false
    }

    fn service_info(&self) -> Option<ServiceInfo> {
        None
    }

    /// Return self as a gRPC registrar if this extension exports services.
    fn as_grpc(&self) -> Option<&dyn GrpcRegistrar> {
        None
    }
}
