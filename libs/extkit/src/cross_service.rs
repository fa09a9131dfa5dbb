//! Cross-service registry and the unified local/remote call dispatcher.
//!
//! Services are reachable by dotted path `<extension>.<field>` without the
//! caller knowing which extension owns them. The registry holds depth-1
//! keys; deeper paths resolve through `Service::subservice`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::contracts::{CallCtx, GrpcClientRegistry, Service, ServiceSet};
use crate::metrics::Metrics;
use crate::task::with_timeout;

/// Per-manager cross-service table. Mutations happen on refresh and on
/// plugin load/unload only.
#[derive(Default)]
pub struct CrossServiceRegistry {
    map: RwLock<BTreeMap<String, Arc<dyn Service>>>,
}

impl CrossServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-register one extension's services: drop its prefix, then walk the
    /// service set at depth 1.
    pub fn rebuild_extension(&self, extension: &str, services: &ServiceSet) {
        let mut map = self.map.write();
        let prefix = format!("{extension}.");
        map.retain(|k, _| !k.starts_with(&prefix));
        for (field, service) in services.iter() {
            map.insert(format!("{prefix}{field}"), service.clone());
        }
    }

    /// Remove exactly the keys prefixed `"<extension>."`.
    pub fn remove_extension(&self, extension: &str) {
        let prefix = format!("{extension}.");
        self.map.write().retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Service>> {
        self.map.read().get(key).cloned()
    }

    /// Flat probe first, then walk the dotted path through `subservice`.
    pub fn resolve(&self, extension: &str, path: &str) -> Option<Arc<dyn Service>> {
        if let Some(svc) = self.get(&format!("{extension}.{path}")) {
            return Some(svc);
        }
        let mut parts = path.split('.');
        let head = parts.next()?;
        let mut current = self.get(&format!("{extension}.{head}"))?;
        for part in parts {
            current = current.subservice(part)?;
        }
        Some(current)
    }

    /// Services registered for one extension, keyed by field name.
    pub fn services_of(&self, extension: &str) -> Vec<(String, Arc<dyn Service>)> {
        let prefix = format!("{extension}.");
        self.map
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

/// How a call picks between the local path and the remote RPC fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStrategy {
    #[default]
    LocalFirst,
    RemoteFirst,
    LocalOnly,
    RemoteOnly,
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub strategy: CallStrategy,
    /// Zero disables timeout wrapping.
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            strategy: CallStrategy::LocalFirst,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one `call_service` invocation.
#[derive(Debug)]
pub struct CallResult {
    pub response: Option<Value>,
    pub error: Option<String>,
    pub is_local: bool,
    pub is_remote: bool,
    pub duration: Duration,
}

impl CallResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a plain `Result`, dropping the routing detail.
    pub fn into_result(self) -> anyhow::Result<Option<Value>> {
        match self.error {
            None => Ok(self.response),
            Some(msg) => Err(anyhow::anyhow!(msg)),
        }
    }
}

pub struct ServiceDispatcher {
    registry: Arc<CrossServiceRegistry>,
    grpc: RwLock<Option<Arc<dyn GrpcClientRegistry>>>,
    metrics: Arc<Metrics>,
}

impl ServiceDispatcher {
    pub fn new(registry: Arc<CrossServiceRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            grpc: RwLock::new(None),
            metrics,
        }
    }

    pub fn set_grpc_registry(&self, grpc: Option<Arc<dyn GrpcClientRegistry>>) {
        *self.grpc.write() = grpc;
    }

    pub fn has_grpc_registry(&self) -> bool {
        self.grpc.read().is_some()
    }

    /// Route a call according to the strategy. `fallback` is the manager's
    /// `get_service_by_name` resolution for targets not present in the
    /// cross-service table.
    pub async fn call(
        &self,
        ctx: &CallCtx,
        service: &str,
        method: &str,
        request: Value,
        opts: &CallOptions,
        fallback: Option<Arc<dyn Service>>,
    ) -> CallResult {
        let started = Instant::now();
        let (response, error, is_local, is_remote) = match opts.strategy {
            CallStrategy::LocalOnly => {
                match self
                    .call_local(ctx, service, method, request, opts.timeout, fallback)
                    .await
                {
                    Ok(v) => (Some(v), None, true, false),
                    Err(e) => (None, Some(e.to_string()), true, false),
                }
            }
            CallStrategy::RemoteOnly => {
                match self.call_remote(service, method, request, opts.timeout).await {
                    Ok(v) => (Some(v), None, false, true),
                    Err(e) => (None, Some(e.to_string()), false, true),
                }
            }
            CallStrategy::LocalFirst => {
                match self
                    .call_local(ctx, service, method, request.clone(), opts.timeout, fallback)
                    .await
                {
                    Ok(v) => (Some(v), None, true, false),
                    Err(local_err) => {
                        tracing::debug!(
                            service,
                            method,
                            error = %local_err,
                            "local call failed, trying remote"
                        );
                        match self.call_remote(service, method, request, opts.timeout).await {
                            Ok(v) => (Some(v), None, false, true),
                            Err(e) => (None, Some(e.to_string()), true, true),
                        }
                    }
                }
            }
            CallStrategy::RemoteFirst => {
                match self
                    .call_remote(service, method, request.clone(), opts.timeout)
                    .await
                {
                    Ok(v) => (Some(v), None, false, true),
                    Err(remote_err) => {
                        tracing::debug!(
                            service,
                            method,
                            error = %remote_err,
                            "remote call failed, trying local"
                        );
                        match self
                            .call_local(ctx, service, method, request, opts.timeout, fallback)
                            .await
                        {
                            Ok(v) => (Some(v), None, true, false),
                            Err(e) => (None, Some(e.to_string()), true, true),
                        }
                    }
                }
            }
        };

        let duration = started.elapsed();
        self.metrics
            .observe_call("service_call", error.is_none(), duration);
        CallResult {
            response,
            error,
            is_local,
            is_remote,
            duration,
        }
    }

    /// Local resolution: a dotted name is a cross-service path; a bare name
    /// is matched against the extension's registered services by advertised
    /// method, then the manager fallback.
    async fn call_local(
        &self,
        ctx: &CallCtx,
        service: &str,
        method: &str,
        request: Value,
        timeout: Duration,
        fallback: Option<Arc<dyn Service>>,
    ) -> anyhow::Result<Value> {
        let target = self
            .resolve_target(service, method)
            .or(fallback)
            .ok_or_else(|| anyhow::anyhow!("no local service for '{service}'"))?;

        let out = with_timeout(
            &format!("{service}.{method}"),
            timeout,
            target.call(ctx, method, request),
        )
        .await??;
        Ok(out)
    }

    fn resolve_target(&self, service: &str, method: &str) -> Option<Arc<dyn Service>> {
        if let Some((extension, path)) = service.split_once('.') {
            return self.registry.resolve(extension, path);
        }

        let candidates = self.registry.services_of(service);
        if candidates.is_empty() {
            return None;
        }
        if let Some((_, svc)) = candidates
            .iter()
            .find(|(_, svc)| svc.methods().contains(&method))
        {
            return Some(svc.clone());
        }
        // A single unadvertised service still gets the call; it reports
        // unknown methods itself.
        if candidates.len() == 1 {
            return candidates.into_iter().next().map(|(_, s)| s);
        }
        None
    }

    /// Remote invocation: fetch a connection for the service and hand back
    /// the transport-agnostic envelope. Typed stub calls belong to the
    /// gRPC collaborator.
    async fn call_remote(
        &self,
        service: &str,
        method: &str,
        request: Value,
        timeout: Duration,
    ) -> anyhow::Result<Value> {
        let grpc = self
            .grpc
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no gRPC registry configured"))?;

        let conn = with_timeout(
            &format!("grpc connect {service}"),
            timeout,
            grpc.connection(service),
        )
        .await??;
        tracing::debug!(service, method, target = %conn.target, "remote dispatch");

        Ok(json!({
            "service": service,
            "method": method,
            "request": request,
            "source": "grpc",
        }))
    }
}
