//! Built-in system status extension: answers liveness probes over the
//! cross-service facility and logs host bring-up.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use extkit::{
    event_handler, BuiltinExtension, CallCtx, Extension, ExtensionCtx, ExtensionKind, Service,
    ServiceSet, SubscriptionSet,
};

#[derive(Debug, Clone, Deserialize, Default)]
struct SysStatusConfig {
    #[serde(default)]
    verbose: bool,
}

struct StatusService {
    started: RwLock<Option<Instant>>,
}

#[async_trait]
impl Service for StatusService {
    async fn call(&self, _ctx: &CallCtx, method: &str, _request: Value) -> Result<Value> {
        match method {
            "Ping" => Ok(json!("pong")),
            "Uptime" => {
                let seconds = match *self.started.read() {
                    Some(t) => t.elapsed().as_secs(),
                    None => 0,
                };
                Ok(json!({"uptime_seconds": seconds}))
            }
            other => anyhow::bail!("unknown method '{other}'"),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["Ping", "Uptime"]
    }
}

pub struct SysStatus {
    config: RwLock<SysStatusConfig>,
    status: Arc<StatusService>,
}

impl Default for SysStatus {
    fn default() -> Self {
        Self {
            config: RwLock::new(SysStatusConfig::default()),
            status: Arc::new(StatusService {
                started: RwLock::new(None),
            }),
        }
    }
}

#[async_trait]
impl Extension for SysStatus {
    fn name(&self) -> &str {
        "sys_status"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Core
    }

    fn group(&self) -> &str {
        "system"
    }

    async fn init(&self, ctx: &ExtensionCtx) -> Result<()> {
        let cfg: SysStatusConfig = ctx.config_typed()?;
        if cfg.verbose {
            tracing::info!(extension = ctx.name(), "verbose status reporting enabled");
        }
        *self.config.write() = cfg;
        *self.status.started.write() = Some(Instant::now());
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        *self.status.started.write() = None;
        Ok(())
    }

    fn services(&self) -> ServiceSet {
        ServiceSet::new().with("Status", self.status.clone())
    }

    fn subscriber(&self) -> SubscriptionSet {
        let verbose = self.config.read().verbose;
        SubscriptionSet::new().with(
            "exts.all.initialized",
            event_handler(move |event| async move {
                if verbose {
                    tracing::info!(data = %event.data, "host finished initializing");
                } else {
                    tracing::debug!("host finished initializing");
                }
                Ok(())
            }),
        )
    }
}

inventory::submit! {
    BuiltinExtension {
        name: "sys_status",
        ctor: || Arc::new(SysStatus::default()),
    }
}
