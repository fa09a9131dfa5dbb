//! # extkit - in-process extension manager
//!
//! Composes independently developed extensions into one long-running
//! service: dependency-ordered lifecycle, a uniform cross-extension call
//! facility with a remote RPC fallback, event dispatch bridged to a
//! message broker, per-extension circuit breakers, and plugin loading.
//!
//! ## Declaring a built-in extension
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use extkit::{Extension, ExtensionCtx, BuiltinExtension};
//!
//! #[derive(Default)]
//! struct Audit;
//!
//! #[async_trait::async_trait]
//! impl Extension for Audit {
//!     fn name(&self) -> &str { "audit" }
//!     async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> { Ok(()) }
//! }
//!
//! inventory::submit! {
//!     BuiltinExtension { name: "audit", ctor: || Arc::new(Audit) }
//! }
//! ```
//!
//! At steady state callers reach extensions through
//! [`ExtensionManager::call_service`] and [`ExtensionManager::publish_event`];
//! the manager routes each to its chosen backend.

pub use anyhow::Result;
pub use async_trait::async_trait;

// Re-export inventory so plugins only depend on extkit.
pub use inventory;

pub mod breaker;
pub mod config;
pub mod contracts;
pub mod cross_service;
pub mod errors;
pub mod events;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod task;

pub use breaker::{BreakerPolicy, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::{ExtensionConfig, ExtensionMode, GrpcConfig, MetricsConfig};
pub use contracts::{
    event_handler, Broker, CallCtx, DataBackend, DiscoveryRegistry, EventHandler, Extension,
    ExtensionCtx, ExtensionKind, ExtensionMetadata, GrpcClientRegistry, GrpcConnection,
    GrpcRegistrar, GrpcServiceReg, Service, ServiceInfo, ServiceSet, SubscriptionSet,
};
pub use cross_service::{CallOptions, CallResult, CallStrategy, CrossServiceRegistry};
pub use errors::ExtensionError;
pub use events::{EventData, EventDispatcher, EventTarget};
pub use loader::{PluginLoader, ResourceMonitor, SecurityPolicy};
pub use manager::{ExtensionManager, ExtensionStatus, ManagerOptions};
pub use metrics::{Metrics, MetricsSink, MetricsSnapshot};
pub use registry::BuiltinExtension;
