//! # extkit-db - connection supervisor
//!
//! Master/replica pooling with pluggable load balancing and health-driven
//! replica pruning. The pool is generic over a narrow [`Connector`] seam:
//! concrete drivers (sql, document stores, caches) implement it outside
//! this crate and all inherit the same discipline.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod balancer;
pub mod config;
mod manager;

pub use balancer::{Balancer, Replica};
pub use config::{DatabaseConfig, DbNodeConfig, Strategy};
pub use manager::DbManager;

/// A live connection the pool can ping and close.
#[async_trait]
pub trait DbConn: Send + Sync {
    /// The DSN or endpoint this connection was opened against.
    fn source(&self) -> &str;

    async fn ping(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Opens connections from node configuration. Drivers live outside the
/// kernel; tests use an in-memory implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &DbNodeConfig) -> anyhow::Result<Arc<dyn DbConn>>;
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to master")]
    MasterConnect {
        #[source]
        source: anyhow::Error,
    },
    #[error("master ping failed")]
    MasterPing {
        #[source]
        source: anyhow::Error,
    },
    #[error("replica selection failed")]
    Replica {
        #[source]
        source: anyhow::Error,
    },
    #[error("no available replicas")]
    NoAvailableReplicas,
    #[error("invalid balancing strategy '{0}'")]
    InvalidStrategy(String),
}
