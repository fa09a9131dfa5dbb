//! Master/replica pool with health-driven replica pruning.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::balancer::{Balancer, Replica};
use crate::config::DatabaseConfig;
use crate::{Connector, DbConn, DbError};

pub struct DbManager {
    master: Arc<dyn DbConn>,
    replicas: RwLock<Vec<Replica>>,
    balancer: Balancer,
    max_retry: u32,
}

impl DbManager {
    /// Connect the pool. The master is fail-fast; replica failures are
    /// logged and skipped. The replica list is never left empty: when every
    /// replica fails, the master serves reads too.
    pub async fn new(config: &DatabaseConfig, connector: &dyn Connector) -> Result<Self, DbError> {
        let master = connector
            .connect(&config.master)
            .await
            .map_err(|source| DbError::MasterConnect { source })?;
        tracing::info!(source = %config.master.source, "database master connected");

        let mut replicas = Vec::with_capacity(config.slaves.len());
        for node in &config.slaves {
            match connector.connect(node).await {
                Ok(conn) => replicas.push(Replica {
                    conn,
                    weight: node.weight,
                }),
                Err(e) => {
                    tracing::warn!(source = %node.source, error = %e, "replica connect failed, skipping");
                }
            }
        }
        if replicas.is_empty() {
            tracing::warn!("no replicas available; master will serve reads");
            replicas.push(Replica {
                conn: master.clone(),
                weight: 1,
            });
        }

        Ok(Self {
            master,
            replicas: RwLock::new(replicas),
            balancer: Balancer::new(config.strategy),
            max_retry: config.max_retry,
        })
    }

    pub fn master(&self) -> Arc<dyn DbConn> {
        self.master.clone()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn replica_sources(&self) -> Vec<String> {
        self.replicas
            .read()
            .iter()
            .map(|r| r.conn.source().to_string())
            .collect()
    }

    /// Pick a read connection: up to `max_retry + 1` attempts, each pinged
    /// before being handed out. Exhaustion surfaces the last ping error.
    pub async fn slave(&self) -> Result<Arc<dyn DbConn>, DbError> {
        let mut last_err: Option<anyhow::Error> = None;
        for _ in 0..=self.max_retry {
            let conn = {
                let replicas = self.replicas.read();
                match self.balancer.pick(&replicas) {
                    Some(idx) => replicas[idx].conn.clone(),
                    None => return Err(DbError::NoAvailableReplicas),
                }
            };
            match conn.ping().await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(source = %conn.source(), error = %e, "replica ping failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(source) => Err(DbError::Replica { source }),
            None => Err(DbError::NoAvailableReplicas),
        }
    }

    /// Ping the master (fatal on failure), then rewrite the replica list to
    /// the endpoints still responding. The master substitutes when every
    /// replica fails.
    pub async fn health(&self) -> Result<(), DbError> {
        self.master
            .ping()
            .await
            .map_err(|source| DbError::MasterPing { source })?;

        let current: Vec<Replica> = self.replicas.read().clone();
        let mut alive = Vec::with_capacity(current.len());
        for replica in current {
            match replica.conn.ping().await {
                Ok(()) => alive.push(replica),
                Err(e) => {
                    tracing::warn!(source = %replica.conn.source(), error = %e, "pruning unhealthy replica");
                }
            }
        }
        if alive.is_empty() {
            alive.push(Replica {
                conn: self.master.clone(),
                weight: 1,
            });
        }
        *self.replicas.write() = alive;
        Ok(())
    }

    /// Close the master exactly once, then every replica that is not an
    /// alias of it. Errors are collected, not thrown.
    pub async fn close(&self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        if let Err(e) = self.master.close().await {
            errors.push(e);
        }
        let replicas: Vec<Replica> = std::mem::take(&mut *self.replicas.write());
        for replica in replicas {
            if Arc::ptr_eq(&replica.conn, &self.master) {
                continue;
            }
            if let Err(e) = replica.conn.close().await {
                errors.push(e);
            }
        }
        errors
    }
}
