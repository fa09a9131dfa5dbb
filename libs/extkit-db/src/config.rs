use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DbError;

/// One endpoint in the pool (`data.database.master` / `data.database.slaves[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbNodeConfig {
    pub driver: String,
    pub source: String,
    #[serde(default)]
    pub max_idle_conn: u32,
    #[serde(default)]
    pub max_open_conn: u32,
    #[serde(default, with = "humantime_serde")]
    pub conn_max_life_time: Option<Duration>,
    /// Weight for the `weight` strategy; 0 normalizes to 1.
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    Weight,
}

impl Strategy {
    pub fn parse(s: &str) -> Result<Self, DbError> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "weight" => Ok(Self::Weight),
            other => Err(DbError::InvalidStrategy(other.to_string())),
        }
    }
}

fn default_max_retry() -> u32 {
    3
}

/// The `data.database` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub master: DbNodeConfig,
    #[serde(default)]
    pub slaves: Vec<DbNodeConfig>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}
