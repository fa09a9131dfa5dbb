//! Replica selection strategies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::config::Strategy;
use crate::DbConn;

/// A read endpoint plus its configured weight.
#[derive(Clone)]
pub struct Replica {
    pub conn: Arc<dyn DbConn>,
    pub weight: u32,
}

pub enum Balancer {
    /// Atomic cursor, incremented before the modulo.
    RoundRobin(AtomicUsize),
    Random,
    Weight,
}

impl Balancer {
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::RoundRobin => Balancer::RoundRobin(AtomicUsize::new(0)),
            Strategy::Random => Balancer::Random,
            Strategy::Weight => Balancer::Weight,
        }
    }

    /// Pick an index into `replicas`; `None` only when the slice is empty.
    pub fn pick(&self, replicas: &[Replica]) -> Option<usize> {
        if replicas.is_empty() {
            return None;
        }
        let idx = match self {
            Balancer::RoundRobin(counter) => {
                (counter.fetch_add(1, Ordering::SeqCst) + 1) % replicas.len()
            }
            Balancer::Random => rand::rng().random_range(0..replicas.len()),
            Balancer::Weight => {
                // Zero weights count as 1 so the distribution stays defined.
                let total: u64 = replicas.iter().map(|r| u64::from(r.weight.max(1))).sum();
                let mut roll = rand::rng().random_range(0..total);
                let mut chosen = replicas.len() - 1;
                for (i, r) in replicas.iter().enumerate() {
                    let w = u64::from(r.weight.max(1));
                    if roll < w {
                        chosen = i;
                        break;
                    }
                    roll -= w;
                }
                chosen
            }
        };
        Some(idx)
    }
}
