//! Per-extension circuit breakers.
//!
//! State transitions:
//!
//! ```text
//! Closed --(requests >= 3 && failure ratio >= 0.6)--> Open
//! Open   --(timeout elapsed)--> HalfOpen
//! HalfOpen --(failure)--> Open
//! HalfOpen --(max_requests consecutive successes)--> Closed
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::errors::ExtensionError;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Fixed policy for extension breakers.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Requests admitted while half-open; also the consecutive-success
    /// count needed to close again.
    pub max_requests: u32,
    /// Closed-state counting window; counts reset when it elapses.
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            max_requests: 100,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    requests: u32,
    total_successes: u32,
    total_failures: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn should_trip(&self) -> bool {
        self.requests >= 3 && f64::from(self.total_failures) / f64::from(self.requests) >= 0.6
    }
}

struct Inner {
    state: BreakerState,
    counts: Counts,
    /// Start of the closed counting window, or the moment the breaker opened.
    since: Instant,
}

/// Read-only view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub trips: u64,
}

pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    inner: RwLock<Inner>,
    trips: AtomicU64,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            name: name.into(),
            policy,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                counts: Counts::default(),
                since: Instant::now(),
            }),
            trips: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.current_state(Instant::now())
    }

    /// State after applying time-based transitions (open -> half-open,
    /// closed window expiry).
    fn current_state(&self, now: Instant) -> BreakerState {
        let mut inner = self.inner.write();
        self.advance(&mut inner, now);
        inner.state
    }

    fn advance(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Open => {
                if now.duration_since(inner.since) >= self.policy.timeout {
                    tracing::info!(breaker = %self.name, "circuit breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.counts = Counts::default();
                    inner.since = now;
                }
            }
            BreakerState::Closed => {
                if now.duration_since(inner.since) >= self.policy.interval {
                    inner.counts = Counts::default();
                    inner.since = now;
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        tracing::warn!(breaker = %self.name, "circuit breaker opened");
        inner.state = BreakerState::Open;
        inner.counts = Counts::default();
        inner.since = now;
        self.trips.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .incr_labeled("extension_breaker_trips", &self.name);
    }

    /// Admit or reject a request under the current state.
    pub(crate) fn admit(&self) -> Result<(), ExtensionError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        self.advance(&mut inner, now);
        match inner.state {
            BreakerState::Closed => {
                inner.counts.on_request();
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.counts.requests >= self.policy.max_requests {
                    return Err(ExtensionError::CircuitOpen(self.name.clone()));
                }
                inner.counts.on_request();
                Ok(())
            }
            BreakerState::Open => Err(ExtensionError::CircuitOpen(self.name.clone())),
        }
    }

    pub(crate) fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.counts.on_success();
        if inner.state == BreakerState::HalfOpen
            && inner.counts.consecutive_successes >= self.policy.max_requests
        {
            tracing::info!(breaker = %self.name, "circuit breaker closed");
            inner.state = BreakerState::Closed;
            inner.counts = Counts::default();
            inner.since = now;
        }
    }

    pub(crate) fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.counts.on_failure();
        match inner.state {
            BreakerState::Closed => {
                if inner.counts.should_trip() {
                    self.trip(&mut inner, now);
                }
            }
            BreakerState::HalfOpen => self.trip(&mut inner, now),
            BreakerState::Open => {}
        }
    }

    /// Run `fut` under the breaker, recording the outcome.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, ExtensionError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.admit()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(ExtensionError::Other(e))
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            requests: inner.counts.requests,
            successes: inner.counts.total_successes,
            failures: inner.counts.total_failures,
            trips: self.trips.load(Ordering::Relaxed),
        }
    }
}

/// Breaker table, one entry per extension, created lazily.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    policy: BreakerPolicy,
    metrics: Arc<Metrics>,
}

impl BreakerRegistry {
    pub fn new(policy: BreakerPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            policy,
            metrics,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.policy.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(name)
    }

    pub fn clear(&self) {
        self.breakers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy() -> BreakerPolicy {
        BreakerPolicy {
            max_requests: 2,
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(50),
        }
    }

    fn breaker(policy: BreakerPolicy) -> CircuitBreaker {
        CircuitBreaker::new("test", policy, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let b = breaker(quick_policy());
        for _ in 0..10 {
            let out = b.call(async { Ok::<_, anyhow::Error>(1) }).await;
            assert!(out.is_ok());
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn trips_at_three_requests_with_bad_ratio() {
        let b = breaker(quick_policy());
        let _ = b.call(async { Ok::<_, anyhow::Error>(()) }).await;
        for _ in 0..2 {
            let _ = b
                .call(async { Err::<(), _>(anyhow::anyhow!("down")) })
                .await;
        }
        // 3 requests, 2 failures => ratio 0.66
        assert_eq!(b.state(), BreakerState::Open);

        let rejected = b.call(async { Ok::<_, anyhow::Error>(()) }).await;
        assert!(matches!(rejected, Err(ExtensionError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn two_failures_alone_do_not_trip() {
        let b = breaker(quick_policy());
        for _ in 0..2 {
            let _ = b
                .call(async { Err::<(), _>(anyhow::anyhow!("down")) })
                .await;
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_recovers_after_enough_successes() {
        let b = breaker(quick_policy());
        for _ in 0..3 {
            let _ = b
                .call(async { Err::<(), _>(anyhow::anyhow!("down")) })
                .await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        let _ = b.call(async { Ok::<_, anyhow::Error>(()) }).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        let _ = b.call(async { Ok::<_, anyhow::Error>(()) }).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker(quick_policy());
        for _ in 0..3 {
            let _ = b
                .call(async { Err::<(), _>(anyhow::anyhow!("down")) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        let _ = b
            .call(async { Err::<(), _>(anyhow::anyhow!("still down")) })
            .await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn registry_is_lazy_and_deduplicated() {
        let reg = BreakerRegistry::new(BreakerPolicy::default(), Arc::new(Metrics::new()));
        assert!(reg.get("a").is_none());
        let first = reg.get_or_create("a");
        let second = reg.get_or_create("a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.len(), 1);

        reg.remove("a");
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn trip_counter_increments() {
        let b = breaker(quick_policy());
        for _ in 0..3 {
            let _ = b
                .call(async { Err::<(), _>(anyhow::anyhow!("down")) })
                .await;
        }
        assert_eq!(b.snapshot().trips, 1);
    }
}
