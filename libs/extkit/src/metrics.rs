//! Lifecycle metrics: cheap counters/gauges plus a background collector
//! that snapshots them into a bounded history ring.
//!
//! Storage backends stay outside the kernel; a [`MetricsSink`] receives
//! flushed batches when one is wired in.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Counter keyed by `<name>.<label>`, e.g. per-extension trip counts.
    pub fn incr_labeled(&self, name: &str, label: &str) {
        self.incr(&format!("{name}.{label}"));
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_add(&self, name: &str, delta: i64) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn gauge_set(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a call outcome with its duration under `<name>` counters.
    pub fn observe_call(&self, name: &str, ok: bool, duration: Duration) {
        self.incr(&format!("{name}_total"));
        let outcome = if ok { "success" } else { "error" };
        self.incr(&format!("{name}_{outcome}_total"));
        self.incr_by(
            &format!("{name}_duration_ms_total"),
            duration.as_millis() as u64,
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            at: Utc::now(),
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

/// Receiver for flushed snapshot batches (redis, files, … live outside).
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn flush(&self, batch: &[MetricsSnapshot]) -> anyhow::Result<()>;
}

/// Periodic snapshotter. History is capped at `retention` entries; flush
/// failures are logged and never propagate.
pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    history: Arc<Mutex<VecDeque<MetricsSnapshot>>>,
    retention: usize,
    batch_size: usize,
    cancel: CancellationToken,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>, retention: usize, batch_size: usize) -> Self {
        Self {
            metrics,
            history: Arc::new(Mutex::new(VecDeque::new())),
            retention: retention.max(1),
            batch_size: batch_size.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the flush loop. Returns immediately; the loop exits when
    /// [`MetricsCollector::stop`] is called or the parent token cancels.
    pub fn start(
        &self,
        parent: &CancellationToken,
        interval: Duration,
        sink: Option<Arc<dyn MetricsSink>>,
    ) {
        let metrics = self.metrics.clone();
        let history = self.history.clone();
        let retention = self.retention;
        let batch_size = self.batch_size;
        let cancel = self.cancel.clone();
        let parent = parent.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = parent.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snap = metrics.snapshot();
                let batch: Vec<MetricsSnapshot> = {
                    let mut h = history.lock();
                    h.push_back(snap);
                    while h.len() > retention {
                        h.pop_front();
                    }
                    h.iter().rev().take(batch_size).cloned().collect()
                };

                if let Some(sink) = sink.as_ref() {
                    if let Err(e) = sink.flush(&batch).await {
                        tracing::warn!(error = %e, "metrics flush failed");
                    }
                }
            }
            tracing::debug!("metrics collector stopped");
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Latest snapshot per run, used by the admin metrics contract.
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.history.lock().back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_accumulate() {
        let m = Metrics::new();
        m.incr("init_total");
        m.incr_by("init_total", 2);
        m.gauge_add("active", 3);
        m.gauge_add("active", -1);

        assert_eq!(m.counter("init_total"), 3);
        assert_eq!(m.gauge("active"), 2);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn labeled_counters_use_dotted_keys() {
        let m = Metrics::new();
        m.incr_labeled("breaker_trips", "auth");
        assert_eq!(m.counter("breaker_trips.auth"), 1);
    }

    #[test]
    fn observe_call_tracks_outcome() {
        let m = Metrics::new();
        m.observe_call("service_call", true, Duration::from_millis(12));
        m.observe_call("service_call", false, Duration::from_millis(3));

        assert_eq!(m.counter("service_call_total"), 2);
        assert_eq!(m.counter("service_call_success_total"), 1);
        assert_eq!(m.counter("service_call_error_total"), 1);
        assert_eq!(m.counter("service_call_duration_ms_total"), 15);
    }

    #[tokio::test]
    async fn collector_caps_history_and_stops() {
        let metrics = Arc::new(Metrics::new());
        let collector = MetricsCollector::new(metrics.clone(), 3, 10);
        let parent = CancellationToken::new();
        collector.start(&parent, Duration::from_millis(10), None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        collector.stop();
        let len = collector.history().len();
        assert!(len <= 3, "history should be retention-capped, got {len}");
        assert!(collector.latest().is_some());
    }
}
