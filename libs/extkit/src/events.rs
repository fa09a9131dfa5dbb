//! Event dispatch: in-memory fan-out plus a broker bridge.
//!
//! Memory deliveries run one task per handler and never block the
//! publisher. Queue deliveries serialize the envelope to JSON and hand it
//! to the configured [`Broker`]; a failing queue-only publish falls back to
//! memory so no handler silently loses the event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::{Broker, EventHandler};
use crate::errors::ExtensionError;
use crate::metrics::Metrics;

/// Wire envelope: `{"time": RFC3339, "source": "extension", "event_type", "data"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventData {
    pub time: DateTime<Utc>,
    pub source: String,
    pub event_type: String,
    pub data: Value,
}

impl EventData {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            time: Utc::now(),
            source: "extension".to_string(),
            event_type: event_type.into(),
            data,
        }
    }
}

/// Delivery destination, packed as a bit flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Memory,
    Queue,
    All,
}

impl EventTarget {
    pub fn has_memory(self) -> bool {
        matches!(self, EventTarget::Memory | EventTarget::All)
    }

    pub fn has_queue(self) -> bool {
        matches!(self, EventTarget::Queue | EventTarget::All)
    }
}

const RATE_RING_CAP: usize = 1000;

pub struct EventDispatcher {
    subscribers: RwLock<HashMap<String, Vec<EventHandler>>>,
    broker: RwLock<Option<Arc<dyn Broker>>>,
    publish_times: Mutex<VecDeque<Instant>>,
    metrics: Arc<Metrics>,
}

impl EventDispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            broker: RwLock::new(None),
            publish_times: Mutex::new(VecDeque::new()),
            metrics,
        }
    }

    pub fn set_broker(&self, broker: Option<Arc<dyn Broker>>) {
        *self.broker.write() = broker;
    }

    pub fn subscribe(&self, event: impl Into<String>, handler: EventHandler) {
        self.subscribers
            .write()
            .entry(event.into())
            .or_default()
            .push(handler);
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers
            .read()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn clear_subscribers(&self) {
        self.subscribers.write().clear();
    }

    /// Default target: queue when a healthy broker is wired, memory
    /// otherwise.
    fn default_target(&self) -> EventTarget {
        match self.broker.read().as_ref() {
            Some(b) if b.is_healthy() => EventTarget::Queue,
            _ => EventTarget::Memory,
        }
    }

    /// Publish to the default target.
    pub async fn publish(&self, event_type: &str, data: Value) {
        let target = self.default_target();
        self.publish_to(event_type, data, target).await;
    }

    /// Publish to an explicit target, applying the queue->memory fallback.
    pub async fn publish_to(&self, event_type: &str, data: Value, target: EventTarget) {
        self.record_publish();
        let event = EventData::new(event_type, data);

        let mut memory_done = false;
        if target.has_memory() {
            self.dispatch_memory(&event);
            memory_done = true;
        }

        if target.has_queue() {
            if let Err(e) = self.dispatch_queue(&event).await {
                tracing::warn!(event = %event.event_type, error = %e, "queue publish failed");
                self.metrics.incr("events_queue_error_total");
                if !memory_done {
                    self.dispatch_memory(&event);
                }
            }
        }
    }

    /// Retry the failing target with linear backoff (`attempt * 1s`).
    ///
    /// Memory dispatch cannot fail, so retries only apply to the queue leg.
    /// Exhausting a queue-only retry budget still falls back to memory.
    pub async fn publish_with_retry(
        &self,
        event_type: &str,
        data: Value,
        target: Option<EventTarget>,
        max_retries: u32,
    ) {
        let target = target.unwrap_or_else(|| self.default_target());
        self.record_publish();
        let event = EventData::new(event_type, data);

        if target.has_memory() {
            self.dispatch_memory(&event);
        }
        if !target.has_queue() {
            return;
        }

        let mut last_err = None;
        for attempt in 1..=max_retries.max(1) {
            match self.dispatch_queue(&event).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        event = %event.event_type,
                        attempt,
                        error = %e,
                        "queue publish attempt failed"
                    );
                    self.metrics.incr("events_queue_error_total");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                }
            }
        }

        if let Some(e) = last_err {
            tracing::error!(event = %event.event_type, error = %e, "queue publish exhausted retries");
            if !target.has_memory() {
                self.dispatch_memory(&event);
            }
        }
    }

    /// Fan the event out to in-memory subscribers, one task each.
    /// Zero subscribers means no counter movement at all.
    fn dispatch_memory(&self, event: &EventData) {
        let handlers: Vec<EventHandler> = match self.subscribers.read().get(&event.event_type) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return,
        };

        self.metrics.incr("events_published_total");
        for handler in handlers {
            self.metrics.incr("events_dispatched_total");
            self.metrics.gauge_add("events_active_handlers", 1);
            let metrics = self.metrics.clone();
            let event = event.clone();
            let event_type = event.event_type.clone();
            tokio::spawn(async move {
                let outcome = std::panic::AssertUnwindSafe(handler(event))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => metrics.incr("events_delivered_total"),
                    Ok(Err(e)) => {
                        tracing::warn!(event = %event_type, error = %e, "event handler failed");
                        metrics.incr("events_failed_total");
                    }
                    Err(_) => {
                        tracing::error!(event = %event_type, "event handler panicked");
                        metrics.incr("events_failed_total");
                    }
                }
                metrics.gauge_add("events_active_handlers", -1);
            });
        }
    }

    async fn dispatch_queue(&self, event: &EventData) -> Result<(), ExtensionError> {
        let broker = self
            .broker
            .read()
            .clone()
            .ok_or_else(|| ExtensionError::BrokerUnavailable {
                source: anyhow::anyhow!("no broker configured"),
            })?;

        let payload =
            serde_json::to_vec(event).map_err(|source| ExtensionError::SerializationFailed {
                source,
            })?;

        broker
            .publish(&event.event_type, &event.event_type, &payload)
            .await
            .map_err(|source| ExtensionError::BrokerUnavailable { source })?;
        self.metrics.incr("events_queue_published_total");
        Ok(())
    }

    fn record_publish(&self) {
        let mut ring = self.publish_times.lock();
        ring.push_back(Instant::now());
        while ring.len() > RATE_RING_CAP {
            ring.pop_front();
        }
    }

    fn publishes_within(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.publish_times
            .lock()
            .iter()
            .filter(|t| now.duration_since(**t) <= window)
            .count()
    }

    /// Publish rate over the last 10 seconds.
    pub fn events_per_second(&self) -> f64 {
        self.publishes_within(Duration::from_secs(10)) as f64 / 10.0
    }

    /// Publishes observed in the last 60 seconds.
    pub fn events_per_minute(&self) -> u64 {
        self.publishes_within(Duration::from_secs(60)) as u64
    }

    pub fn delivered(&self) -> u64 {
        self.metrics.counter("events_delivered_total")
    }

    pub fn dispatched(&self) -> u64 {
        self.metrics.counter("events_dispatched_total")
    }

    /// delivered / dispatched, 1.0 when nothing was dispatched yet.
    pub fn success_rate(&self) -> f64 {
        let dispatched = self.dispatched();
        if dispatched == 0 {
            return 1.0;
        }
        self.delivered() as f64 / dispatched as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::event_handler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn dispatcher() -> (Arc<Metrics>, EventDispatcher) {
        let metrics = Arc::new(Metrics::new());
        let d = EventDispatcher::new(metrics.clone());
        (metrics, d)
    }

    struct FlakyBroker {
        fail: bool,
        published: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Broker for FlakyBroker {
        async fn publish(
            &self,
            _destination: &str,
            _key: &str,
            _payload: &[u8],
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("broker down");
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn memory_publish_reaches_every_subscriber() {
        let (_, d) = dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            d.subscribe(
                "order.created",
                event_handler(move |_| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        d.publish_to("order.created", serde_json::json!({"id": "42"}), EventTarget::Memory)
            .await;
        wait_for(|| hits.load(Ordering::SeqCst) == 3).await;
        assert_eq!(d.delivered(), 3);
        assert!((d.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn zero_subscribers_moves_no_counters() {
        let (m, d) = dispatcher();
        d.publish_to("nobody.home", Value::Null, EventTarget::Memory)
            .await;
        assert_eq!(m.counter("events_published_total"), 0);
        assert_eq!(m.counter("events_delivered_total"), 0);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let (m, d) = dispatcher();
        d.subscribe(
            "boom",
            event_handler(|_| async {
                panic!("handler bug");
                #[allow(unreachable_code)]
                Ok(())
            }),
        );
        d.subscribe("boom", event_handler(|_| async { Ok(()) }));

        d.publish_to("boom", Value::Null, EventTarget::Memory).await;
        wait_for(|| m.counter("events_failed_total") == 1 && m.counter("events_delivered_total") == 1)
            .await;
        assert_eq!(m.gauge("events_active_handlers"), 0);
        assert!((d.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn queue_failure_falls_back_to_memory() {
        let (_, d) = dispatcher();
        d.set_broker(Some(Arc::new(FlakyBroker {
            fail: true,
            published: AtomicUsize::new(0),
        })));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.subscribe(
            "order.created",
            event_handler(move |_| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        d.publish_to("order.created", serde_json::json!({"id": "42"}), EventTarget::Queue)
            .await;
        wait_for(|| hits.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn healthy_broker_receives_envelope() {
        let (m, d) = dispatcher();
        let broker = Arc::new(FlakyBroker {
            fail: false,
            published: AtomicUsize::new(0),
        });
        d.set_broker(Some(broker.clone()));

        // Default target resolves to Queue.
        d.publish("audit.logged", serde_json::json!({"who": "svc"})).await;
        assert_eq!(broker.published.load(Ordering::SeqCst), 1);
        assert_eq!(m.counter("events_queue_published_total"), 1);
    }

    #[tokio::test]
    async fn envelope_round_trips() {
        let event = EventData::new("order.created", serde_json::json!({"id": "42"}));
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: EventData = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(event, back);
        assert_eq!(back.source, "extension");
    }

    #[tokio::test]
    async fn rate_ring_counts_recent_publishes() {
        let (_, d) = dispatcher();
        for _ in 0..5 {
            d.publish_to("tick", Value::Null, EventTarget::Memory).await;
        }
        assert!(d.events_per_second() >= 0.5);
        assert_eq!(d.events_per_minute(), 5);
    }
}
