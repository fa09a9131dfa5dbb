//! Full-lifecycle tests: dependency-ordered init, failure collection,
//! teardown, call routing, event fallback, and plugin load/unload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use extkit::{
    event_handler, BuiltinExtension, CallCtx, CallOptions, CallStrategy, DataBackend, Extension,
    ExtensionCtx, ExtensionError, ExtensionManager, ExtensionStatus, GrpcClientRegistry,
    GrpcConnection, ManagerOptions, Service, ServiceSet,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct TestExt {
    name: String,
    deps: Vec<&'static str>,
    log: Log,
    fail_init: bool,
    panic_init: bool,
    with_ping: bool,
}

impl TestExt {
    fn new(name: &str, deps: &[&'static str], log: &Log) -> Self {
        Self {
            name: name.to_string(),
            deps: deps.to_vec(),
            log: log.clone(),
            ..Self::default()
        }
    }

    fn record(&self, phase: &str) {
        self.log.lock().unwrap().push(format!("{phase}:{}", self.name));
    }
}

struct PingService;

#[async_trait]
impl Service for PingService {
    async fn call(&self, _ctx: &CallCtx, method: &str, _request: Value) -> anyhow::Result<Value> {
        match method {
            "Ping" => Ok(json!("pong")),
            other => anyhow::bail!("unknown method '{other}'"),
        }
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["Ping"]
    }
}

#[async_trait]
impl Extension for TestExt {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[&str] {
        &self.deps
    }

    async fn pre_init(&self) -> anyhow::Result<()> {
        self.record("pre_init");
        Ok(())
    }

    async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
        self.record("init");
        if self.panic_init {
            panic!("{} blew up", self.name);
        }
        if self.fail_init {
            anyhow::bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    async fn post_init(&self) -> anyhow::Result<()> {
        self.record("post_init");
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.record("cleanup");
        Ok(())
    }

    fn services(&self) -> ServiceSet {
        if self.with_ping {
            ServiceSet::new().with("Svc", Arc::new(PingService))
        } else {
            ServiceSet::new()
        }
    }
}

/// Keep compiled-in test registrations out of graphs that build their own.
fn isolated_manager() -> Arc<ExtensionManager> {
    ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            excludes: vec!["itest_probe".to_string()],
            ..Default::default()
        },
        ..ManagerOptions::default()
    })
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn linear_graph_initializes_in_dependency_order() {
    let log: Log = Default::default();
    let m = isolated_manager();
    // Registration order deliberately scrambled.
    m.register_extension(Arc::new(TestExt::new("C", &["B"], &log)))
        .unwrap();
    m.register_extension(Arc::new(TestExt::new("A", &[], &log)))
        .unwrap();
    m.register_extension(Arc::new(TestExt::new("B", &["A"], &log)))
        .unwrap();

    let events: Log = Default::default();
    let seen = events.clone();
    for name in ["exts.A.ready", "exts.B.ready", "exts.C.ready"] {
        let seen = seen.clone();
        m.subscribe(
            name,
            event_handler(move |e| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(e.event_type);
                    Ok(())
                }
            }),
        );
    }
    let payload: Arc<Mutex<Option<Value>>> = Default::default();
    let captured = payload.clone();
    m.subscribe(
        "exts.all.initialized",
        event_handler(move |e| {
            let captured = captured.clone();
            async move {
                *captured.lock().unwrap() = Some(e.data);
                Ok(())
            }
        }),
    );

    m.init_extensions().await.unwrap();

    let entries = log.lock().unwrap().clone();
    let phase_order = |phase: &str| -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.starts_with(phase))
            .map(|e| e.split(':').nth(1).unwrap().to_string())
            .collect()
    };
    assert_eq!(phase_order("pre_init"), vec!["A", "B", "C"]);
    assert_eq!(phase_order("init:"), vec!["A", "B", "C"]);
    assert_eq!(phase_order("post_init"), vec!["A", "B", "C"]);

    // All pre_init entries come before any init entry.
    let last_pre = entries.iter().rposition(|e| e.starts_with("pre_init")).unwrap();
    let first_init = entries.iter().position(|e| e.starts_with("init:")).unwrap();
    assert!(last_pre < first_init);

    assert!(m.is_fully_initialized());

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    wait_until(|| payload.lock().unwrap().is_some()).await;
    assert_eq!(
        payload.lock().unwrap().clone().unwrap(),
        json!({"status": "completed", "count": 3})
    );
}

#[tokio::test]
async fn cycle_is_detected_and_cleanup_still_works() {
    let log: Log = Default::default();
    let m = isolated_manager();
    m.register_extension(Arc::new(TestExt::new("X", &["Y"], &log)))
        .unwrap();
    m.register_extension(Arc::new(TestExt::new("Y", &["X"], &log)))
        .unwrap();

    let err = m.init_extensions().await.unwrap_err();
    assert!(matches!(err, ExtensionError::CycleDetected { .. }));
    assert!(!m.is_initialized());
    assert_ne!(m.get_status("X"), Some(ExtensionStatus::Active));
    assert_ne!(m.get_status("Y"), Some(ExtensionStatus::Active));

    m.cleanup().await;
    assert_eq!(m.extension_count(), 0);
}

#[tokio::test]
async fn missing_dependency_fails_before_any_phase() {
    let log: Log = Default::default();
    let m = isolated_manager();
    m.register_extension(Arc::new(TestExt::new("A", &["ghost"], &log)))
        .unwrap();

    let err = m.init_extensions().await.unwrap_err();
    assert!(matches!(err, ExtensionError::MissingDependency { .. }));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn phase_failures_are_collected_across_extensions() {
    let log: Log = Default::default();
    let m = isolated_manager();
    let mut bad = TestExt::new("bad", &[], &log);
    bad.fail_init = true;
    let mut worse = TestExt::new("worse", &[], &log);
    worse.panic_init = true;
    m.register_extension(Arc::new(bad)).unwrap();
    m.register_extension(Arc::new(worse)).unwrap();
    m.register_extension(Arc::new(TestExt::new("good", &[], &log)))
        .unwrap();

    let err = m.init_extensions().await.unwrap_err();
    match err {
        ExtensionError::PhaseFailed { errors } => {
            assert_eq!(errors.len(), 2);
            let msg = format!("{errors:?}");
            assert!(msg.contains("bad"));
            assert!(msg.contains("worse"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(!m.is_initialized());
    assert_eq!(m.get_status("bad"), Some(ExtensionStatus::Error));
    assert_eq!(m.get_status("worse"), Some(ExtensionStatus::Error));
    // The healthy extension finished all three phases.
    assert_eq!(m.get_status("good"), Some(ExtensionStatus::Active));

    // A failed extension is not advanced past its failing phase.
    let entries = log.lock().unwrap().clone();
    assert!(!entries.contains(&"post_init:bad".to_string()));
    assert!(!entries.contains(&"post_init:worse".to_string()));
}

#[tokio::test]
async fn cleanup_resets_every_table() {
    let log: Log = Default::default();
    let m = isolated_manager();
    let mut a = TestExt::new("A", &[], &log);
    a.with_ping = true;
    m.register_extension(Arc::new(a)).unwrap();
    m.register_extension(Arc::new(TestExt::new("B", &["A"], &log)))
        .unwrap();
    m.init_extensions().await.unwrap();

    // Populate the breaker table through a call.
    let _ = m
        .call_service(
            &CallCtx::default(),
            "A",
            "Ping",
            json!(null),
            CallOptions::default(),
        )
        .await;
    assert!(!m.list_services().is_empty());
    assert!(m.breaker_count() > 0);

    m.cleanup().await;
    assert!(!m.is_initialized());
    assert_eq!(m.extension_count(), 0);
    assert!(m.list_services().is_empty());
    assert_eq!(m.breaker_count(), 0);

    // Reverse-safe order: B cleaned before A.
    let entries = log.lock().unwrap().clone();
    let pos = |needle: &str| entries.iter().position(|e| e == needle).unwrap();
    assert!(pos("cleanup:B") < pos("cleanup:A"));

    m.cleanup().await;
    assert_eq!(m.extension_count(), 0);
}

#[tokio::test]
async fn call_service_routes_local_then_remote() {
    struct StubGrpc;

    #[async_trait]
    impl GrpcClientRegistry for StubGrpc {
        async fn connection(&self, service: &str) -> anyhow::Result<GrpcConnection> {
            Ok(GrpcConnection {
                target: format!("http://hub/{service}"),
            })
        }
    }

    let log: Log = Default::default();
    let m = ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            excludes: vec!["itest_probe".to_string()],
            ..Default::default()
        },
        grpc_clients: Some(Arc::new(StubGrpc)),
        ..ManagerOptions::default()
    });
    let mut a = TestExt::new("A", &[], &log);
    a.with_ping = true;
    m.register_extension(Arc::new(a)).unwrap();
    m.init_extensions().await.unwrap();

    let local = m
        .call_service(
            &CallCtx::default(),
            "A",
            "Ping",
            json!("hi"),
            CallOptions::default(),
        )
        .await;
    assert_eq!(local.response, Some(json!("pong")));
    assert!(local.is_local && !local.is_remote);

    // Unknown method: the local leg fails, the gRPC envelope comes back.
    let remote = m
        .call_service(
            &CallCtx::default(),
            "A",
            "Describe",
            json!("hi"),
            CallOptions::default(),
        )
        .await;
    assert!(remote.is_remote);
    assert_eq!(
        remote.response,
        Some(json!({
            "service": "A",
            "method": "Describe",
            "request": "hi",
            "source": "grpc",
        }))
    );

    let local_only = m
        .call_service(
            &CallCtx::default(),
            "A",
            "Describe",
            json!(1),
            CallOptions {
                strategy: CallStrategy::LocalOnly,
                ..CallOptions::default()
            },
        )
        .await;
    assert!(local_only.error.is_some());
}

#[tokio::test]
async fn broker_outage_still_reaches_memory_subscribers() {
    struct DeadBroker;

    #[async_trait]
    impl extkit::Broker for DeadBroker {
        async fn publish(&self, _d: &str, _k: &str, _p: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("broker down")
        }
    }

    let m = ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            excludes: vec!["itest_probe".to_string()],
            ..Default::default()
        },
        broker: Some(Arc::new(DeadBroker)),
        ..ManagerOptions::default()
    });

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    m.subscribe(
        "order.created",
        event_handler(move |_| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    m.events()
        .publish_to(
            "order.created",
            json!({"id": "42"}),
            extkit::EventTarget::Queue,
        )
        .await;
    wait_until(|| hits.load(Ordering::SeqCst) == 1).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_breaker_is_an_error_for_explicit_execution() {
    let m = isolated_manager();
    let out = m
        .execute_with_circuit_breaker("never_registered", async { Ok(()) })
        .await;
    assert!(matches!(out, Err(ExtensionError::NotFound(_))));

    m.register_breaker("known");
    let out = m
        .execute_with_circuit_breaker("known", async { Ok(42) })
        .await;
    assert_eq!(out.unwrap(), 42);
}

#[tokio::test]
async fn data_layer_closes_last_on_cleanup() {
    struct Probe(Arc<AtomicUsize>);

    #[async_trait]
    impl DataBackend for Probe {
        async fn close(&self) -> Vec<anyhow::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    let closes = Arc::new(AtomicUsize::new(0));
    let m = ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            excludes: vec!["itest_probe".to_string()],
            ..Default::default()
        },
        data_layer: Some(Arc::new(Probe(closes.clone()))),
        ..ManagerOptions::default()
    });
    m.init_extensions().await.unwrap();

    m.cleanup().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    // Second cleanup must not close twice.
    m.cleanup().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

/* ------------------- built-in plugin load/unload ------------------- */

#[derive(Default)]
struct ItestProbe;

#[async_trait]
impl Extension for ItestProbe {
    fn name(&self) -> &str {
        "itest_probe"
    }

    async fn init(&self, _ctx: &ExtensionCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn services(&self) -> ServiceSet {
        ServiceSet::new().with("Probe", Arc::new(PingService))
    }
}

inventory::submit! {
    BuiltinExtension {
        name: "itest_probe",
        ctor: || Arc::new(ItestProbe),
    }
}

#[tokio::test]
async fn builtin_plugin_load_unload_round_trip() {
    // Only the compiled-in probe is allowed in.
    let m = ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            includes: vec!["itest_probe".to_string()],
            ..Default::default()
        },
        ..ManagerOptions::default()
    });
    m.init_extensions().await.unwrap();

    let before: Vec<String> = m.list_extensions().iter().map(|e| e.name.clone()).collect();
    assert_eq!(before, vec!["itest_probe"]);
    assert!(m
        .cross_service_keys()
        .contains(&"itest_probe.Probe".to_string()));

    m.unload_plugin("itest_probe").await.unwrap();
    assert!(m.list_extensions().is_empty());
    assert!(m.cross_service_keys().is_empty());
    assert!(m.get_status("itest_probe").is_none());

    m.load_plugin("itest_probe").await.unwrap();
    let after: Vec<String> = m.list_extensions().iter().map(|e| e.name.clone()).collect();
    assert_eq!(after, before);
    assert_eq!(m.get_status("itest_probe"), Some(ExtensionStatus::Active));
    assert!(m
        .cross_service_keys()
        .contains(&"itest_probe.Probe".to_string()));
}

#[tokio::test]
async fn include_of_undiscovered_name_loads_nothing() {
    let m = ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            includes: vec!["ghost_plugin".to_string()],
            ..Default::default()
        },
        ..ManagerOptions::default()
    });
    m.init_extensions().await.unwrap();
    assert!(m.list_extensions().is_empty());
    assert!(m.is_fully_initialized());
}

#[tokio::test]
async fn reload_restores_an_active_plugin() {
    let m = ExtensionManager::new(ManagerOptions {
        config: extkit::ExtensionConfig {
            includes: vec!["itest_probe".to_string()],
            ..Default::default()
        },
        ..ManagerOptions::default()
    });
    m.init_extensions().await.unwrap();

    m.reload_plugin("itest_probe").await.unwrap();
    assert_eq!(m.get_status("itest_probe"), Some(ExtensionStatus::Active));
    assert_eq!(m.extension_count(), 1);
}

#[tokio::test]
async fn refresh_cross_services_is_idempotent() {
    let log: Log = Default::default();
    let m = isolated_manager();
    let mut a = TestExt::new("A", &[], &log);
    a.with_ping = true;
    m.register_extension(Arc::new(a)).unwrap();
    m.init_extensions().await.unwrap();

    let first = m.cross_service_keys();
    m.refresh_cross_services();
    let second = m.cross_service_keys();
    m.refresh_cross_services();
    assert_eq!(first, second);
    assert_eq!(second, m.cross_service_keys());
}
