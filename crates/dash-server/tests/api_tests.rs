//! Integration tests for the dashboard API endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use dash_core::{
    docker::{
        ContainerDetails, ContainerListing, ContainerRuntime, CpuCounters, HostConfigLimits,
        RawContainerStats,
    },
    health::{components, HealthRegistry},
    models::{CpuInfo, MemoryInfo, NetworkRate, OsInfo, Sample, StorageInfo},
    telemetry::{CpuLoad, FsEntry, HostMetricsProvider, MemorySnapshot, NetInterface, NetStat},
    system_clock, Error, Result,
};
use dash_server::{
    api::{create_router, serve_listener, AppState},
    app,
    config::DashboardConfig,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tower::ServiceExt;

#[derive(Default)]
struct FakeRuntime {
    containers: Vec<ContainerListing>,
    actions: Mutex<Vec<(String, &'static str)>>,
}

impl FakeRuntime {
    fn record(&self, id: &str, action: &'static str) -> Result<()> {
        self.actions.lock().unwrap().push((id.to_string(), action));
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerListing>> {
        Ok(self.containers.clone())
    }

    async fn stats(&self, _id: &str) -> Result<RawContainerStats> {
        Ok(RawContainerStats {
            cpu: CpuCounters {
                total_usage: 400,
                system_usage: Some(2_000),
                online_cpus: Some(1),
                percpu_count: None,
            },
            precpu: CpuCounters {
                total_usage: 200,
                system_usage: Some(1_000),
                online_cpus: Some(1),
                percpu_count: None,
            },
            memory_usage: Some(100),
            memory_limit: Some(400),
            ..RawContainerStats::default()
        })
    }

    async fn inspect(&self, id: &str) -> Result<HostConfigLimits> {
        if id == "ghost" {
            return Err(Error::NotFound(format!("No such container: {}", id)));
        }
        Ok(HostConfigLimits::default())
    }

    async fn details(&self, id: &str) -> Result<ContainerDetails> {
        Ok(ContainerDetails {
            image: format!("registry.local/{}:stable", id),
            running: true,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record(image, "pull")
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(id, "start")
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record(id, "stop")
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.record(id, "restart")
    }
}

/// Provider that is never sampled; the tests push samples directly
struct IdleProvider;

#[async_trait]
impl HostMetricsProvider for IdleProvider {
    async fn os_info(&self) -> Result<OsInfo> {
        Ok(OsInfo::default())
    }

    async fn current_load(&self) -> Result<CpuLoad> {
        Ok(CpuLoad {
            current_load: 0.0,
            cores: 1,
        })
    }

    async fn memory(&self) -> Result<MemorySnapshot> {
        Ok(MemorySnapshot { total: 1, active: 0 })
    }

    async fn fs_size(&self) -> Result<Vec<FsEntry>> {
        Ok(vec![])
    }

    async fn network_stats(&self) -> Result<Vec<NetStat>> {
        Ok(vec![])
    }

    async fn network_interfaces(&self) -> Result<Vec<NetInterface>> {
        Ok(vec![])
    }
}

fn sample(cpu: f64, timestamp: i64) -> Sample {
    Sample {
        os: OsInfo::default(),
        cpu: CpuInfo { load: cpu, cores: 4 },
        memory: MemoryInfo {
            total: 8_000,
            used: 2_000,
            percent: 25.0,
        },
        storage: StorageInfo {
            total: 100,
            used: 40,
            percent: 40.0,
        },
        network: NetworkRate {
            rx_sec: 1_024.0,
            tx_sec: 512.0,
        },
        interfaces: vec![],
        timestamp,
    }
}

fn listing(id: &str, name: &str) -> ContainerListing {
    ContainerListing {
        id: id.to_string(),
        names: vec![format!("/{}", name)],
        image: "sha256:abcdef".to_string(),
        state: "running".to_string(),
        status: "Up 5 minutes".to_string(),
        created: 1_700_000_000,
        ..ContainerListing::default()
    }
}

async fn setup_app(config: DashboardConfig, runtime: Arc<FakeRuntime>) -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    app::register_components(&health_registry).await;

    let config = DashboardConfig {
        uptime_file: None,
        hostname_file: None,
        ..config
    };
    let dashboard = app::build(
        &config,
        runtime,
        Arc::new(IdleProvider),
        health_registry,
        system_clock(),
    )
    .unwrap();

    (create_router(dashboard.state.clone()), dashboard.state)
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    setup_app(DashboardConfig::default(), Arc::new(FakeRuntime::default())).await
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health = json_body(response).await;
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["poller"].is_object());
    assert!(health["components"]["container_runtime"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::CONTAINER_RUNTIME, "socket unreachable")
        .await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::POLLER, "sampling failed")
        .await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state) = setup_test_app().await;

    let response = app.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_ready(true).await;

    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["ready"], true);
}

#[tokio::test]
async fn test_stats_unavailable_until_first_sample() {
    let (app, state) = setup_test_app().await;

    let response = app.clone().oneshot(get("/api/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(json_body(response).await["error"].is_string());

    let now = chrono::Utc::now().timestamp_millis();
    state.telemetry.set_sample(sample(12.0, now));

    let response = app.oneshot(get("/api/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["cpu"]["load"], 12.0);
    assert_eq!(body["memory"]["percent"], 25.0);
    assert_eq!(body["timestamp"], now);
}

#[tokio::test]
async fn test_history_lists_points_oldest_first() {
    let (app, state) = setup_test_app().await;
    let now = chrono::Utc::now().timestamp_millis();

    state.telemetry.set_sample(sample(10.0, now - 4_000));
    state.telemetry.set_sample(sample(20.0, now - 2_000));
    state.telemetry.set_sample(sample(30.0, now));

    let response = app.oneshot(get("/api/stats/history")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let history = json_body(response).await;
    let points = history.as_array().unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(points[0]["cpu"], 10.0);
    assert_eq!(points[2]["cpu"], 30.0);
    assert_eq!(points[2]["network"]["rx"], 1_024.0);
}

#[tokio::test]
async fn test_stream_sends_latest_sample_first() {
    let (app, state) = setup_test_app().await;
    state
        .telemetry
        .set_sample(sample(42.0, chrono::Utc::now().timestamp_millis()));

    let response = app.oneshot(get("/api/stats/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(state.telemetry.subscriber_count(), 1);

    let mut body = response.into_body().into_data_stream();
    let frame = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.contains("event: update"));
    assert!(text.contains("\"load\":42.0"));

    drop(body);
    // Dropped clients are removed on the next publish at the latest
    state
        .telemetry
        .set_sample(sample(43.0, chrono::Utc::now().timestamp_millis()));
    assert_eq!(state.telemetry.subscriber_count(), 0);
}

#[tokio::test]
async fn test_shutdown_ends_open_streams_and_signals_background_tasks() {
    let (_app, state) = setup_test_app().await;
    state
        .telemetry
        .set_sample(sample(42.0, chrono::Utc::now().timestamp_millis()));
    let mut poller_shutdown = state.shutdown.subscribe();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (trigger, triggered) = oneshot::channel::<()>();
    let server = tokio::spawn(serve_listener(listener, state.clone(), async move {
        let _ = triggered.await;
    }));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /api/stats/stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut received = String::new();
    let mut buf = [0u8; 4096];
    while !received.contains("event: update") {
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the first event");
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(received.starts_with("HTTP/1.1 200 OK"), "{}", received);

    trigger.send(()).unwrap();
    let served = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server kept draining an open event stream");
    served.unwrap().unwrap();
    assert!(poller_shutdown.try_recv().is_ok());
    drop(client);
}

#[tokio::test]
async fn test_container_listing() {
    let runtime = Arc::new(FakeRuntime {
        containers: vec![listing("0123456789abcdef0123", "web")],
        ..FakeRuntime::default()
    });
    let (app, _state) = setup_app(DashboardConfig::default(), runtime).await;

    let response = app.oneshot(get("/api/docker/containers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let containers = json_body(response).await;
    let entry = &containers.as_array().unwrap()[0];
    assert_eq!(entry["id"], "0123456789ab");
    assert_eq!(entry["name"], "web");
    assert_eq!(entry["image"], "abcdef");
    assert_eq!(entry["stats"]["mem_usage"], 100);
    assert_eq!(entry["stats"]["cpu_percent"], 20.0);
}

#[tokio::test]
async fn test_container_stats_by_ids() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(get("/api/docker/containers/stats?ids=web,db"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await;
    assert_eq!(stats["web"]["mem_percent"], 25.0);
    assert_eq!(stats["db"]["mem_usage"], 100);

    let response = app
        .oneshot(get("/api/docker/containers/stats"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!({}));
}

#[tokio::test]
async fn test_container_stats_rejects_invalid_ids() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(get("/api/docker/containers/stats?ids=web,..%2Fetc"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn test_container_actions_disabled_by_default() {
    let runtime = Arc::new(FakeRuntime::default());
    let (app, _state) = setup_app(DashboardConfig::default(), runtime.clone()).await;

    let response = app.oneshot(post("/api/docker/web/restart")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(runtime.actions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_container_actions_when_enabled() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = DashboardConfig {
        allow_container_actions: true,
        ..DashboardConfig::default()
    };
    let (app, _state) = setup_app(config, runtime.clone()).await;

    let response = app
        .clone()
        .oneshot(post("/api/docker/web/restart"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["action"], "restart");
    assert_eq!(body["id"], "web");

    let response = app
        .clone()
        .oneshot(post("/api/docker/web/destroy"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.oneshot(post("/api/docker/ghost/stop")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(
        *runtime.actions.lock().unwrap(),
        vec![("web".to_string(), "restart")]
    );
}

#[tokio::test]
async fn test_redeploy_action() {
    let runtime = Arc::new(FakeRuntime::default());
    let config = DashboardConfig {
        allow_container_actions: true,
        ..DashboardConfig::default()
    };
    let (app, _state) = setup_app(config, runtime.clone()).await;

    let response = app
        .clone()
        .oneshot(post("/api/docker/0123456789ab/redeploy"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["action"], "redeploy");

    // Redeploy wants a hex id, not a name
    let response = app.oneshot(post("/api/docker/web/redeploy")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(
        *runtime.actions.lock().unwrap(),
        vec![
            ("registry.local/0123456789ab:stable".to_string(), "pull"),
            ("0123456789ab".to_string(), "restart"),
        ]
    );
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let config = DashboardConfig {
        rate_limit_per_minute: 2,
        ..DashboardConfig::default()
    };
    let (app, _state) = setup_app(config, Arc::new(FakeRuntime::default())).await;

    let from = |ip: &str| {
        Request::builder()
            .uri("/api/docker/containers")
            .header("x-forwarded-for", format!("{}, 10.0.0.1", ip))
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(from("203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(from("203.0.113.7")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    let retry_after: i64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert!(headers.contains_key("x-ratelimit-reset"));

    // Another client has its own window
    let response = app.clone().oneshot(from("198.51.100.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Telemetry endpoints are not limited
    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, state) = setup_test_app().await;

    state.metrics.inc_rate_limited();
    state.metrics.inc_samples_collected();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body_str = String::from_utf8(body.to_vec()).unwrap();

    assert!(body_str.contains("dashboard_rate_limited_requests_total"));
    assert!(body_str.contains("dashboard_samples_collected_total"));
}
