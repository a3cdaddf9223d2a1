//! HTTP API: telemetry, container stats, health checks and Prometheus metrics

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dash_core::{
    docker::ContainerService,
    health::{ComponentStatus, HealthRegistry},
    observability::DashboardMetrics,
    rate_limit::RateLimiter,
    telemetry::{TelemetryCache, TelemetryEvent},
    Error,
};
use futures::{stream, Stream, StreamExt};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: DashboardMetrics,
    pub telemetry: Arc<TelemetryCache>,
    pub containers: ContainerService,
    pub rate_limiter: Arc<RateLimiter>,
    pub allow_container_actions: bool,
    /// Fired once when the server begins shutting down
    pub shutdown: broadcast::Sender<()>,
}

/// Library error rendered as `{"error": "..."}`
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidContainerId(_) | Error::InvalidAction(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Upstream(_) | Error::Timeout(_) => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        error_response(status, self.0.to_string())
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still serving
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Latest host sample, 503 until the first poll
async fn latest_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.telemetry.latest() {
        Some(sample) => Json(sample.as_ref().clone()).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "telemetry not yet available"),
    }
}

async fn stats_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.telemetry.history())
}

fn sse_event(event: &TelemetryEvent) -> Option<Event> {
    match event.to_json() {
        Ok(data) => Some(Event::default().event(event.name()).data(data)),
        Err(e) => {
            warn!(error = %e, event = event.name(), "Failed to encode telemetry event");
            None
        }
    }
}

/// Server-sent telemetry stream. The latest sample is sent first; the
/// subscription ends when the client disconnects or the server shuts down.
async fn stats_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.telemetry.subscribe();
    debug!(
        subscriber = subscription.id(),
        subscribers = state.telemetry.subscriber_count(),
        "Telemetry stream opened"
    );

    let mut shutdown = state.shutdown.subscribe();
    let initial = state.telemetry.latest().map(TelemetryEvent::Update);
    let events = stream::iter(initial)
        .chain(subscription)
        .filter_map(|event| async move { sse_event(&event).map(Ok) })
        .take_until(async move {
            let _ = shutdown.recv().await;
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn list_containers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.containers.list().await)
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    ids: Option<String>,
}

async fn container_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    let stats = state.containers.stats(query.ids.as_deref()).await?;
    Ok(Json(stats).into_response())
}

async fn container_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if !state.allow_container_actions {
        return Ok(error_response(
            StatusCode::FORBIDDEN,
            "container actions are disabled",
        ));
    }

    let action = state.containers.perform(&id, &action).await?;
    Ok(Json(json!({ "success": true, "action": action.as_str(), "id": id })).into_response())
}

/// First `X-Forwarded-For` hop, else the peer address
fn client_ip(headers: &HeaderMap, request: &Request) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fixed-window rate limit for the container API
async fn rate_limit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = client_ip(&headers, &request);

    match state.rate_limiter.check(&ip) {
        Ok(()) => Ok(next.run(request).await),
        Err(limited) => {
            state.metrics.inc_rate_limited();
            debug!(client = %ip, retry_after_ms = limited.retry_after_ms, "Rate limit exceeded");

            let retry_secs = limited.retry_after_secs();
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                format!("Rate limit exceeded. Retry after {}s", retry_secs),
            );
            let headers = response.headers_mut();
            headers.insert("retry-after", HeaderValue::from(retry_secs));
            headers.insert("x-ratelimit-limit", HeaderValue::from(limited.limit));
            headers.insert(
                "x-ratelimit-reset",
                HeaderValue::from((limited.reset_at + 999) / 1000),
            );
            Err(response)
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let docker_routes = Router::new()
        .route("/api/docker/containers", get(list_containers))
        .route("/api/docker/containers/stats", get(container_stats))
        .route("/api/docker/:id/:action", post(container_action))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/stats", get(latest_stats))
        .route("/api/stats/history", get(stats_history))
        .route("/api/stats/stream", get(stats_stream))
        .merge(docker_routes)
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %addr, "Starting API server");

    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, state, shutdown).await
}

/// Serve on an already bound listener.
///
/// When `shutdown` resolves, [`AppState::shutdown`] is fired before the
/// drain so open event streams end and background tasks stop alongside it.
pub async fn serve_listener(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let signal = state.shutdown.clone();
    let app = create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        let receivers = signal.send(()).unwrap_or(0);
        debug!(receivers, "Shutdown signalled, draining connections");
    })
    .await?;

    Ok(())
}
