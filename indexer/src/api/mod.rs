use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use pixelchain_types::CanvasConfig;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    Canvas, ChangeNotifier, IndexerConfig, IndexerHandle, IndexerMetrics, NotifyMetrics, SqlStore,
};

mod http;
mod ws;

/// Everything the handlers read from. Writes go through `handle` only.
pub struct AppState {
    pub canvas_config: CanvasConfig,
    pub config: IndexerConfig,
    pub canvas: Arc<Canvas>,
    pub store: Arc<SqlStore>,
    pub handle: IndexerHandle,
    pub notifier: ChangeNotifier,
    pub indexer_metrics: Arc<IndexerMetrics>,
    pub notify_metrics: Arc<NotifyMetrics>,
}

pub struct Api {
    state: Arc<AppState>,
}

impl Api {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        let cors = cors_layer(&parse_allowed_origins("ALLOWED_HTTP_ORIGINS"));

        Router::new()
            .route("/healthz", get(http::healthz))
            .route("/metrics", get(http::metrics))
            .route("/events", post(http::submit_event))
            .route("/canvas", get(http::canvas))
            .route("/canvas/config", get(http::canvas_config))
            .route("/pixels/:position", get(http::pixel))
            .route("/history/:address/:position", get(http::history))
            .route("/history/:address/:position/latest", get(http::latest))
            .route("/cooldown/:address", get(http::cooldown))
            .route("/allowance/:address", get(http::allowance))
            .route("/ws", get(ws::pixels_ws))
            .layer(DefaultBodyLimit::max(self.state.config.http_body_limit()))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(Arc::clone(&self.state))
    }
}

fn parse_allowed_origins(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origins = if allowed.is_empty() || allowed.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed.iter().filter_map(|origin| {
            match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Invalid origin in ALLOWED_HTTP_ORIGINS: {origin}");
                    None
                }
            }
        }))
    };
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")])
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
