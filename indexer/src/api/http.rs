use axum::{
    body::Body,
    extract::{Path, Query, State as AxumState},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pixelchain_types::{Address, CanvasConfig, EventKind, RawEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::AppState;
use crate::{
    Action, CanvasStore, Counters, IndexError, IndexerMetricsSnapshot, Ledger,
    NotifyMetricsSnapshot, Outcome, SubmitError,
};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Deserialize)]
pub(super) struct EventRequest {
    kind: EventKind,
    action: Action,
    event: RawEvent,
}

#[derive(Serialize)]
struct OutcomeResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct PixelResponse {
    position: u64,
    color: u32,
}

#[derive(Serialize)]
struct CooldownResponse {
    address: Address,
    last_placed_time: Option<u64>,
}

#[derive(Serialize)]
struct MetricsResponse {
    indexer: IndexerMetricsSnapshot,
    notify: NotifyMetricsSnapshot,
    pending_reconcile: u64,
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    limit: Option<usize>,
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn parse_address(raw: &str) -> Result<Address, Response> {
    Address::parse(raw).map_err(|err| error_response(StatusCode::BAD_REQUEST, err))
}

fn check_position(config: &CanvasConfig, position: u64) -> Result<(), Response> {
    if config.contains(position) {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "position {position} out of range (max {})",
                config.max_position()
            ),
        ))
    }
}

fn status_for(err: &SubmitError) -> StatusCode {
    match err {
        SubmitError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::Rejected(err) => match err {
            IndexError::Decode(_) | IndexError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IndexError::InsufficientAllowance { .. } => StatusCode::CONFLICT,
            IndexError::RevertUnsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            IndexError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn metrics(AxumState(state): AxumState<Arc<AppState>>) -> Response {
    let indexer = state.indexer_metrics.snapshot();
    Json(MetricsResponse {
        pending_reconcile: indexer.pending_reconcile,
        indexer,
        notify: state.notify_metrics.snapshot(),
    })
    .into_response()
}

pub(super) async fn submit_event(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(request): Json<EventRequest>,
) -> Response {
    let result = state
        .handle
        .submit(request.kind, request.action, request.event)
        .await;
    match result {
        Ok(Outcome::Partial { stage, source }) => (
            StatusCode::ACCEPTED,
            Json(OutcomeResponse {
                outcome: "partial",
                stage: Some(stage.to_string()),
                error: Some(source.to_string()),
            }),
        )
            .into_response(),
        Ok(outcome) => Json(OutcomeResponse {
            outcome: outcome.label(),
            stage: None,
            error: None,
        })
        .into_response(),
        Err(err) => error_response(status_for(&err), err),
    }
}

pub(super) async fn canvas(AxumState(state): AxumState<Arc<AppState>>) -> Response {
    match state.canvas.snapshot().await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from(bytes),
        )
            .into_response(),
        Err(err) => {
            tracing::warn!("Canvas snapshot failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, err)
        }
    }
}

pub(super) async fn canvas_config(AxumState(state): AxumState<Arc<AppState>>) -> Response {
    Json(state.canvas_config).into_response()
}

pub(super) async fn pixel(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(position): Path<u64>,
) -> Response {
    if let Err(response) = check_position(&state.canvas_config, position) {
        return response;
    }
    match state.canvas.get(position).await {
        Ok(color) => Json(PixelResponse { position, color }).into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

pub(super) async fn history(
    AxumState(state): AxumState<Arc<AppState>>,
    Path((address, position)): Path<(String, u64)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    if let Err(response) = check_position(&state.canvas_config, position) {
        return response;
    }
    let limit = state.config.history_limit(query.limit);
    match state.store.history(&address, position, limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

pub(super) async fn latest(
    AxumState(state): AxumState<Arc<AppState>>,
    Path((address, position)): Path<(String, u64)>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    if let Err(response) = check_position(&state.canvas_config, position) {
        return response;
    }
    match state.store.most_recent(&address, position).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no placement recorded"),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

pub(super) async fn cooldown(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(address): Path<String>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    match state.store.cooldown(&address).await {
        Ok(last_placed_time) => Json(CooldownResponse {
            address,
            last_placed_time,
        })
        .into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

pub(super) async fn allowance(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(address): Path<String>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    match state.store.allowance(&address).await {
        Ok(allowance) => Json(allowance).into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Api;
    use super::*;
    use crate::{
        service, Canvas, CanvasIndexer, ChangeNotifier, IndexerConfig, IndexerMetrics,
        MemoryCanvas, NotifyMetrics, SqlStore,
    };
    use axum::body::to_bytes;
    use axum::http::Request;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn app() -> (axum::Router, Arc<AppState>) {
        let canvas_config = CanvasConfig::new(4, 4, 4).unwrap();
        let canvas = Arc::new(Canvas::Memory(MemoryCanvas::new(&canvas_config)));
        let store = Arc::new(SqlStore::open_in_memory().unwrap());
        let (updates, _) = broadcast::channel(16);
        let notifier = ChangeNotifier::new(updates, None);
        let indexer_metrics = Arc::new(IndexerMetrics::default());
        let indexer = CanvasIndexer::new(
            canvas_config,
            Arc::clone(&canvas),
            Arc::clone(&store),
            notifier.clone(),
        )
        .with_metrics(Arc::clone(&indexer_metrics));
        let (handle, _task) = service::spawn(indexer, 16, None);
        let state = Arc::new(AppState {
            canvas_config,
            config: IndexerConfig::default(),
            canvas,
            store,
            handle,
            notifier,
            indexer_metrics,
            notify_metrics: Arc::new(NotifyMetrics::default()),
        });
        (Api::new(Arc::clone(&state)).router(), state)
    }

    fn post_event(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn placement(action: &str, position: &str, color: &str, timestamp: u64) -> serde_json::Value {
        json!({
            "kind": "basic_placement",
            "action": action,
            "event": {
                "keys": ["0x1", "0xabc", position, "0x1"],
                "data": [color],
                "timestamp": timestamp
            }
        })
    }

    #[tokio::test]
    async fn test_apply_then_read() {
        let (router, _state) = app();

        let response = router
            .clone()
            .oneshot(post_event(placement("apply", "0x5", "0x7", 10)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"outcome": "applied"}));

        let response = router.clone().oneshot(get("/pixels/5")).await.unwrap();
        assert_eq!(json_body(response).await, json!({"position": 5, "color": 7}));

        let response = router.clone().oneshot(get("/canvas")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[2], 0x07);

        let response = router
            .clone()
            .oneshot(get("/history/0xabc/5?limit=5"))
            .await
            .unwrap();
        let history = json_body(response).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["color"], 7);

        let response = router
            .clone()
            .oneshot(get("/history/0xabc/5/latest"))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["timestamp"], 10);

        let response = router.clone().oneshot(get("/cooldown/0xabc")).await.unwrap();
        assert_eq!(
            json_body(response).await,
            json!({"address": "abc", "last_placed_time": 10})
        );
    }

    #[tokio::test]
    async fn test_status_codes() {
        let (router, _state) = app();

        let response = router
            .clone()
            .oneshot(post_event(placement("apply", "0x64", "0x1", 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = router
            .clone()
            .oneshot(post_event(placement("revert", "0x5", "0x1", 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"outcome": "nothing_to_revert"})
        );

        let consume = json!({
            "kind": "extra_pixels_consumed",
            "action": "apply",
            "event": {"keys": ["0x1", "0xabc"], "data": ["0x2"]}
        });
        let response = router.clone().oneshot(post_event(consume)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let faction = json!({
            "kind": "faction_member_update",
            "action": "revert",
            "event": {"keys": ["0x1", "0xabc"], "data": ["0x10", "0x2"]}
        });
        let response = router.clone().oneshot(post_event(faction)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        let response = router.clone().oneshot(get("/pixels/16")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(get("/history/0xabc/5/latest"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router.clone().oneshot(get("/cooldown/zz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let (router, state) = app();
        router
            .clone()
            .oneshot(post_event(placement("apply", "0x1", "0x2", 1)))
            .await
            .unwrap();

        let response = router.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(json_body(response).await, json!({"ok": true}));

        let response = router.clone().oneshot(get("/metrics")).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body["indexer"]["applied"], 1);
        assert_eq!(body["pending_reconcile"], 0);
        assert_eq!(state.indexer_metrics.snapshot().applied, 1);

        let response = router.oneshot(get("/canvas/config")).await.unwrap();
        let config = json_body(response).await;
        assert_eq!(config["width"], 4);
        assert_eq!(config["color_bit_width"], 4);
    }
}
