use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State as AxumState,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppState;
use crate::NotifyMetrics;

/// Checks the Origin header of an upgrade request.
///
/// With `ALLOWED_WS_ORIGINS` unset every origin is accepted. Requests without an
/// Origin header (non-browser clients) are accepted unless `ALLOW_WS_NO_ORIGIN` is false.
fn validate_origin(headers: &HeaderMap) -> bool {
    let allowed = std::env::var("ALLOWED_WS_ORIGINS").ok();
    let deny_no_origin = matches!(
        std::env::var("ALLOW_WS_NO_ORIGIN").as_deref(),
        Ok("0") | Ok("false") | Ok("FALSE") | Ok("no") | Ok("NO")
    );
    origin_allowed(headers, allowed.as_deref(), deny_no_origin)
}

fn origin_allowed(headers: &HeaderMap, allowed: Option<&str>, deny_no_origin: bool) -> bool {
    let origin = match headers.get(ORIGIN) {
        Some(value) => match value.to_str() {
            Ok(origin) => origin,
            Err(_) => {
                tracing::warn!("Invalid Origin header encoding");
                return false;
            }
        },
        None => {
            if deny_no_origin {
                tracing::warn!("WebSocket connection rejected: no Origin header");
                return false;
            }
            return true;
        }
    };

    let Some(allowed) = allowed else {
        return true;
    };
    let allowed_list: Vec<&str> = allowed
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if allowed_list.is_empty() || allowed_list.contains(&"*") || allowed_list.contains(&origin) {
        return true;
    }

    tracing::warn!("WebSocket origin rejected: {origin} (allowed: {allowed})");
    false
}

/// Streams every pixel change as a JSON text frame.
pub(super) async fn pixels_ws(
    AxumState(state): AxumState<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !validate_origin(&headers) {
        state.notify_metrics.inc_ws_origin_rejected();
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let updates = state.notifier.subscribe();
    let metrics = Arc::clone(&state.notify_metrics);
    ws.on_upgrade(move |socket| handle_pixels_ws(socket, updates, metrics))
        .into_response()
}

async fn handle_pixels_ws(
    socket: WebSocket,
    mut updates: broadcast::Receiver<pixelchain_types::PixelUpdate>,
    metrics: Arc<NotifyMetrics>,
) {
    metrics.inc_ws_connections();
    tracing::info!("Pixels WebSocket connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            metrics.inc_ws_send_error();
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!("WebSocket error: {err}");
                        break;
                    }
                    _ => {}
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        let text = match serde_json::to_string(&update) {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!("Failed to encode pixel update: {err}");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            metrics.inc_ws_send_error();
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WebSocket client lagged behind");
                        metrics.add_ws_lagged(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let _ = sender.close().await;
    metrics.dec_ws_connections();
    tracing::info!("Pixels WebSocket closed");
}
