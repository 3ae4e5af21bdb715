//! Event feed endpoints: SSE stream, ring polling, webhook subscriber CRUD,
//! scan control
//!
//! These routes are only mounted when the file watcher is enabled.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::api::handlers::error_response;
use crate::api::server::AppState;
use crate::watcher::{Dispatcher, FileWatcher};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/events/subscribe", get(sse_subscribe))
        .route("/api/events/poll", get(poll))
        .route(
            "/api/events/subscribers",
            get(list_subscribers)
                .post(add_subscriber)
                .delete(remove_subscriber),
        )
        .route("/api/scan/trigger", post(trigger_scan))
        .route("/api/scan/status", get(scan_status))
}

fn watcher(state: &AppState) -> Result<Arc<FileWatcher>, Response> {
    state
        .watcher
        .clone()
        .ok_or_else(|| error_response(StatusCode::SERVICE_UNAVAILABLE, "file watcher disabled"))
}

fn dispatcher(state: &AppState) -> Result<Arc<Dispatcher>, Response> {
    state
        .dispatcher
        .clone()
        .ok_or_else(|| error_response(StatusCode::SERVICE_UNAVAILABLE, "file watcher disabled"))
}

/// Detaches the live stream when the SSE response is dropped (client went
/// away or the server is shutting down).
struct StreamGuard {
    dispatcher: Arc<Dispatcher>,
    id: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.dispatcher.detach_stream(self.id);
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: StreamGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// GET /api/events/subscribe — Server-Sent Events live stream.
///
/// Framing: an initial `connected` handshake, then one `file` event per
/// emitted `FileEvent`.
pub async fn sse_subscribe(State(state): State<AppState>) -> Response {
    let dispatcher = match dispatcher(&state) {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };

    let (id, rx) = dispatcher.attach_stream();
    let guard = StreamGuard {
        dispatcher: dispatcher.clone(),
        id,
    };

    let handshake = tokio_stream::once(
        Event::default()
            .event("connected")
            .data(r#"{"status":"connected"}"#),
    );
    let events = ReceiverStream::new(rx).map(|event| {
        Event::default()
            .event("file")
            .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()))
    });

    let stream = GuardedStream {
        inner: handshake.chain(events).map(Ok::<_, Infallible>),
        _guard: guard,
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Deserialize)]
pub struct PollParams {
    #[serde(default)]
    pub since: i64,
    pub limit: Option<usize>,
}

/// GET /api/events/poll?since=ms&limit=n — ring-buffer drain
pub async fn poll(State(state): State<AppState>, Query(params): Query<PollParams>) -> Response {
    let watcher = match watcher(&state) {
        Ok(watcher) => watcher,
        Err(response) => return response,
    };

    let events = watcher.recent_events(params.since, params.limit.unwrap_or(100));
    let count = events.len();
    Json(json!({
        "events": events,
        "count": count,
    }))
    .into_response()
}

/// GET /api/events/subscribers
pub async fn list_subscribers(State(state): State<AppState>) -> Response {
    let dispatcher = match dispatcher(&state) {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };

    let subscribers = dispatcher.list_subscribers();
    let count = subscribers.len();
    Json(json!({
        "subscribers": subscribers,
        "count": count,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub url: String,
    #[serde(rename = "eventTypes", default)]
    pub event_types: Vec<String>,
}

/// POST /api/events/subscribers
pub async fn add_subscriber(
    State(state): State<AppState>,
    body: Result<Json<SubscribeRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let dispatcher = match dispatcher(&state) {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };
    if request.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required");
    }

    dispatcher.subscribe(&request.url, request.event_types);
    (
        StatusCode::CREATED,
        Json(json!({
            "status": "ok",
            "message": "Subscribed",
            "url": request.url,
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct UnsubscribeRequest {
    pub url: String,
}

/// DELETE /api/events/subscribers
pub async fn remove_subscriber(
    State(state): State<AppState>,
    body: Result<Json<UnsubscribeRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let dispatcher = match dispatcher(&state) {
        Ok(dispatcher) => dispatcher,
        Err(response) => return response,
    };
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };
    if request.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "url is required");
    }

    dispatcher.unsubscribe(&request.url);
    Json(json!({
        "status": "ok",
        "message": "Unsubscribed",
    }))
    .into_response()
}

/// POST /api/scan/trigger — starts a scan in the background
pub async fn trigger_scan(State(state): State<AppState>) -> Response {
    let watcher = match watcher(&state) {
        Ok(watcher) => watcher,
        Err(response) => return response,
    };

    watcher.trigger_scan();
    Json(json!({
        "status": "ok",
        "message": "Scan triggered",
    }))
    .into_response()
}

/// GET /api/scan/status
pub async fn scan_status(State(state): State<AppState>) -> Response {
    let watcher = match watcher(&state) {
        Ok(watcher) => watcher,
        Err(response) => return response,
    };

    Json(watcher.status()).into_response()
}
