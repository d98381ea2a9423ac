//! Downstream streamable-HTTP endpoint.
//!
//! One path accepts POST (requests, answered as JSON or an SSE stream),
//! GET (the session's long-lived notification stream), and DELETE (session
//! close). Response-mode selection, session-id adoption, progress routing,
//! keepalives, and the POST guard all live here.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::defaults;
use crate::hub::Hub;
use crate::protocol::{JsonRpcResponse, RpcBody, codes, methods};
use crate::router::RequestContext;
use crate::server::session::DownstreamSession;

const SESSION_HEADER: &str = "mcp-session-id";

/// Build the downstream router: the MCP endpoint plus health probes.
pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(
            "/mcp",
            get(handle_get).post(handle_post).delete(handle_delete),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "hatago-hub",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    let statuses = hub.manager().statuses();
    let ready = statuses
        .iter()
        .filter(|s| s.actual == crate::upstream::ActualState::Ready)
        .count();
    Json(serde_json::json!({
        "status": "ready",
        "upstreams": statuses.len(),
        "upstreamsReady": ready,
        "sessions": hub.sessions().count(),
        "toolsetRevision": hub.registry().revision(),
    }))
}

fn session_id_of(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn accepts(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(mime) || accept.contains("*/*"))
}

fn session_header_value(session: &DownstreamSession) -> HeaderValue {
    HeaderValue::from_str(&session.id)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

async fn handle_post(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let accepts_json = accepts(&headers, "application/json");
    let accepts_sse = accepts(&headers, "text/event-stream");
    if !accepts_json && !accepts_sse {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Json(JsonRpcResponse::error(
                None,
                codes::PARSE_ERROR,
                format!("Parse error: {e}"),
            ))
            .into_response();
        }
    };
    let body: RpcBody = match serde_json::from_value(value) {
        Ok(body) => body,
        Err(e) => {
            return Json(JsonRpcResponse::error(
                None,
                codes::INVALID_REQUEST,
                format!("Invalid Request: {e}"),
            ))
            .into_response();
        }
    };
    if body.messages().is_empty() {
        return Json(JsonRpcResponse::error(
            None,
            codes::INVALID_REQUEST,
            "Invalid Request: empty batch",
        ))
        .into_response();
    }

    // `initialize` always allocates a fresh session; anything else adopts a
    // live id or gets a replacement (auto-reinitialization).
    let has_initialize = body
        .messages()
        .iter()
        .any(|m| m.method == methods::INITIALIZE);
    let session = if has_initialize {
        hub.sessions().create()
    } else {
        hub.sessions().get_or_create(session_id_of(&headers))
    };

    if body.notifications_only() {
        let ctx = RequestContext {
            session: Some(session.clone()),
            response_stream: None,
            cancel: CancellationToken::new(),
        };
        hub.handle_body(body, &ctx).await;
        return (
            StatusCode::ACCEPTED,
            [(SESSION_HEADER, session_header_value(&session))],
        )
            .into_response();
    }

    if body.wants_stream() && accepts_sse {
        respond_streaming(hub, session, body)
    } else {
        respond_json(hub, session, body).await
    }
}

/// Plain JSON response mode: dispatch in order, answer in one body.
async fn respond_json(hub: Arc<Hub>, session: Arc<DownstreamSession>, body: RpcBody) -> Response {
    let is_batch = body.is_batch();
    let ctx = RequestContext {
        session: Some(session.clone()),
        response_stream: None,
        cancel: CancellationToken::new(),
    };
    let mut responses = hub.handle_body(body, &ctx).await;

    let payload = if is_batch {
        serde_json::to_value(&responses).unwrap_or(Value::Null)
    } else {
        responses
            .pop()
            .and_then(|r| serde_json::to_value(r).ok())
            .unwrap_or(Value::Null)
    };

    (
        [(SESSION_HEADER, session_header_value(&session))],
        Json(payload),
    )
        .into_response()
}

/// SSE response mode: every response (and any progress frame that is not
/// claimed by a GET stream) goes out as one `data:` frame; the stream ends
/// when the batch is fully answered or the guard elapses.
fn respond_streaming(hub: Arc<Hub>, session: Arc<DownstreamSession>, body: RpcBody) -> Response {
    let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let cancel = CancellationToken::new();

    let ctx = RequestContext {
        session: Some(session.clone()),
        response_stream: Some(frame_tx.clone()),
        cancel: cancel.clone(),
    };

    let dispatch_hub = hub.clone();
    tokio::spawn(async move {
        for message in body.into_messages() {
            if let Some(response) = dispatch_hub.handle(message, &ctx).await {
                if let Ok(frame) = serde_json::to_value(&response) {
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
            }
        }
        // frame_tx drops here; once progress routes clear, the stream ends.
    });

    let stream = post_stream(frame_rx, cancel);
    (
        [(SESSION_HEADER, session_header_value(&session))],
        Sse::new(stream),
    )
        .into_response()
}

fn post_stream(
    mut frames: tokio::sync::mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // Dropped on client disconnect as well as on normal completion;
        // either way the batch's upstream calls stop waiting.
        let _cancel_guard = CancelOnDrop(cancel);
        let guard = tokio::time::sleep(defaults::POST_GUARD);
        tokio::pin!(guard);

        loop {
            tokio::select! {
                () = &mut guard => {
                    let timeout = JsonRpcResponse::error(
                        None,
                        codes::SERVER_ERROR,
                        "response collection timed out",
                    );
                    if let Ok(data) = serde_json::to_string(&timeout) {
                        yield Ok(Event::default().data(data));
                    }
                    break;
                }
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Ok(data) = serde_json::to_string(&frame) {
                                yield Ok(Event::default().data(data));
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// The session's long-lived notification channel.
async fn handle_get(State(hub): State<Arc<Hub>>, headers: HeaderMap) -> Response {
    if !accepts(&headers, "text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let session = hub.sessions().get_or_create(session_id_of(&headers));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let stream_token = session.attach_get_stream(tx);
    tracing::debug!(session_id = %session.id, "GET-SSE stream opened");

    // The guard rides inside the stream so a client disconnect releases the
    // session's stream slot.
    let guard = GetStreamGuard { session: session.clone(), token: stream_token };
    let stream = UnboundedReceiverStream::new(rx).map(move |frame| {
        let _keep = &guard;
        let data = serde_json::to_string(&frame).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });

    (
        [
            (SESSION_HEADER, session_header_value(&session)),
            (
                "cache-control",
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
        ],
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(defaults::SSE_HEARTBEAT)
                .text("heartbeat"),
        ),
    )
        .into_response()
}

/// Releases the session's stream slot when the client goes away.
struct GetStreamGuard {
    session: Arc<DownstreamSession>,
    token: u64,
}

impl Drop for GetStreamGuard {
    fn drop(&mut self) {
        self.session.detach_get_stream(self.token);
        tracing::debug!(session_id = %self.session.id, "GET-SSE stream closed");
    }
}

/// Cooperative session close. Idempotent: unknown ids still answer 200.
async fn handle_delete(State(hub): State<Arc<Hub>>, headers: HeaderMap) -> Response {
    if let Some(id) = session_id_of(&headers) {
        hub.sessions().remove(id);
    }
    StatusCode::OK.into_response()
}
