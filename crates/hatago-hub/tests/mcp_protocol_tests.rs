//! HTTP-surface protocol tests: the streamable endpoint with no upstreams
//! configured.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use hatago_hub::config::HubConfig;
use hatago_hub::hub::Hub;
use hatago_hub::server::http::create_router;

async fn empty_hub_router() -> (Arc<Hub>, Router) {
    let hub = Hub::new(HubConfig::default(), None, Vec::new()).await;
    let router = create_router(hub.clone());
    (hub, router)
}

fn post(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json, text/event-stream")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn initialize_synthesizes_result_and_session_header() {
    let (_hub, router) = empty_hub_router().await;

    let request = post(&json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": {"protocolVersion": "2025-06-18", "capabilities": {}, "clientInfo": {"name": "t"}},
        "id": 1
    }));
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .expect("session header");
    assert!(!session_id.is_empty());

    let body = body_json(response).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(body["result"]["serverInfo"]["name"], "hatago-hub");
    assert_eq!(body["id"], 1);
}

#[tokio::test]
async fn ping_and_unknown_methods() {
    let (_hub, router) = empty_hub_router().await;

    let response = router
        .clone()
        .oneshot(post(&json!({"jsonrpc":"2.0","method":"ping","id":7})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["id"], 7);
    assert!(body["result"].is_object());

    let response = router
        .oneshot(post(&json!({"jsonrpc":"2.0","method":"no/such/method","id":8})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn missing_accept_header_is_rejected() {
    let (_hub, router) = empty_hub_router().await;
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn malformed_bodies_never_panic() {
    let (_hub, router) = empty_hub_router().await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);

    // Valid JSON, wrong shape.
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json")
        .body(Body::from("42"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);

    // Empty batch.
    let response = router.oneshot(post(&json!([]))).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn notifications_only_batches_return_202() {
    let (_hub, router) = empty_hub_router().await;
    let response = router
        .oneshot(post(&json!({"jsonrpc":"2.0","method":"notifications/initialized"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn batch_responses_preserve_order() {
    let (_hub, router) = empty_hub_router().await;
    let response = router
        .oneshot(post(&json!([
            {"jsonrpc":"2.0","method":"ping","id":1},
            {"jsonrpc":"2.0","method":"notifications/initialized"},
            {"jsonrpc":"2.0","method":"tools/list","id":2}
        ])))
        .await
        .unwrap();
    let body = body_json(response).await;
    let responses = body.as_array().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[1]["id"], 2);
    assert_eq!(responses[1]["result"]["tools"], json!([]));
}

#[tokio::test]
async fn unknown_tool_reports_kind() {
    let (_hub, router) = empty_hub_router().await;
    // JSON-only accept keeps the tool call in plain response mode.
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "jsonrpc":"2.0","method":"tools/call",
                "params":{"name":"ghost_say","arguments":{}},
                "id":1
            })
            .to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["data"]["kind"], "TOOL_NOT_FOUND");
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (hub, router) = empty_hub_router().await;
    let session = hub.sessions().create();

    for _ in 0..2 {
        let request = Request::builder()
            .method("DELETE")
            .uri("/mcp")
            .header("mcp-session-id", session.id.clone())
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // No session header at all still answers 200.
    let request = Request::builder().method("DELETE").uri("/mcp").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn live_session_ids_are_adopted() {
    let (hub, router) = empty_hub_router().await;
    let session = hub.sessions().create();

    let mut request = post(&json!({"jsonrpc":"2.0","method":"ping","id":1}));
    request
        .headers_mut()
        .insert("mcp-session-id", session.id.parse().unwrap());
    let response = router.oneshot(request).await.unwrap();

    let echoed = response.headers().get("mcp-session-id").unwrap().to_str().unwrap();
    assert_eq!(echoed, session.id);
    assert_eq!(hub.sessions().count(), 1);
}

#[tokio::test]
async fn unknown_session_ids_get_replacements() {
    let (hub, router) = empty_hub_router().await;

    let mut request = post(&json!({"jsonrpc":"2.0","method":"ping","id":1}));
    request
        .headers_mut()
        .insert("mcp-session-id", "expired-or-spoofed".parse().unwrap());
    let response = router.oneshot(request).await.unwrap();

    let echoed = response.headers().get("mcp-session-id").unwrap().to_str().unwrap();
    assert_ne!(echoed, "expired-or-spoofed");
    assert!(hub.sessions().get(echoed).is_some());
}

#[tokio::test]
async fn tool_calls_stream_when_sse_accepted() {
    let (_hub, router) = empty_hub_router().await;
    let response = router
        .oneshot(post(&json!({
            "jsonrpc":"2.0","method":"tools/call",
            "params":{"name":"ghost"},
            "id":1
        })))
        .await
        .unwrap();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    let data_line = text
        .lines()
        .find_map(|l| l.strip_prefix("data: "))
        .expect("one data frame");
    let frame: Value = serde_json::from_str(data_line).unwrap();
    assert_eq!(frame["error"]["data"]["kind"], "TOOL_NOT_FOUND");
}

#[tokio::test]
async fn health_and_ready_probes() {
    let (_hub, router) = empty_hub_router().await;

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["upstreams"], 0);
    assert_eq!(body["sessions"], 0);
}
