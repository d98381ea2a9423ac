//! Streamable-HTTP client transport.
//!
//! One POST per outbound message. The response is either a JSON body
//! (pushed straight to the inbox) or a `text/event-stream` whose `data:`
//! lines carry JSON-RPC frames (consumed on a task so long tool calls don't
//! block later sends). The server's `mcp-session-id` header is captured
//! from the first response and echoed on every request after it; once a
//! session exists a standing GET stream is opened for server-initiated
//! notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::sse::SseDecoder;
use super::{Connection, Transport, TransportError, backoff_delay, build_http_client, new_inbox};
use crate::config::UpstreamSpec;

const ACCEPT_BOTH: &str = "application/json, text/event-stream";
const SESSION_HEADER: &str = "mcp-session-id";

/// Notification-stream reconnect attempts before giving up on it.
const MAX_GET_RECONNECTS: u32 = 5;

pub struct StreamableHttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    upstream_id: String,
    http: reqwest::Client,
    url: Url,
    session_id: Mutex<Option<String>>,
    tx: Mutex<Option<mpsc::Sender<Value>>>,
    connected: AtomicBool,
    get_stream_started: AtomicBool,
    cancel: CancellationToken,
}

/// Wire up the transport. No I/O happens until the first send, so
/// auto-detect failures surface during the initialize handshake.
///
/// # Errors
///
/// Returns a transport error when the URL or headers are invalid.
pub fn connect(spec: &UpstreamSpec) -> Result<Connection, TransportError> {
    let url = Url::parse(
        spec.url
            .as_deref()
            .ok_or_else(|| TransportError::Handshake("HTTP transport needs a url".into()))?,
    )?;
    let http = build_http_client(spec)?;
    let (tx, incoming) = new_inbox();

    let transport = Arc::new(StreamableHttpTransport {
        inner: Arc::new(Inner {
            upstream_id: spec.id.clone(),
            http,
            url,
            session_id: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
            get_stream_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }),
    });

    Ok(Connection { transport, incoming })
}

impl Inner {
    fn sender(&self) -> Option<mpsc::Sender<Value>> {
        self.tx.lock().expect("tx lock").clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session lock").clone()
    }

    /// Mark the whole connection dead: sends fail, the inbox ends.
    fn fail(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.tx.lock().expect("tx lock").take();
    }

    fn adopt_session(inner: &Arc<Self>, response: &reqwest::Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        {
            let mut guard = inner.session_id.lock().expect("session lock");
            if guard.as_deref() == Some(id) {
                return;
            }
            tracing::debug!(upstream = %inner.upstream_id, session_id = %id, "adopted upstream session");
            *guard = Some(id.to_string());
        }
        if !inner.get_stream_started.swap(true, Ordering::SeqCst) {
            inner.clone().spawn_notification_stream();
        }
    }

    /// Standing GET stream for server-initiated notifications. Optional on
    /// the server side: 404/405 ends it quietly.
    fn spawn_notification_stream(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut last_event_id: Option<String> = None;
            let mut attempt: u32 = 0;

            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let mut request = self
                    .http
                    .get(self.url.clone())
                    .header(reqwest::header::ACCEPT, "text/event-stream");
                if let Some(session) = self.session_id() {
                    request = request.header(SESSION_HEADER, session);
                }
                if let Some(id) = &last_event_id {
                    request = request.header("last-event-id", id.clone());
                }

                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        attempt = 0;
                        let mut decoder = SseDecoder::default();
                        let mut body = response.bytes_stream();
                        loop {
                            let chunk = tokio::select! {
                                () = self.cancel.cancelled() => None,
                                chunk = body.next() => chunk,
                            };
                            let Some(Ok(bytes)) = chunk else { break };
                            for event in decoder.push(&String::from_utf8_lossy(&bytes)) {
                                if event.id.is_some() {
                                    last_event_id = event.id.clone();
                                }
                                if let Ok(frame) = serde_json::from_str::<Value>(&event.data) {
                                    let Some(tx) = self.sender() else { return };
                                    if tx.send(frame).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Ok(response) => {
                        tracing::debug!(
                            upstream = %self.upstream_id,
                            status = %response.status(),
                            "server does not offer a notification stream"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(upstream = %self.upstream_id, error = %e, "notification stream connect failed");
                    }
                }

                attempt += 1;
                if attempt >= MAX_GET_RECONNECTS {
                    break;
                }
                let delay = backoff_delay(attempt);
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        });
    }

    /// Consume an SSE response body, forwarding each frame to the inbox.
    fn spawn_stream_consumer(inner: &Arc<Self>, response: reqwest::Response) {
        let this = inner.clone();
        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut body = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    () = this.cancel.cancelled() => None,
                    chunk = body.next() => chunk,
                };
                let Some(Ok(bytes)) = chunk else { break };
                for event in decoder.push(&String::from_utf8_lossy(&bytes)) {
                    match serde_json::from_str::<Value>(&event.data) {
                        Ok(frame) => {
                            let Some(tx) = this.sender() else { return };
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(upstream = %this.upstream_id, error = %e, "dropping unparseable SSE frame");
                        }
                    }
                }
            }
        });
    }

    async fn push_json_body(&self, body: Value) {
        let Some(tx) = self.sender() else { return };
        match body {
            Value::Array(frames) => {
                for frame in frames {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            frame => {
                let _ = tx.send(frame).await;
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        let inner = &self.inner;
        if !self.connected() {
            return Err(TransportError::Closed);
        }

        let mut request = inner
            .http
            .post(inner.url.clone())
            .header(reqwest::header::ACCEPT, ACCEPT_BOTH)
            .json(&message);
        if let Some(session) = inner.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            inner.fail();
            TransportError::Http(e)
        })?;

        Inner::adopt_session(inner, &response);

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: format!("POST to {} failed", inner.url),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            Inner::spawn_stream_consumer(inner, response);
        } else {
            let bytes = response.bytes().await.map_err(TransportError::Http)?;
            if !bytes.is_empty() {
                let body: Value = serde_json::from_slice(&bytes)?;
                inner.push_json_body(body).await;
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.fail();
    }

    fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec_for(server: &MockServer) -> UpstreamSpec {
        UpstreamSpec {
            id: "remote".to_string(),
            url: Some(format!("{}/mcp", server.uri())),
            ..UpstreamSpec::default()
        }
    }

    #[tokio::test]
    async fn json_responses_reach_the_inbox() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "result": {"ok": true}, "id": 1
            })))
            .mount(&server)
            .await;

        let mut conn = connect(&spec_for(&server)).unwrap();
        conn.transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"ping","id":1}))
            .await
            .unwrap();

        let frame = conn.incoming.recv().await.unwrap();
        assert_eq!(frame["result"]["ok"], true);
    }

    #[tokio::test]
    async fn accepted_notifications_produce_no_frame() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let conn = connect(&spec_for(&server)).unwrap();
        conn.transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sse_response_bodies_are_streamed() {
        let server = MockServer::start().await;
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"result\":{},\"id\":1}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let mut conn = connect(&spec_for(&server)).unwrap();
        conn.transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"tools/call","id":1}))
            .await
            .unwrap();

        let first = conn.incoming.recv().await.unwrap();
        assert_eq!(first["method"], "notifications/progress");
        let second = conn.incoming.recv().await.unwrap();
        assert_eq!(second["id"], 1);
    }

    #[tokio::test]
    async fn session_header_is_echoed_after_adoption() {
        let server = MockServer::start().await;
        // First response assigns the session id.
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-1")
                    .set_body_json(serde_json::json!({"jsonrpc":"2.0","result":{},"id":1})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        // Later requests must carry it back.
        Mock::given(method("POST"))
            .and(header("mcp-session-id", "sess-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"jsonrpc":"2.0","result":{},"id":2})),
            )
            .expect(1)
            .mount(&server)
            .await;
        // The adopted session also triggers the notification GET stream.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let mut conn = connect(&spec_for(&server)).unwrap();
        conn.transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"initialize","id":1}))
            .await
            .unwrap();
        let _ = conn.incoming.recv().await.unwrap();

        conn.transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"ping","id":2}))
            .await
            .unwrap();
        let _ = conn.incoming.recv().await.unwrap();
        conn.transport.close().await;
    }

    #[tokio::test]
    async fn network_failure_fails_send_and_closes() {
        let server = MockServer::start().await;
        let spec = spec_for(&server);
        drop(server); // nothing listening any more

        let mut conn = connect(&spec).unwrap();
        let err = conn
            .transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"ping","id":1}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Http(_)));
        assert!(!conn.transport.connected());
        assert!(conn.incoming.recv().await.is_none());
    }
}
