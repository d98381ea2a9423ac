//! SSE client transport: GET-only receive with a companion POST sender.
//!
//! The legacy MCP SSE handshake announces the POST endpoint in the first
//! `endpoint` event. The receive stream re-establishes itself with
//! exponential backoff + jitter and `Last-Event-ID` replay; sends fail fast
//! once the connection is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Connection, Transport, TransportError, backoff_delay, build_http_client, new_inbox};
use crate::config::UpstreamSpec;

/// Receive-stream reconnect attempts before the transport gives up.
const MAX_RECONNECTS: u32 = 5;

/// How long a send waits for the endpoint announcement.
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Comment lines (used as
/// heartbeats) are discarded.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    tail: String,
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.tail.push_str(chunk);

        while let Some(newline) = self.tail.find('\n') {
            let line: String = self.tail.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if line.starts_with(':') {
                // comment / heartbeat
            } else {
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "data" => self.data.push(value.to_string()),
                    "event" => self.event = Some(value.to_string()),
                    "id" => self.id = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            id: self.id.take(),
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(event)
    }
}

pub struct SseTransport {
    upstream_id: String,
    http: reqwest::Client,
    endpoint: watch::Receiver<Option<Url>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Open the GET stream and wire the sender.
///
/// The first connection attempt happens inline so auto-detection can fall
/// back to streamable HTTP on failure.
///
/// # Errors
///
/// Returns a transport error when the initial GET is rejected.
pub async fn connect(spec: &UpstreamSpec) -> Result<Connection, TransportError> {
    let base = Url::parse(
        spec.url
            .as_deref()
            .ok_or_else(|| TransportError::Handshake("SSE transport needs a url".into()))?,
    )?;
    let http = build_http_client(spec)?;

    let response = open_stream(&http, &base, None).await?;
    tracing::info!(upstream = %spec.id, url = %base, "SSE stream connected");

    let (tx, incoming) = new_inbox();
    let (endpoint_tx, endpoint_rx) = watch::channel(None);
    let connected = Arc::new(AtomicBool::new(true));
    let cancel = CancellationToken::new();

    let transport = Arc::new(SseTransport {
        upstream_id: spec.id.clone(),
        http: http.clone(),
        endpoint: endpoint_rx,
        connected: connected.clone(),
        cancel: cancel.clone(),
    });

    let upstream_id = spec.id.clone();
    tokio::spawn(async move {
        let mut response = Some(response);
        let mut last_event_id: Option<String> = None;
        let mut attempt: u32 = 0;

        loop {
            let stream_response = match response.take() {
                Some(r) => r,
                None => match open_stream(&http, &base, last_event_id.as_deref()).await {
                    Ok(r) => {
                        tracing::info!(upstream = %upstream_id, "SSE stream reconnected");
                        attempt = 0;
                        r
                    }
                    Err(e) => {
                        tracing::warn!(upstream = %upstream_id, error = %e, "SSE reconnect failed");
                        attempt += 1;
                        if attempt >= MAX_RECONNECTS {
                            break;
                        }
                        let delay = backoff_delay(attempt);
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            let mut decoder = SseDecoder::default();
            let mut body = stream_response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => None,
                    chunk = body.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let Ok(bytes) = chunk else { break };

                for event in decoder.push(&String::from_utf8_lossy(&bytes)) {
                    if event.id.is_some() {
                        last_event_id = event.id.clone();
                    }
                    match event.event.as_str() {
                        "endpoint" => {
                            match base.join(event.data.trim()) {
                                Ok(endpoint) => {
                                    tracing::debug!(upstream = %upstream_id, endpoint = %endpoint, "SSE endpoint announced");
                                    let _ = endpoint_tx.send(Some(endpoint));
                                }
                                Err(e) => {
                                    tracing::warn!(upstream = %upstream_id, error = %e, "bad SSE endpoint");
                                }
                            }
                        }
                        _ => match serde_json::from_str::<Value>(&event.data) {
                            Ok(frame) => {
                                if tx.send(frame).await.is_err() {
                                    cancel.cancel();
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(upstream = %upstream_id, error = %e, "dropping unparseable SSE frame");
                            }
                        },
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            attempt += 1;
            if attempt >= MAX_RECONNECTS {
                tracing::warn!(upstream = %upstream_id, "SSE reconnect attempts exhausted");
                break;
            }
            let delay = backoff_delay(attempt);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        connected.store(false, Ordering::SeqCst);
        // Dropping tx ends the inbox.
    });

    Ok(Connection { transport, incoming })
}

async fn open_stream(
    http: &reqwest::Client,
    url: &Url,
    last_event_id: Option<&str>,
) -> Result<reqwest::Response, TransportError> {
    let mut request = http
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        request = request.header("last-event-id", id);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            message: "SSE endpoint rejected the stream".to_string(),
        });
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("text/event-stream") {
        return Err(TransportError::Handshake(format!(
            "expected text/event-stream, got '{content_type}'"
        )));
    }
    Ok(response)
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        if !self.connected() {
            return Err(TransportError::Closed);
        }

        // Wait for the endpoint announcement on a fresh stream.
        let mut endpoint_rx = self.endpoint.clone();
        let endpoint = tokio::time::timeout(ENDPOINT_WAIT, async {
            loop {
                if let Some(url) = endpoint_rx.borrow().clone() {
                    return Some(url);
                }
                if endpoint_rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
        .ok_or_else(|| TransportError::Handshake("no endpoint announced".into()))?;

        let response = self
            .http
            .post(endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                // Network failure ends the connection; the manager decides
                // whether to reconnect.
                self.connected.store(false, Ordering::SeqCst);
                self.cancel.cancel();
                TransportError::Http(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: format!("POST to SSE endpoint failed for {}", self.upstream_id),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_and_heartbeats() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(":heartbeat\n\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, r#"{"a":1}"#);
    }

    #[test]
    fn decodes_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push("event: endp").is_empty());
        assert!(decoder.push("oint\ndata: /messages?id=1\n").is_empty());
        let events = decoder.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?id=1");
    }

    #[test]
    fn joins_multi_line_data_and_tracks_ids() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push("id: 7\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn handles_crlf_lines() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push("data: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[tokio::test]
    async fn connect_rejects_non_sse_responses() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;

        let spec = UpstreamSpec {
            id: "r".to_string(),
            url: Some(format!("{}/sse", server.uri())),
            ..UpstreamSpec::default()
        };
        let err = connect(&spec).await.unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
    }
}
