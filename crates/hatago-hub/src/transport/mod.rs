//! Upstream transport clients.
//!
//! Each transport speaks one framing to one upstream and exposes the same
//! capability: `send(message)`, a receive channel handed out at connect
//! time, `close()`, and `connected`. Transport selection is a pure function
//! of the upstream spec.
//!
//! Failure contract: an I/O failure fails the in-flight send with a
//! transport error and ends the receive channel; transports never schedule
//! their own full reconnection (the activation manager owns that). The SSE
//! receive stream is the one exception: it re-establishes itself with
//! backoff and `Last-Event-ID` replay, and only gives up after repeated
//! failures.

pub mod sse;
pub mod stdio;
pub mod streamable_http;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{RemoteKind, UpstreamSpec};

/// Receive-channel capacity per connection.
const INBOX_CAPACITY: usize = 256;

/// Errors from the transport layer.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Child process could not be spawned.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed outright.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with an unexpected status.
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// A frame was not valid JSON-RPC.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    /// Endpoint URL could not be parsed.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// The SSE receive stream gave up reconnecting.
    #[error("SSE reconnect attempts exhausted")]
    ReconnectExhausted,

    /// Protocol-level connect failure (missing endpoint event, bad
    /// content type).
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Uniform send side of a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one JSON-RPC frame.
    async fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);

    /// Whether the connection is currently usable.
    fn connected(&self) -> bool;
}

/// An established connection: the send half plus the frame inbox. The inbox
/// ends (returns `None`) when the connection closes, however that happens.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub incoming: mpsc::Receiver<Value>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

/// Concrete transport choice after auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedKind {
    Stdio,
    StreamableHttp,
    Sse,
}

/// Transport candidates for a spec, in attempt order.
///
/// Remote URLs with an explicit `kind` get exactly that transport. `auto`
/// detects SSE by path (`/sse`, `/events`) and falls back to the other
/// remote transport when the first attempt fails.
#[must_use]
pub fn candidate_kinds(spec: &UpstreamSpec) -> Vec<ResolvedKind> {
    if spec.is_local() {
        return vec![ResolvedKind::Stdio];
    }
    match spec.kind {
        RemoteKind::Http | RemoteKind::StreamableHttp => vec![ResolvedKind::StreamableHttp],
        RemoteKind::Sse => vec![ResolvedKind::Sse],
        RemoteKind::Auto => {
            if looks_like_sse(spec.url.as_deref().unwrap_or_default()) {
                vec![ResolvedKind::Sse, ResolvedKind::StreamableHttp]
            } else {
                vec![ResolvedKind::StreamableHttp, ResolvedKind::Sse]
            }
        }
    }
}

fn looks_like_sse(raw_url: &str) -> bool {
    let path = url::Url::parse(raw_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| raw_url.to_string());
    let path = path.trim_end_matches('/');
    path.ends_with("/sse") || path.ends_with("/events")
}

/// Open a connection of one concrete kind.
///
/// # Errors
///
/// Returns a transport error when the child cannot be spawned or the remote
/// endpoint rejects the connection attempt.
pub async fn connect(
    spec: &UpstreamSpec,
    kind: ResolvedKind,
) -> Result<Connection, TransportError> {
    match kind {
        ResolvedKind::Stdio => stdio::connect(spec).await,
        ResolvedKind::StreamableHttp => streamable_http::connect(spec),
        ResolvedKind::Sse => sse::connect(spec).await,
    }
}

/// Build the reqwest client shared by the remote transports: spec headers
/// plus bearer auth applied as default headers, no global request timeout
/// (streams are long-lived).
pub(crate) fn build_http_client(
    spec: &UpstreamSpec,
) -> Result<reqwest::Client, TransportError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in &spec.headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TransportError::Handshake(format!("bad header name '{key}': {e}")))?;
        let value = value
            .parse()
            .map_err(|e| TransportError::Handshake(format!("bad header value for '{key}': {e}")))?;
        headers.insert(name, value);
    }
    if let Some(token) = bearer_token(&spec.auth) {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|e| TransportError::Handshake(format!("bad auth token: {e}")))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(std::time::Duration::from_secs(10))
        .gzip(true)
        .build()?)
}

fn bearer_token(auth: &Value) -> Option<&str> {
    match auth.get("type").and_then(Value::as_str) {
        Some("bearer") | None => auth.get("token").and_then(Value::as_str),
        _ => None,
    }
}

pub(crate) fn new_inbox() -> (mpsc::Sender<Value>, mpsc::Receiver<Value>) {
    mpsc::channel(INBOX_CAPACITY)
}

/// Reconnect delay for the given 1-based attempt: exponential from the
/// configured initial value up to the cap, with 30% jitter on top.
#[must_use]
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    use crate::config::defaults;
    use rand::Rng;

    let exp = attempt.saturating_sub(1).min(16);
    let base = defaults::RECONNECT_INITIAL
        .saturating_mul(2u32.saturating_pow(exp))
        .min(defaults::RECONNECT_CAP);
    let jitter = rand::thread_rng().gen_range(0.0..defaults::RECONNECT_JITTER);
    base.mul_f64(1.0 + jitter)
}
