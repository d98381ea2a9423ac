//! One live upstream connection: the JSON-RPC request/response matcher.
//!
//! Wraps a transport, assigns monotonically increasing request ids, and
//! pairs responses with waiters. Notifications fan out to subscribers by
//! method; progress notifications route by token when the caller registered
//! one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, HubResult};
use crate::protocol::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, codes, methods,
    progress_token_of,
};
use crate::transport::{Connection, Transport};

type Waiter = oneshot::Sender<HubResult<Value>>;

/// Called inline from the frame pump, so a registered token sees every
/// progress frame strictly before the final response resolves.
pub type ProgressSink = Arc<dyn Fn(Value) + Send + Sync>;

pub struct UpstreamSession {
    upstream_id: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    outstanding: Mutex<HashMap<i64, Waiter>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
    progress_sinks: Mutex<HashMap<String, ProgressSink>>,
    active_calls: AtomicUsize,
    limiter: Semaphore,
    closed_tx: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
}

impl UpstreamSession {
    /// Take ownership of a connection and start the frame pump.
    #[must_use]
    pub fn start(upstream_id: String, connection: Connection, max_in_flight: usize) -> Arc<Self> {
        let Connection { transport, mut incoming } = connection;
        let (closed_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            upstream_id,
            transport,
            next_id: AtomicI64::new(1),
            outstanding: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            progress_sinks: Mutex::new(HashMap::new()),
            active_calls: AtomicUsize::new(0),
            limiter: Semaphore::new(max_in_flight.max(1)),
            closed_tx,
            last_activity: Mutex::new(Instant::now()),
        });

        let pump = session.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                pump.dispatch(frame).await;
            }
            pump.finish("connection closed");
        });

        session
    }

    #[must_use]
    pub fn upstream_id(&self) -> &str {
        &self.upstream_id
    }

    /// Watch that flips to `true` when the connection ends, however it ends.
    #[must_use]
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity lock")
    }

    /// Whether any call is waiting on a response right now.
    #[must_use]
    pub fn has_active_calls(&self) -> bool {
        self.active_calls.load(Ordering::SeqCst) > 0
            || !self.outstanding.lock().expect("outstanding lock").is_empty()
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    /// Issue a request and wait for its response, the deadline, or
    /// cancellation, whichever comes first.
    ///
    /// On success the response `result` is returned; a JSON-RPC error from
    /// the upstream maps to [`HubError::ToolInvocation`] with code, message,
    /// and data preserved.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HubResult<Value> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| self.closed_error())?;

        self.touch();
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard(self);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().expect("outstanding lock").insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let frame = serde_json::to_value(&request)
            .map_err(|e| HubError::internal(format!("encode request: {e}")))?;

        if let Err(e) = self.transport.send(frame).await {
            self.outstanding.lock().expect("outstanding lock").remove(&id);
            return Err(HubError::transport_for(&self.upstream_id, e.to_string()));
        }

        let outcome = tokio::select! {
            response = rx => match response {
                Ok(result) => result,
                Err(_) => Err(self.closed_error()),
            },
            () = tokio::time::sleep(timeout) => {
                self.outstanding.lock().expect("outstanding lock").remove(&id);
                Err(HubError::timeout(method, timeout).with_upstream(&self.upstream_id))
            }
            () = cancel.cancelled() => {
                self.outstanding.lock().expect("outstanding lock").remove(&id);
                Err(HubError::transport_for(&self.upstream_id, "cancelled"))
            }
        };

        drop(guard);
        outcome
    }

    /// Send a notification (fire and forget).
    pub async fn notify(&self, method: &str, params: Value) -> HubResult<()> {
        let frame = serde_json::to_value(JsonRpcRequest::notification(method, params))
            .map_err(|e| HubError::internal(format!("encode notification: {e}")))?;
        self.transport
            .send(frame)
            .await
            .map_err(|e| HubError::transport_for(&self.upstream_id, e.to_string()))
    }

    /// Subscribe to notifications of one method.
    #[must_use]
    pub fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Route progress notifications carrying `token` to `sink` until
    /// [`Self::clear_progress`] is called.
    pub fn register_progress(&self, token: &str, sink: ProgressSink) {
        self.progress_sinks
            .lock()
            .expect("progress lock")
            .insert(token.to_string(), sink);
    }

    pub fn clear_progress(&self, token: &str) {
        self.progress_sinks.lock().expect("progress lock").remove(token);
    }

    /// Close the transport and reject every outstanding waiter with a
    /// transport error carrying `reason`.
    pub async fn close_with_reason(&self, reason: &str) {
        self.transport.close().await;
        self.finish(reason);
    }

    pub async fn close(&self) {
        self.close_with_reason("connection closed").await;
    }

    fn closed_error(&self) -> HubError {
        HubError::transport_for(&self.upstream_id, "connection closed")
    }

    fn finish(&self, reason: &str) {
        let waiters: Vec<Waiter> = {
            let mut outstanding = self.outstanding.lock().expect("outstanding lock");
            outstanding.drain().map(|(_, tx)| tx).collect()
        };
        if !waiters.is_empty() {
            tracing::debug!(
                upstream = %self.upstream_id,
                count = waiters.len(),
                "rejecting outstanding calls: {reason}"
            );
        }
        for waiter in waiters {
            let _ = waiter.send(Err(HubError::transport_for(&self.upstream_id, reason)));
        }
        self.subscribers.lock().expect("subscribers lock").clear();
        self.progress_sinks.lock().expect("progress lock").clear();
        self.limiter.close();
        let _ = self.closed_tx.send(true);
    }

    async fn dispatch(&self, frame: Value) {
        match JsonRpcMessage::from_value(frame) {
            Ok(JsonRpcMessage::Response(response)) => self.complete(response),
            Ok(JsonRpcMessage::Request(request)) if request.is_notification() => {
                self.dispatch_notification(&request);
            }
            Ok(JsonRpcMessage::Request(request)) => {
                // Server-initiated request; only ping is meaningful.
                let reply = if request.method == methods::PING {
                    JsonRpcResponse::success(request.id, serde_json::json!({}))
                } else {
                    tracing::warn!(
                        upstream = %self.upstream_id,
                        method = %request.method,
                        "unsupported server-initiated request"
                    );
                    JsonRpcResponse::error(
                        request.id,
                        codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    )
                };
                if let Ok(frame) = serde_json::to_value(&reply) {
                    let _ = self.transport.send(frame).await;
                }
            }
            Err(e) => {
                tracing::warn!(upstream = %self.upstream_id, error = %e, "dropping malformed frame");
            }
        }
    }

    fn complete(&self, response: JsonRpcResponse) {
        let Some(RequestId::Number(id)) = response.id else {
            tracing::warn!(upstream = %self.upstream_id, "response with unknown id shape");
            return;
        };
        let Some(waiter) = self.outstanding.lock().expect("outstanding lock").remove(&id)
        else {
            tracing::debug!(upstream = %self.upstream_id, id, "response for unknown or expired call");
            return;
        };
        self.touch();

        let outcome = match (response.result, response.error) {
            (_, Some(error)) => Err(HubError::ToolInvocation {
                message: error.message,
                code: error.code,
                data: error.data,
                upstream_id: self.upstream_id.clone(),
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        let _ = waiter.send(outcome);
    }

    fn dispatch_notification(&self, request: &JsonRpcRequest) {
        if request.method == methods::PROGRESS {
            if let Some(token) = progress_token_of(&request.params) {
                let sink = self
                    .progress_sinks
                    .lock()
                    .expect("progress lock")
                    .get(&token)
                    .cloned();
                if let Some(sink) = sink {
                    let frame = serde_json::to_value(request).unwrap_or(Value::Null);
                    sink(frame);
                    return;
                }
            }
        }

        let targets: Vec<mpsc::UnboundedSender<Value>> = {
            let subscribers = self.subscribers.lock().expect("subscribers lock");
            subscribers.get(&request.method).cloned().unwrap_or_default()
        };
        if targets.is_empty() {
            tracing::trace!(
                upstream = %self.upstream_id,
                method = %request.method,
                "notification with no subscriber"
            );
            return;
        }
        let frame = serde_json::to_value(request).unwrap_or(Value::Null);
        for target in targets {
            let _ = target.send(frame.clone());
        }
    }
}

/// Keeps `active_calls` balanced across every exit path of `call`.
struct CallGuard<'a>(&'a UpstreamSession);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.active_calls.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("upstream_id", &self.upstream_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Test transport: frames sent by the session are exposed on a channel,
    /// and the test injects inbound frames through the connection inbox.
    struct FakeTransport {
        sent: mpsc::UnboundedSender<Value>,
        connected: AtomicBool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, message: Value) -> Result<(), TransportError> {
            if !self.connected() {
                return Err(TransportError::Closed);
            }
            self.sent.send(message).map_err(|_| TransportError::Closed)
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        session: Arc<UpstreamSession>,
        sent: mpsc::UnboundedReceiver<Value>,
        inject: mpsc::Sender<Value>,
    }

    fn harness() -> Harness {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inject_tx, inject_rx) = mpsc::channel(16);
        let transport = Arc::new(FakeTransport {
            sent: sent_tx,
            connected: AtomicBool::new(true),
        });
        let session = UpstreamSession::start(
            "echo".to_string(),
            Connection { transport, incoming: inject_rx },
            8,
        );
        Harness { session, sent: sent_rx, inject: inject_tx }
    }

    #[tokio::test]
    async fn matches_response_by_id() {
        let mut h = harness();
        let cancel = CancellationToken::new();

        let session = h.session.clone();
        let call = tokio::spawn(async move {
            session
                .call("tools/call", serde_json::json!({"name":"say"}), Duration::from_secs(5), &cancel)
                .await
        });

        let request = h.sent.recv().await.unwrap();
        assert_eq!(request["method"], "tools/call");
        let id = request["id"].as_i64().unwrap();

        h.inject
            .send(serde_json::json!({"jsonrpc":"2.0","result":{"ok":true},"id":id}))
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn upstream_errors_are_preserved() {
        let mut h = harness();
        let cancel = CancellationToken::new();

        let session = h.session.clone();
        let call = tokio::spawn(async move {
            session
                .call("tools/call", Value::Null, Duration::from_secs(5), &cancel)
                .await
        });

        let id = h.sent.recv().await.unwrap()["id"].as_i64().unwrap();
        h.inject
            .send(serde_json::json!({
                "jsonrpc":"2.0",
                "error":{"code":-32050,"message":"tool exploded","data":{"x":1}},
                "id":id
            }))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        match err {
            HubError::ToolInvocation { code, message, upstream_id, .. } => {
                assert_eq!(code, -32050);
                assert_eq!(message, "tool exploded");
                assert_eq!(upstream_id, "echo");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_times_out() {
        let h = harness();
        let cancel = CancellationToken::new();
        let err = h
            .session
            .call("ping", Value::Null, Duration::from_millis(20), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TIMEOUT");
        assert!(!h.session.has_active_calls());
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let h = harness();
        let cancel = CancellationToken::new();
        let session = h.session.clone();
        let token = cancel.clone();
        let call = tokio::spawn(async move {
            session
                .call("tools/call", Value::Null, Duration::from_secs(30), &token)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "TRANSPORT");
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn close_rejects_outstanding_waiters() {
        let mut h = harness();
        let cancel = CancellationToken::new();
        let session = h.session.clone();
        let call = tokio::spawn(async move {
            session
                .call("tools/call", Value::Null, Duration::from_secs(30), &cancel)
                .await
        });
        let _ = h.sent.recv().await.unwrap();

        drop(h.inject); // transport reader ends: connection closed

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "TRANSPORT");
        assert!(err.to_string().contains("connection closed"));
        assert!(h.session.is_closed());
    }

    #[tokio::test]
    async fn progress_routes_by_token_before_subscribers() {
        let h = harness();
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        h.session.register_progress(
            "p1",
            Arc::new(move |frame| {
                let _ = sink_tx.send(frame);
            }),
        );
        let mut broadcast = h.session.subscribe(methods::PROGRESS);

        h.inject
            .send(serde_json::json!({
                "jsonrpc":"2.0","method":"notifications/progress",
                "params":{"progressToken":"p1","progress":1}
            }))
            .await
            .unwrap();
        h.inject
            .send(serde_json::json!({
                "jsonrpc":"2.0","method":"notifications/progress",
                "params":{"progressToken":"other","progress":2}
            }))
            .await
            .unwrap();

        let routed = sink_rx.recv().await.unwrap();
        assert_eq!(routed["params"]["progressToken"], "p1");
        // The unregistered token falls through to method subscribers.
        let fallthrough = broadcast.recv().await.unwrap();
        assert_eq!(fallthrough["params"]["progressToken"], "other");
    }

    #[tokio::test]
    async fn server_ping_gets_answered() {
        let mut h = harness();
        h.inject
            .send(serde_json::json!({"jsonrpc":"2.0","method":"ping","id":99}))
            .await
            .unwrap();
        let reply = h.sent.recv().await.unwrap();
        assert_eq!(reply["id"], 99);
        assert!(reply["result"].is_object());
    }

    #[tokio::test]
    async fn notifications_fan_out_by_method() {
        let h = harness();
        let mut sub = h.session.subscribe("notifications/tools/list_changed");
        h.inject
            .send(serde_json::json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"}))
            .await
            .unwrap();
        let frame = sub.recv().await.unwrap();
        assert_eq!(frame["method"], "notifications/tools/list_changed");
    }
}
