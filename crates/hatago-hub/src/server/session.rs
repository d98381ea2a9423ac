//! Downstream session management.
//!
//! A session is the state behind one `mcp-session-id`: the initialized
//! flag, the optional long-lived GET-SSE stream, and the progress-token
//! routes for in-flight POSTs. Sessions expire after the TTL and the map is
//! bounded with FIFO eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::defaults;
use crate::protocol::codes;

/// Outbound frame sender for one SSE stream.
pub type StreamSender = mpsc::UnboundedSender<Value>;

pub struct DownstreamSession {
    pub id: String,
    initialized: AtomicBool,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    /// 0..1 GET-SSE stream; the token pairs attach/detach so a stale
    /// disconnect can't drop a newer stream.
    get_stream: Mutex<Option<(u64, StreamSender)>>,
    stream_counter: AtomicU64,
}

impl DownstreamSession {
    fn new(id: String) -> Self {
        Self {
            id,
            initialized: AtomicBool::new(false),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            get_stream: Mutex::new(None),
            stream_counter: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Install the GET-SSE stream, replacing any previous one. Returns a
    /// token for [`Self::detach_get_stream`].
    pub fn attach_get_stream(&self, sender: StreamSender) -> u64 {
        let token = self.stream_counter.fetch_add(1, Ordering::SeqCst) + 1;
        *self.get_stream.lock().expect("stream lock") = Some((token, sender));
        token
    }

    /// Remove the stream if `token` still owns the slot.
    pub fn detach_get_stream(&self, token: u64) {
        let mut slot = self.get_stream.lock().expect("stream lock");
        if slot.as_ref().is_some_and(|(current, _)| *current == token) {
            *slot = None;
        }
    }

    #[must_use]
    pub fn get_stream(&self) -> Option<StreamSender> {
        let mut slot = self.get_stream.lock().expect("stream lock");
        match &*slot {
            Some((_, sender)) if !sender.is_closed() => Some(sender.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    #[must_use]
    pub fn has_get_stream(&self) -> bool {
        self.get_stream().is_some()
    }

    /// Take the stream out of the slot so dropping the returned sender
    /// actually ends it.
    fn close_get_stream(&self) -> Option<StreamSender> {
        self.get_stream
            .lock()
            .expect("stream lock")
            .take()
            .map(|(_, sender)| sender)
    }
}

impl std::fmt::Debug for DownstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamSession")
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

struct ProgressRoute {
    session_id: String,
    /// The POST stream carrying the originating call; absent when the
    /// response went out as plain JSON.
    post_stream: Option<StreamSender>,
    /// Request streams are collected by age; GET streams are not.
    created_at: Instant,
}

#[derive(Default)]
struct Maps {
    sessions: HashMap<String, Arc<DownstreamSession>>,
    /// Insertion order for FIFO eviction.
    order: VecDeque<String>,
    /// `(session, token)` to the POST stream that carries the call.
    progress: HashMap<(String, String), ProgressRoute>,
}

/// All downstream sessions of one hub. One lock guards every map so session
/// close can clear them atomically.
pub struct SessionManager {
    inner: Mutex<Maps>,
    ttl: Duration,
    bound: usize,
    request_stream_ttl: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Maps::default()),
            ttl,
            bound: defaults::SESSION_BOUND,
            request_stream_ttl: defaults::REQUEST_STREAM_TTL,
        })
    }

    #[cfg(test)]
    fn with_limits(ttl: Duration, bound: usize, request_stream_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Maps::default()),
            ttl,
            bound,
            request_stream_ttl,
        })
    }

    /// Create a session under a fresh server-generated id.
    pub fn create(&self) -> Arc<DownstreamSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(DownstreamSession::new(id.clone()));

        let evicted = {
            let mut maps = self.inner.lock().expect("session lock");
            let mut evicted = Vec::new();
            while maps.sessions.len() >= self.bound {
                let Some(oldest) = maps.order.pop_front() else { break };
                if maps.sessions.remove(&oldest).is_some() {
                    maps.progress.retain(|(sid, _), _| sid != &oldest);
                    evicted.push(oldest);
                }
            }
            maps.order.push_back(id.clone());
            maps.sessions.insert(id, session.clone());
            evicted
        };
        for id in evicted {
            tracing::debug!(session_id = %id, "evicted session (map bound)");
        }

        tracing::debug!(session_id = %session.id, "created downstream session");
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<DownstreamSession>> {
        let maps = self.inner.lock().expect("session lock");
        maps.sessions.get(id).cloned()
    }

    /// Resolve the inbound `mcp-session-id`. A live id is adopted and
    /// touched; a missing, unknown, or expired id gets a fresh session with
    /// a new server-generated id (auto-reinitialization).
    pub fn get_or_create(&self, id: Option<&str>) -> Arc<DownstreamSession> {
        if let Some(id) = id {
            if let Some(session) = self.get(id) {
                if session.idle_for() < self.ttl {
                    session.touch();
                    return session;
                }
                self.remove(id);
            }
        }
        self.create()
    }

    /// Drop a session and everything that references it. Idempotent.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut maps = self.inner.lock().expect("session lock");
            let removed = maps.sessions.remove(id);
            if removed.is_some() {
                maps.order.retain(|entry| entry != id);
                maps.progress.retain(|(sid, _), _| sid != id);
            }
            removed
        };
        match removed {
            Some(session) => {
                close_stream_with_error(&session, "session closed");
                tracing::debug!(session_id = %id, "removed downstream session");
                true
            }
            None => false,
        }
    }

    /// Map a progress token to the POST stream carrying its call. Tokens
    /// are unique within a session; a duplicate replaces the stale route.
    pub fn register_progress(
        &self,
        session_id: &str,
        token: &str,
        post_stream: Option<StreamSender>,
    ) {
        let mut maps = self.inner.lock().expect("session lock");
        maps.progress.insert(
            (session_id.to_string(), token.to_string()),
            ProgressRoute {
                session_id: session_id.to_string(),
                post_stream,
                created_at: Instant::now(),
            },
        );
    }

    /// Clear the mapping once its POST completes.
    pub fn clear_progress(&self, session_id: &str, token: &str) {
        let mut maps = self.inner.lock().expect("session lock");
        maps.progress.remove(&(session_id.to_string(), token.to_string()));
    }

    /// Deliver one progress notification. The session's GET stream wins
    /// when it exists; otherwise the frame rides the POST response stream.
    pub fn route_progress(&self, session_id: &str, token: &str, frame: Value) -> bool {
        let (session, post_stream) = {
            let maps = self.inner.lock().expect("session lock");
            let Some(route) = maps.progress.get(&(session_id.to_string(), token.to_string()))
            else {
                return false;
            };
            (
                maps.sessions.get(&route.session_id).cloned(),
                route.post_stream.clone(),
            )
        };

        if let Some(session) = session {
            if let Some(get_stream) = session.get_stream() {
                return get_stream.send(frame).is_ok();
            }
        }
        match post_stream {
            Some(stream) => stream.send(frame).is_ok(),
            None => false,
        }
    }

    /// Send a notification to every initialized session with a GET stream.
    pub fn broadcast(&self, frame: &Value) -> usize {
        let sessions: Vec<Arc<DownstreamSession>> = {
            let maps = self.inner.lock().expect("session lock");
            maps.sessions.values().cloned().collect()
        };

        let mut delivered = 0;
        for session in sessions {
            if !session.is_initialized() {
                continue;
            }
            if let Some(stream) = session.get_stream() {
                if stream.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// One cleanup pass: expire idle sessions (their GET streams close with
    /// a final error frame) and collect progress routes whose streams died
    /// or whose request stream outlived the request-stream TTL. GET streams
    /// have no age bound.
    pub fn run_cleanup(&self) -> usize {
        let mut timed_out: Vec<StreamSender> = Vec::new();
        let expired: Vec<Arc<DownstreamSession>> = {
            let mut maps = self.inner.lock().expect("session lock");
            let ttl = self.ttl;
            let dead: Vec<String> = maps
                .sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= ttl)
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::new();
            for id in dead {
                if let Some(session) = maps.sessions.remove(&id) {
                    maps.order.retain(|entry| entry != &id);
                    maps.progress.retain(|(sid, _), _| sid != &id);
                    expired.push(session);
                }
            }
            let request_stream_ttl = self.request_stream_ttl;
            maps.progress.retain(|_, route| {
                if route.post_stream.as_ref().is_some_and(|s| s.is_closed()) {
                    return false;
                }
                if route.created_at.elapsed() >= request_stream_ttl {
                    if let Some(stream) = route.post_stream.take() {
                        timed_out.push(stream);
                    }
                    return false;
                }
                true
            });
            expired
        };

        for stream in timed_out {
            let frame = serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": codes::SERVER_ERROR,
                    "message": "request stream expired",
                    "data": { "kind": "TIMEOUT" }
                },
                "id": null
            });
            let _ = stream.send(frame);
            tracing::debug!("collected aged request stream");
        }

        let count = expired.len();
        for session in expired {
            tracing::debug!(session_id = %session.id, "expired downstream session");
            close_stream_with_error(&session, "session expired");
        }
        count
    }

    /// Background cleanup, every 10 s until the token cancels.
    pub fn spawn_cleanup(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(defaults::CLEANUP_SWEEP);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let cleaned = manager.run_cleanup();
                        if cleaned > 0 {
                            tracing::debug!(count = cleaned, "session cleanup completed");
                        }
                    }
                }
            }
        });
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().expect("session lock").sessions.len()
    }
}

fn close_stream_with_error(session: &DownstreamSession, message: &str) {
    if let Some(stream) = session.close_get_stream() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": codes::SERVER_ERROR,
                "message": message,
                "data": { "kind": "SESSION" }
            },
            "id": null
        });
        let _ = stream.send(frame);
        // Dropping the last sender ends the SSE stream after this frame.
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").field("count", &self.count()).finish()
    }
}
