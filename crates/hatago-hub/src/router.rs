//! Request router: hub-local methods, prefixed dispatch, aggregation, and
//! call forwarding.
//!
//! Hub-local methods are a static match; everything else resolves through
//! the capability registry to the owning upstream, activating it on demand.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEventKind, AuditLog};
use crate::config::Timeouts;
use crate::error::{HubError, HubResult};
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, codes, initialize_result, methods,
};
use crate::registry::CapabilityRegistry;
use crate::server::session::{DownstreamSession, SessionManager, StreamSender};
use crate::upstream::ActivationTrigger;
use crate::upstream::manager::UpstreamManager;

/// Per-request surroundings: the downstream session (absent in stdio mode),
/// the stream that carries this request's response, and the cancellation
/// handle tied to the client connection.
#[derive(Clone)]
pub struct RequestContext {
    pub session: Option<Arc<DownstreamSession>>,
    pub response_stream: Option<StreamSender>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    #[must_use]
    pub fn detached() -> Self {
        Self {
            session: None,
            response_stream: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct Router {
    registry: Arc<CapabilityRegistry>,
    manager: Arc<UpstreamManager>,
    sessions: Arc<SessionManager>,
    timeouts: Timeouts,
    audit: Option<AuditLog>,
}

impl Router {
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        manager: Arc<UpstreamManager>,
        sessions: Arc<SessionManager>,
        timeouts: Timeouts,
        audit: Option<AuditLog>,
    ) -> Self {
        Self { registry, manager, sessions, timeouts, audit }
    }

    /// Dispatch one message. Notifications return `None`.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            self.handle_notification(&request, ctx);
            return None;
        }

        let id = request.id.clone();
        let outcome = self.dispatch(&request, ctx).await;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                let wire = e.to_rpc_error();
                JsonRpcResponse::error_with_data(id, wire.code, wire.message, wire.data)
            }
        })
    }

    fn handle_notification(&self, request: &JsonRpcRequest, ctx: &RequestContext) {
        match request.method.as_str() {
            methods::INITIALIZED => {
                if let Some(session) = &ctx.session {
                    session.mark_initialized();
                    tracing::debug!(session_id = %session.id, "downstream session initialized");
                }
            }
            methods::CANCELLED => {
                tracing::debug!("client cancelled a request");
            }
            other => {
                tracing::trace!(method = %other, "ignoring notification");
            }
        }
    }

    async fn dispatch(&self, request: &JsonRpcRequest, ctx: &RequestContext) -> HubResult<Value> {
        match request.method.as_str() {
            methods::INITIALIZE => {
                let requested = request
                    .params
                    .get("protocolVersion")
                    .and_then(Value::as_str);
                tracing::info!(
                    protocol_version = requested.unwrap_or("unspecified"),
                    "downstream initialize"
                );
                Ok(initialize_result(requested))
            }
            methods::PING => Ok(serde_json::json!({})),
            methods::SHUTDOWN => {
                tracing::info!("downstream requested shutdown");
                Ok(serde_json::json!({}))
            }
            methods::TOOLS_LIST => Ok(serde_json::json!({ "tools": self.registry.list_tools() })),
            methods::RESOURCES_LIST => {
                Ok(serde_json::json!({ "resources": self.registry.list_resources() }))
            }
            methods::PROMPTS_LIST => {
                Ok(serde_json::json!({ "prompts": self.registry.list_prompts() }))
            }
            methods::TOOLS_CALL => self.call_tool(request, ctx).await,
            methods::RESOURCES_READ => self.read_resource(request, ctx).await,
            methods::PROMPTS_GET => self.get_prompt(request, ctx).await,
            methods::INTERNAL_SERVERS_LIST => {
                let statuses = self.manager.statuses();
                Ok(serde_json::json!({ "servers": statuses }))
            }
            methods::INTERNAL_SERVERS_ACTIVATE => {
                let id = require_str(&request.params, "id")?;
                self.manager.activate(id, &ActivationTrigger::Manual, false).await?;
                self.audit(AuditEventKind::ServerActivated, serde_json::json!({"id": id}));
                Ok(serde_json::json!({ "id": id, "actual": "ready" }))
            }
            methods::INTERNAL_SERVERS_DEACTIVATE => {
                let id = require_str(&request.params, "id")?;
                self.manager.deactivate(id, false, "manual deactivate").await?;
                self.audit(AuditEventKind::ServerDeactivated, serde_json::json!({"id": id}));
                Ok(serde_json::json!({ "id": id, "actual": "stopped" }))
            }
            other => match other.split_once("__") {
                Some((upstream_id, method)) if !method.is_empty() => {
                    self.forward_raw(upstream_id, method, request, ctx).await
                }
                _ => Err(HubError::MethodNotFound { method: other.to_string() }),
            },
        }
    }

    async fn call_tool(&self, request: &JsonRpcRequest, ctx: &RequestContext) -> HubResult<Value> {
        let name = require_str(&request.params, "name")?;
        let resolved = self
            .registry
            .resolve_tool(name)
            .ok_or_else(|| HubError::ToolNotFound { name: name.to_string() })?;

        let session = self
            .manager
            .session_for(
                &resolved.upstream_id,
                &ActivationTrigger::ToolCall { tool: resolved.original_name.clone() },
            )
            .await?;

        let mut params = request.params.clone();
        params["name"] = Value::String(resolved.original_name.clone());

        self.audit(
            AuditEventKind::ToolCalled,
            serde_json::json!({
                "tool": name,
                "upstream": resolved.upstream_id,
                "originalName": resolved.original_name,
            }),
        );

        let token = request.progress_token();
        let _relay = token.as_ref().map(|token| {
            ProgressRelay::start(token, &session, ctx, &self.sessions)
        });

        session
            .call(methods::TOOLS_CALL, params, self.timeouts.tool_call(), &ctx.cancel)
            .await
    }

    async fn read_resource(
        &self,
        request: &JsonRpcRequest,
        ctx: &RequestContext,
    ) -> HubResult<Value> {
        let uri = require_str(&request.params, "uri")?;
        let resolved = self
            .registry
            .resolve_resource(uri)
            .ok_or_else(|| HubError::ResourceNotFound { uri: uri.to_string() })?;

        let session = self
            .manager
            .session_for(&resolved.upstream_id, &ActivationTrigger::ResourceRead)
            .await?;

        let mut params = request.params.clone();
        params["uri"] = Value::String(resolved.original_name.clone());

        session
            .call(methods::RESOURCES_READ, params, self.timeouts.tool_call(), &ctx.cancel)
            .await
    }

    async fn get_prompt(&self, request: &JsonRpcRequest, ctx: &RequestContext) -> HubResult<Value> {
        let name = require_str(&request.params, "name")?;
        let resolved = self
            .registry
            .resolve_prompt(name)
            .ok_or_else(|| HubError::PromptNotFound { name: name.to_string() })?;

        let session = self
            .manager
            .session_for(&resolved.upstream_id, &ActivationTrigger::PromptGet)
            .await?;

        let mut params = request.params.clone();
        params["name"] = Value::String(resolved.original_name.clone());

        session
            .call(methods::PROMPTS_GET, params, self.timeouts.tool_call(), &ctx.cancel)
            .await
    }

    /// `{upstreamId}__{method}`: targeted dispatch of an arbitrary method.
    async fn forward_raw(
        &self,
        upstream_id: &str,
        method: &str,
        request: &JsonRpcRequest,
        ctx: &RequestContext,
    ) -> HubResult<Value> {
        if !self.manager.ids().iter().any(|id| id == upstream_id) {
            return Err(HubError::MethodNotFound { method: request.method.clone() });
        }
        let session = self
            .manager
            .session_for(upstream_id, &ActivationTrigger::Manual)
            .await?;
        session
            .call(method, request.params.clone(), self.timeouts.tool_call(), &ctx.cancel)
            .await
    }

    fn audit(&self, kind: AuditEventKind, details: Value) {
        if let Some(audit) = &self.audit {
            audit.record(kind, details);
        }
    }
}

/// Forwards upstream progress notifications for one token to the right
/// downstream stream for as long as the call runs.
struct ProgressRelay {
    token: String,
    upstream: Arc<crate::upstream::session::UpstreamSession>,
    sessions: Arc<SessionManager>,
    session_id: Option<String>,
}

impl ProgressRelay {
    fn start(
        token: &str,
        upstream: &Arc<crate::upstream::session::UpstreamSession>,
        ctx: &RequestContext,
        sessions: &Arc<SessionManager>,
    ) -> Self {
        let session_id = ctx.session.as_ref().map(|s| s.id.clone());
        if let Some(session_id) = &session_id {
            sessions.register_progress(session_id, token, ctx.response_stream.clone());
        }

        // Frames route through the session manager (GET stream preferred)
        // or straight to the response stream in stdio mode.
        let sink: crate::upstream::session::ProgressSink = match (&session_id, &ctx.response_stream)
        {
            (Some(session_id), _) => {
                let sessions = sessions.clone();
                let session_id = session_id.clone();
                let token = token.to_string();
                Arc::new(move |frame| {
                    sessions.route_progress(&session_id, &token, frame);
                })
            }
            (None, Some(direct)) => {
                let direct = direct.clone();
                Arc::new(move |frame| {
                    let _ = direct.send(frame);
                })
            }
            (None, None) => Arc::new(|_| {}),
        };
        upstream.register_progress(token, sink);

        Self {
            token: token.to_string(),
            upstream: upstream.clone(),
            sessions: sessions.clone(),
            session_id,
        }
    }
}

impl Drop for ProgressRelay {
    fn drop(&mut self) {
        self.upstream.clear_progress(&self.token);
        if let Some(session_id) = &self.session_id {
            self.sessions.clear_progress(session_id, &self.token);
        }
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> HubResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::invalid_params(format!("missing '{key}' parameter")))
}

/// Map a parse failure to the wire-level error response.
#[must_use]
pub fn parse_error_response(error: &serde_json::Error) -> JsonRpcResponse {
    JsonRpcResponse::error(None, codes::PARSE_ERROR, format!("Parse error: {error}"))
}
