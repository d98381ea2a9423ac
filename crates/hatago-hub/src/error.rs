//! Error types for the hub.
//!
//! Uses `thiserror` for structured error handling. Every error carries a
//! stable kind string that downstream clients receive in the JSON-RPC error
//! `data` payload alongside the owning upstream id, when one is known.

use serde_json::Value;

use crate::protocol::{JsonRpcError, codes};

/// Errors surfaced by hub operations.
#[derive(thiserror::Error, Debug)]
pub enum HubError {
    /// Invalid configuration: bad schema, duplicate ids, or a name collision
    /// under the `error` naming strategy.
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration
        message: String,
    },

    /// Transport-level I/O failure: connection reset, child-process exit,
    /// SSE reconnect exhaustion.
    #[error("transport error: {message}")]
    Transport {
        /// Failure description
        message: String,
        /// Upstream the failure belongs to, when known
        upstream_id: Option<String>,
    },

    /// A spawn, healthcheck, or call deadline elapsed.
    #[error("{what} timed out after {after_ms} ms")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Deadline that elapsed
        after_ms: u64,
        /// Upstream the deadline belongs to, when known
        upstream_id: Option<String>,
    },

    /// The routed upstream returned a JSON-RPC error for a call.
    #[error("upstream error: {message}")]
    ToolInvocation {
        /// Upstream error message, preserved verbatim
        message: String,
        /// Upstream error code, preserved verbatim
        code: i32,
        /// Upstream error data, preserved verbatim
        data: Option<Value>,
        /// Upstream that produced the error
        upstream_id: String,
    },

    /// No tool with the requested public name.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// No resource with the requested public URI.
    #[error("resource not found: {uri}")]
    ResourceNotFound { uri: String },

    /// No prompt with the requested public name.
    #[error("prompt not found: {name}")]
    PromptNotFound { name: String },

    /// Unknown or expired session id on a protected operation.
    #[error("session error: {message}")]
    Session { message: String },

    /// Method is valid MCP but the routed upstream does not implement it.
    #[error("unsupported by upstream {upstream_id}: {method}")]
    UnsupportedFeature { method: String, upstream_id: String },

    /// Unknown top-level method.
    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    /// Structurally invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Missing or malformed params.
    #[error("invalid params: {message}")]
    InvalidParams { message: String },

    /// Invariant violation. Logged with context; never aborts the process.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), upstream_id: None }
    }

    #[must_use]
    pub fn transport_for(upstream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            upstream_id: Some(upstream_id.into()),
        }
    }

    #[must_use]
    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            upstream_id: None,
        }
    }

    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session { message: message.into() }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams { message: message.into() }
    }

    /// Attach an upstream id to errors that can carry one.
    #[must_use]
    pub fn with_upstream(mut self, id: &str) -> Self {
        match &mut self {
            Self::Transport { upstream_id, .. } | Self::Timeout { upstream_id, .. } => {
                *upstream_id = Some(id.to_string());
            }
            _ => {}
        }
        self
    }

    /// Stable kind string, as embedded in the wire `data.kind` field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Transport { .. } => "TRANSPORT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ToolInvocation { .. } => "TOOL_INVOCATION",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::PromptNotFound { .. } => "PROMPT_NOT_FOUND",
            Self::Session { .. } => "SESSION",
            Self::UnsupportedFeature { .. } => "UNSUPPORTED_FEATURE",
            Self::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidParams { .. } => "INVALID_PARAMS",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// The upstream this error belongs to, when known.
    #[must_use]
    pub fn upstream_id(&self) -> Option<&str> {
        match self {
            Self::Transport { upstream_id, .. } | Self::Timeout { upstream_id, .. } => {
                upstream_id.as_deref()
            }
            Self::ToolInvocation { upstream_id, .. }
            | Self::UnsupportedFeature { upstream_id, .. } => Some(upstream_id),
            _ => None,
        }
    }

    /// True for failures worth one retry on idempotent listing calls.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// JSON-RPC error code for the wire.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::InvalidParams { .. }
            | Self::ToolNotFound { .. }
            | Self::ResourceNotFound { .. }
            | Self::PromptNotFound { .. } => codes::INVALID_PARAMS,
            Self::Internal { .. } => codes::INTERNAL_ERROR,
            Self::ToolInvocation { code, .. } => *code,
            _ => codes::SERVER_ERROR,
        }
    }

    /// Convert to the wire error object.
    ///
    /// Upstream errors preserve `message` verbatim; every error embeds
    /// `data: { kind, upstreamId? }`, merged over any upstream-provided data.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let mut data = match self {
            Self::ToolInvocation { data: Some(Value::Object(map)), .. } => map.clone(),
            _ => serde_json::Map::new(),
        };
        data.insert("kind".into(), Value::String(self.kind().to_string()));
        if let Some(id) = self.upstream_id() {
            data.insert("upstreamId".into(), Value::String(id.to_string()));
        }

        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data: Some(Value::Object(data)),
        }
    }
}

/// Result type alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(HubError::config("x").kind(), "CONFIG_ERROR");
        assert_eq!(HubError::transport("x").kind(), "TRANSPORT");
        assert_eq!(
            HubError::timeout("spawn", Duration::from_secs(8)).kind(),
            "TIMEOUT"
        );
        assert_eq!(
            HubError::ToolNotFound { name: "a".into() }.kind(),
            "TOOL_NOT_FOUND"
        );
    }

    #[test]
    fn retryable_split() {
        assert!(HubError::transport("reset").is_retryable());
        assert!(HubError::timeout("call", Duration::from_secs(1)).is_retryable());
        assert!(!HubError::config("bad").is_retryable());
        assert!(!HubError::ToolNotFound { name: "a".into() }.is_retryable());
    }

    #[test]
    fn wire_error_embeds_kind_and_upstream() {
        let err = HubError::transport_for("echo", "connection closed");
        let wire = err.to_rpc_error();
        let data = wire.data.unwrap();
        assert_eq!(data["kind"], "TRANSPORT");
        assert_eq!(data["upstreamId"], "echo");
        assert!(wire.message.contains("connection closed"));
    }

    #[test]
    fn upstream_error_preserves_code_and_data() {
        let err = HubError::ToolInvocation {
            message: "boom".into(),
            code: -32050,
            data: Some(serde_json::json!({"detail": 3})),
            upstream_id: "echo".into(),
        };
        let wire = err.to_rpc_error();
        assert_eq!(wire.code, -32050);
        let data = wire.data.unwrap();
        assert_eq!(data["detail"], 3);
        assert_eq!(data["kind"], "TOOL_INVOCATION");
        assert_eq!(data["upstreamId"], "echo");
    }
}
