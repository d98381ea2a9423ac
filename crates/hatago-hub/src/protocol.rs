//! JSON-RPC 2.0 and MCP wire types.
//!
//! The hub is a relay, not a translator: tool, resource, and prompt
//! descriptors keep their upstream payloads as raw JSON and only the
//! identifying field (`name` / `uri`) is rewritten during namespacing.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version the hub advertises.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions the hub will echo back to a client that requests them.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Well-known method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const SHUTDOWN: &str = "shutdown";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PROGRESS: &str = "notifications/progress";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";

    /// Hub management methods, handled in-process and never routed upstream.
    pub const INTERNAL_SERVERS_LIST: &str = "_internal/servers/list";
    pub const INTERNAL_SERVERS_ACTIVATE: &str = "_internal/servers/activate";
    pub const INTERNAL_SERVERS_DEACTIVATE: &str = "_internal/servers/deactivate";
}

/// Standard JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Generic server-defined error used for hub-side failures.
    pub const SERVER_ERROR: i32 = -32000;
}

/// A JSON-RPC request id. Responses are matched to requests by this value;
/// the hub never rewrites ids in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

/// JSON-RPC 2.0 request or notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcRequest {
    pub const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Build a notification (a request without an id).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// True when this message expects no response.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The `_meta.progressToken` value, if the caller attached one.
    #[must_use]
    pub fn progress_token(&self) -> Option<String> {
        progress_token_of(&self.params)
    }
}

/// Extract a progress token from request params. Tokens may be strings or
/// integers on the wire; both are normalized to their string form.
#[must_use]
pub fn progress_token_of(params: &Value) -> Option<String> {
    match params.get("_meta")?.get("progressToken")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<RequestId>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    #[must_use]
    pub fn error_with_data(
        id: Option<RequestId>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data }),
            id,
        }
    }
}

/// Any inbound JSON-RPC frame: a request/notification or a response.
///
/// Upstream connections carry both directions on one stream, so the reader
/// has to discriminate. A frame with a `method` is a request or notification;
/// a frame with `result`/`error` is a response.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse a single frame from raw JSON.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error when the value is neither shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// A POST body: either one message or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RpcBody {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

impl RpcBody {
    #[must_use]
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// All contained messages, in wire order.
    #[must_use]
    pub fn messages(&self) -> &[JsonRpcRequest] {
        match self {
            Self::Single(req) => std::slice::from_ref(req),
            Self::Batch(reqs) => reqs,
        }
    }

    pub fn into_messages(self) -> Vec<JsonRpcRequest> {
        match self {
            Self::Single(req) => vec![req],
            Self::Batch(reqs) => reqs,
        }
    }

    /// True when no contained message expects a response.
    #[must_use]
    pub fn notifications_only(&self) -> bool {
        self.messages().iter().all(JsonRpcRequest::is_notification)
    }

    /// True when the batch should be answered over an SSE stream: it carries
    /// a tool call or any message with a progress token.
    #[must_use]
    pub fn wants_stream(&self) -> bool {
        self.messages()
            .iter()
            .any(|m| m.method == methods::TOOLS_CALL || m.progress_token().is_some())
    }
}

/// A tool descriptor as listed by an upstream. Only `name` is interpreted;
/// everything else rides along untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// A resource descriptor. Only `uri` is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// A prompt descriptor. Only `name` is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Cached capabilities of one upstream, as fetched after `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamCapabilities {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub server_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

/// Synthesize the hub's own `initialize` result.
#[must_use]
pub fn initialize_result(requested_version: Option<&str>) -> Value {
    let version = requested_version
        .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
        .unwrap_or(PROTOCOL_VERSION);

    serde_json::json!({
        "protocolVersion": version,
        "capabilities": {
            "tools": { "listChanged": true },
            "resources": { "listChanged": true },
            "prompts": { "listChanged": true }
        },
        "serverInfo": {
            "name": "hatago-hub",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_batch_bodies() {
        let single: RpcBody =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
        assert!(!single.is_batch());
        assert_eq!(single.messages().len(), 1);

        let batch: RpcBody = serde_json::from_str(
            r#"[{"jsonrpc":"2.0","method":"ping","id":1},{"jsonrpc":"2.0","method":"notifications/initialized"}]"#,
        )
        .unwrap();
        assert!(batch.is_batch());
        assert_eq!(batch.messages().len(), 2);
        assert!(!batch.notifications_only());
    }

    #[test]
    fn discriminates_requests_from_responses() {
        let req = JsonRpcMessage::from_value(
            serde_json::json!({"jsonrpc":"2.0","method":"ping","id":7}),
        )
        .unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let resp = JsonRpcMessage::from_value(
            serde_json::json!({"jsonrpc":"2.0","result":{},"id":7}),
        )
        .unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));

        let err = JsonRpcMessage::from_value(
            serde_json::json!({"jsonrpc":"2.0","error":{"code":-32000,"message":"x"},"id":7}),
        )
        .unwrap();
        assert!(matches!(err, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn progress_tokens_normalize_to_strings() {
        let with_string = JsonRpcRequest::new(
            1,
            methods::TOOLS_CALL,
            serde_json::json!({"name":"t","_meta":{"progressToken":"p1"}}),
        );
        assert_eq!(with_string.progress_token(), Some("p1".to_string()));

        let with_number = JsonRpcRequest::new(
            2,
            methods::TOOLS_CALL,
            serde_json::json!({"name":"t","_meta":{"progressToken":42}}),
        );
        assert_eq!(with_number.progress_token(), Some("42".to_string()));

        let without = JsonRpcRequest::new(3, methods::TOOLS_CALL, serde_json::json!({"name":"t"}));
        assert_eq!(without.progress_token(), None);
    }

    #[test]
    fn stream_mode_selection() {
        let tool_call: RpcBody = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"x"},"id":1}"#,
        )
        .unwrap();
        assert!(tool_call.wants_stream());

        let listing: RpcBody =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).unwrap();
        assert!(!listing.wants_stream());

        let with_token: RpcBody = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"resources/read","params":{"uri":"u","_meta":{"progressToken":1}},"id":1}"#,
        )
        .unwrap();
        assert!(with_token.wants_stream());
    }

    #[test]
    fn descriptor_payloads_ride_along() {
        let tool: ToolDescriptor = serde_json::from_value(serde_json::json!({
            "name": "say",
            "description": "Echo text",
            "inputSchema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(tool.name, "say");
        assert!(tool.rest.contains_key("inputSchema"));

        let back = serde_json::to_value(&tool).unwrap();
        assert_eq!(back.get("description").unwrap(), "Echo text");
    }

    #[test]
    fn initialize_result_echoes_known_versions() {
        let res = initialize_result(Some("2024-11-05"));
        assert_eq!(res["protocolVersion"], "2024-11-05");

        let res = initialize_result(Some("1999-01-01"));
        assert_eq!(res["protocolVersion"], PROTOCOL_VERSION);

        let res = initialize_result(None);
        assert_eq!(res["protocolVersion"], PROTOCOL_VERSION);
    }
}
