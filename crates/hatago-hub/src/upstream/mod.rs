//! Upstream lifecycle: per-server state, the JSON-RPC session, and the
//! activation manager.

pub mod manager;
pub mod session;

use serde::Serialize;

use crate::config::ActivationPolicy;

/// Whether the hub wants an upstream running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DesiredState {
    Stopped,
    Running,
}

/// Observed upstream lifecycle state.
///
/// `stopped -> starting -> ready -> stopping -> stopped`; any non-terminal
/// state may fall into `failing` on an I/O or handshake error, which settles
/// to `stopped` after bounded backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActualState {
    Stopped,
    Starting,
    Ready,
    Failing,
    Stopping,
}

impl std::fmt::Display for ActualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failing => "failing",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What caused an activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationTrigger {
    Startup,
    ToolCall { tool: String },
    ResourceRead,
    PromptGet,
    Manual,
    Reload,
}

impl ActivationTrigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::ToolCall { .. } => "tool_call",
            Self::ResourceRead => "resource_read",
            Self::PromptGet => "prompt_get",
            Self::Manual => "manual",
            Self::Reload => "reload",
        }
    }
}

/// Snapshot served by `_internal/servers/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub id: String,
    pub desired: DesiredState,
    pub actual: ActualState,
    pub activation_policy: ActivationPolicy,
    pub activations: u64,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
