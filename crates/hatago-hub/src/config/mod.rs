//! Configuration for the hub.
//!
//! The config file is JSON with comments. String values may reference
//! environment variables with the literal syntax `${env:VAR}`, expanded at
//! load time. Upstream servers can be declared in the compact `mcpServers`
//! map or the detailed `servers` array; both normalize to [`UpstreamSpec`].

pub mod watcher;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, HubResult};

/// Fixed operating constants.
pub mod defaults {
    use std::time::Duration;

    /// Downstream listener port.
    pub const HTTP_PORT: u16 = 3535;

    /// Downstream listener host.
    pub const HTTP_HOST: &str = "127.0.0.1";

    /// Child-process spawn deadline.
    pub const SPAWN_TIMEOUT: Duration = Duration::from_millis(8_000);

    /// Post-spawn `initialize` handshake deadline.
    pub const HEALTHCHECK_TIMEOUT: Duration = Duration::from_millis(2_000);

    /// Tool-call deadline.
    pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_millis(20_000);

    /// Downstream session TTL.
    pub const SESSION_TTL: Duration = Duration::from_secs(3_600);

    /// GET-SSE heartbeat interval.
    pub const SSE_HEARTBEAT: Duration = Duration::from_secs(30);

    /// Guard on POST response collection.
    pub const POST_GUARD: Duration = Duration::from_secs(120);

    /// Downstream session/stream cleanup sweep interval.
    pub const CLEANUP_SWEEP: Duration = Duration::from_secs(10);

    /// Age at which an in-flight request stream's progress route is
    /// collected by the cleanup sweep. GET streams have no age bound.
    pub const REQUEST_STREAM_TTL: Duration = Duration::from_secs(30);

    /// Upstream idle-shutdown sweep interval.
    pub const IDLE_SWEEP: Duration = Duration::from_secs(30);

    /// Idle window before an `onDemand` upstream is shut down.
    pub const IDLE_SHUTDOWN: Duration = Duration::from_secs(300);

    /// Reconnect backoff bounds with 30% jitter applied on top.
    pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
    pub const RECONNECT_CAP: Duration = Duration::from_secs(30);
    pub const RECONNECT_JITTER: f64 = 0.3;

    /// Restart attempts before an `always` upstream is left stopped.
    pub const MAX_RESTARTS: u32 = 10;

    /// Default per-upstream outstanding-call bound.
    pub const GLOBAL_CONCURRENCY: usize = 8;

    /// Downstream session map bound (FIFO eviction past this).
    pub const SESSION_BOUND: usize = 1_000;

    /// Registry public-name parse memo bound.
    pub const PARSE_MEMO_CAPACITY: u64 = 1_000;

    /// Audit log rotation: size trigger and kept generations.
    pub const AUDIT_MAX_BYTES: u64 = 10 * 1024 * 1024;
    pub const AUDIT_GENERATIONS: u32 = 5;

    /// Public-name separator.
    pub const SEPARATOR: &str = "_";

    /// Config reload debounce window.
    pub const RELOAD_DEBOUNCE: Duration = Duration::from_secs(1);

    /// Length bounds on upstream ids and capability names.
    pub const MAX_UPSTREAM_ID_LEN: usize = 100;
    pub const MAX_NAME_LEN: usize = 200;
}

/// When an upstream should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivationPolicy {
    /// Converge to ready on startup; restart on unexpected exit.
    Always,
    /// Start on first triggering use.
    #[default]
    OnDemand,
    /// Do nothing until an explicit activate.
    Manual,
}

/// What to do with an idle `onDemand` upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdleStrategy {
    #[default]
    Shutdown,
    KeepWarm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdlePolicy {
    #[serde(default = "IdlePolicy::default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default)]
    pub strategy: IdleStrategy,
}

impl IdlePolicy {
    fn default_idle_ms() -> u64 {
        u64::try_from(defaults::IDLE_SHUTDOWN.as_millis()).unwrap_or(300_000)
    }

    #[must_use]
    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self { idle_ms: Self::default_idle_ms(), strategy: IdleStrategy::default() }
    }
}

/// Remote transport kind. `Auto` selects by URL path (`/sse`, `/events`
/// mean SSE) and falls back to the alternative on first-attempt failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteKind {
    #[default]
    Auto,
    Http,
    StreamableHttp,
    Sse,
}

/// Per-upstream tool visibility and renaming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolFilter {
    /// When set, only these original names are exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    /// Original names never exposed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Overrides the naming strategy's upstream-id component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// original name -> final public name, applied after the strategy.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aliases: HashMap<String, String>,
}

impl ToolFilter {
    /// Whether a tool with this original name is exposed at all.
    #[must_use]
    pub fn admits(&self, name: &str) -> bool {
        if self.exclude.iter().any(|e| e == name) {
            return false;
        }
        match &self.include {
            Some(include) => include.iter().any(|i| i == name),
            None => true,
        }
    }
}

/// Immutable description of one upstream server.
///
/// Exactly one of `command` (local child process) or `url` (remote) must be
/// set; [`UpstreamSpec::validate`] enforces this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    /// Stable id, unique within the hub. Filled from the map key for
    /// `mcpServers` entries.
    #[serde(default)]
    pub id: String,

    // Local child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    // Remote server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_kind")]
    pub kind: RemoteKind,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub auth: Value,

    #[serde(default)]
    pub activation_policy: ActivationPolicy,
    #[serde(default)]
    pub idle_policy: IdlePolicy,
    #[serde(default, skip_serializing_if = "is_default_filter")]
    pub tools: ToolFilter,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

fn is_default_kind(kind: &RemoteKind) -> bool {
    *kind == RemoteKind::Auto
}

fn is_default_filter(filter: &ToolFilter) -> bool {
    *filter == ToolFilter::default()
}

impl UpstreamSpec {
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.command.is_some()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> HubResult<()> {
        if self.id.is_empty() {
            return Err(HubError::config("upstream id must not be empty"));
        }
        if self.id.len() > defaults::MAX_UPSTREAM_ID_LEN {
            return Err(HubError::config(format!(
                "upstream id '{}' exceeds {} characters",
                self.id,
                defaults::MAX_UPSTREAM_ID_LEN
            )));
        }
        match (&self.command, &self.url) {
            (Some(_), Some(_)) => Err(HubError::config(format!(
                "upstream '{}' sets both command and url",
                self.id
            ))),
            (None, None) => Err(HubError::config(format!(
                "upstream '{}' sets neither command nor url",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    /// Canonical serialization used to detect modification across reloads:
    /// sorted keys, no whitespace.
    #[must_use]
    pub fn canonical(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonical_json(&value)
    }

    /// Whether this spec passes the given tag filter. An empty filter
    /// matches everything; otherwise any overlapping tag matches.
    #[must_use]
    pub fn matches_tags(&self, filter: &[String]) -> bool {
        filter.is_empty() || self.tags.iter().any(|t| filter.contains(t))
    }
}

/// Public-name construction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NamingStrategy {
    /// `{originalName}{sep}{upstreamId}` (suffix).
    #[default]
    Namespace,
    /// `{upstreamId}{sep}{originalName}` (prefix).
    Alias,
    /// No renaming; duplicate public names are a configuration error.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolNaming {
    #[serde(default)]
    pub strategy: NamingStrategy,
    #[serde(default = "ToolNaming::default_separator")]
    pub separator: String,
    /// Optional template with `{server}` / `{tool}` placeholders. When set
    /// it replaces the strategy for name generation; such names resolve by
    /// exact registry match only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Global public-name overrides, applied after the strategy.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aliases: HashMap<String, String>,
}

impl ToolNaming {
    fn default_separator() -> String {
        defaults::SEPARATOR.to_string()
    }
}

impl Default for ToolNaming {
    fn default() -> Self {
        Self {
            strategy: NamingStrategy::default(),
            separator: Self::default_separator(),
            format: None,
            aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_port")]
    pub port: u16,
    #[serde(default = "HttpConfig::default_host")]
    pub host: String,
}

impl HttpConfig {
    fn default_port() -> u16 {
        defaults::HTTP_PORT
    }

    fn default_host() -> String {
        defaults::HTTP_HOST.to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: Self::default_port(), host: Self::default_host() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub persist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

impl SessionConfig {
    fn default_ttl() -> u64 {
        defaults::SESSION_TTL.as_secs()
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_seconds: Self::default_ttl(), persist: false, store: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(default = "Timeouts::default_spawn_ms")]
    pub spawn_ms: u64,
    #[serde(default = "Timeouts::default_healthcheck_ms")]
    pub healthcheck_ms: u64,
    #[serde(default = "Timeouts::default_tool_call_ms")]
    pub tool_call_ms: u64,
}

impl Timeouts {
    fn default_spawn_ms() -> u64 {
        u64::try_from(defaults::SPAWN_TIMEOUT.as_millis()).unwrap_or(8_000)
    }

    fn default_healthcheck_ms() -> u64 {
        u64::try_from(defaults::HEALTHCHECK_TIMEOUT.as_millis()).unwrap_or(2_000)
    }

    fn default_tool_call_ms() -> u64 {
        u64::try_from(defaults::TOOL_CALL_TIMEOUT.as_millis()).unwrap_or(20_000)
    }

    #[must_use]
    pub fn spawn(&self) -> Duration {
        Duration::from_millis(self.spawn_ms)
    }

    #[must_use]
    pub fn healthcheck(&self) -> Duration {
        Duration::from_millis(self.healthcheck_ms)
    }

    #[must_use]
    pub fn tool_call(&self) -> Duration {
        Duration::from_millis(self.tool_call_ms)
    }

    /// How long a caller waits for an on-demand activation.
    #[must_use]
    pub fn activation(&self) -> Duration {
        self.spawn() + self.healthcheck()
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            spawn_ms: Self::default_spawn_ms(),
            healthcheck_ms: Self::default_healthcheck_ms(),
            tool_call_ms: Self::default_tool_call_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concurrency {
    #[serde(default = "Concurrency::default_global")]
    pub global: usize,
    /// Per-upstream overrides; unset ids inherit `global`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_server: HashMap<String, usize>,
}

impl Concurrency {
    fn default_global() -> usize {
        defaults::GLOBAL_CONCURRENCY
    }

    #[must_use]
    pub fn for_server(&self, id: &str) -> usize {
        self.per_server.get(id).copied().unwrap_or(self.global).max(1)
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self { global: Self::default_global(), per_server: HashMap::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    /// Keys whose values are masked in audit records and config dumps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redact_keys: Vec<String>,
    /// Hosts remote upstreams may connect to; empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_net: Vec<String>,
}

/// The whole config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default = "HubConfig::default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
    /// Compact map form; ids come from the keys.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub mcp_servers: HashMap<String, UpstreamSpec>,
    /// Detailed array form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<UpstreamSpec>,
    #[serde(default)]
    pub tool_naming: ToolNaming,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub concurrency: Concurrency,
    #[serde(default, skip_serializing_if = "is_default_security")]
    pub security: Security,
}

fn is_default_security(security: &Security) -> bool {
    *security == Security::default()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            version: Self::default_version(),
            log_level: None,
            http: HttpConfig::default(),
            mcp_servers: HashMap::new(),
            servers: Vec::new(),
            tool_naming: ToolNaming::default(),
            session: SessionConfig::default(),
            timeouts: Timeouts::default(),
            concurrency: Concurrency::default(),
            security: Security::default(),
        }
    }
}

impl HubConfig {
    fn default_version() -> u32 {
        1
    }

    /// All declared upstreams with ids normalized, in deterministic order
    /// (map entries sorted by id, then the `servers` array in file order).
    #[must_use]
    pub fn all_servers(&self) -> Vec<UpstreamSpec> {
        let mut compact: Vec<UpstreamSpec> = self
            .mcp_servers
            .iter()
            .map(|(id, spec)| {
                let mut spec = spec.clone();
                spec.id = id.clone();
                spec
            })
            .collect();
        compact.sort_by(|a, b| a.id.cmp(&b.id));
        compact.extend(self.servers.iter().cloned());
        compact
    }

    /// Upstreams the hub should manage: not disabled, matching the tag
    /// filter.
    #[must_use]
    pub fn effective_servers(&self, tags: &[String]) -> Vec<UpstreamSpec> {
        self.all_servers()
            .into_iter()
            .filter(|s| !s.disabled && s.matches_tags(tags))
            .collect()
    }

    /// Validate the whole document.
    pub fn validate(&self) -> HubResult<()> {
        if self.version != 1 {
            return Err(HubError::config(format!(
                "unsupported config version {} (expected 1)",
                self.version
            )));
        }
        if let Some(level) = &self.log_level {
            const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
            if !LEVELS.contains(&level.as_str()) {
                return Err(HubError::config(format!("unknown logLevel '{level}'")));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for spec in self.all_servers() {
            spec.validate()?;
            if !seen.insert(spec.id.clone()) {
                return Err(HubError::config(format!("duplicate upstream id '{}'", spec.id)));
            }
            self.check_allow_net(&spec)?;
        }
        Ok(())
    }

    /// When `security.allowNet` is set, remote upstreams may only point at
    /// the listed hosts.
    fn check_allow_net(&self, spec: &UpstreamSpec) -> HubResult<()> {
        if self.security.allow_net.is_empty() {
            return Ok(());
        }
        let Some(raw) = &spec.url else { return Ok(()) };
        let host = url::Url::parse(raw)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .ok_or_else(|| {
                HubError::config(format!("upstream '{}' has an unparseable url", spec.id))
            })?;
        if self.security.allow_net.iter().any(|allowed| allowed == &host) {
            return Ok(());
        }
        Err(HubError::config(format!(
            "upstream '{}' host '{host}' is not in security.allowNet",
            spec.id
        )))
    }
}

/// Per-upstream change set between two configs, keyed by id.
#[derive(Debug, Default, Clone)]
pub struct ConfigDiff {
    pub added: Vec<UpstreamSpec>,
    pub removed: Vec<String>,
    pub modified: Vec<UpstreamSpec>,
}

impl ConfigDiff {
    /// Compare effective server sets. Modification is detected via the
    /// canonical serialization, so key order and formatting don't count.
    #[must_use]
    pub fn between(old: &[UpstreamSpec], new: &[UpstreamSpec]) -> Self {
        let old_by_id: HashMap<&str, &UpstreamSpec> =
            old.iter().map(|s| (s.id.as_str(), s)).collect();
        let new_ids: std::collections::HashSet<&str> =
            new.iter().map(|s| s.id.as_str()).collect();

        let mut diff = Self::default();
        for spec in new {
            match old_by_id.get(spec.id.as_str()) {
                None => diff.added.push(spec.clone()),
                Some(prev) if prev.canonical() != spec.canonical() => {
                    diff.modified.push(spec.clone());
                }
                Some(_) => {}
            }
        }
        for spec in old {
            if !new_ids.contains(spec.id.as_str()) {
                diff.removed.push(spec.id.clone());
            }
        }
        diff
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Load and validate a config file from disk.
///
/// # Errors
///
/// Returns `CONFIG_ERROR` on unreadable files, malformed JSON, missing
/// environment variables, or failed validation.
pub fn load_config(path: &Path) -> HubResult<HubConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        HubError::config(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_config(&raw)
}

/// Parse a config document from its raw text.
pub fn parse_config(raw: &str) -> HubResult<HubConfig> {
    let stripped = strip_jsonc_comments(raw);
    let mut value: Value = serde_json::from_str(&stripped)
        .map_err(|e| HubError::config(format!("malformed config JSON: {e}")))?;
    expand_env_refs(&mut value)?;
    let config: HubConfig = serde_json::from_value(value)
        .map_err(|e| HubError::config(format!("invalid config: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Remove `//` and `/* */` comments, preserving string contents.
#[must_use]
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Expand `${env:VAR}` references inside every string value.
fn expand_env_refs(value: &mut Value) -> HubResult<()> {
    match value {
        Value::String(s) => {
            if s.contains("${env:") {
                *s = expand_env_str(s)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(expand_env_refs),
        Value::Object(map) => map.values_mut().try_for_each(expand_env_refs),
        _ => Ok(()),
    }
}

fn expand_env_str(input: &str) -> HubResult<String> {
    // Compiled per call; config loading is far off the hot path.
    let pattern = regex::Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| HubError::internal(format!("env pattern: {e}")))?;

    let mut missing = None;
    let expanded = pattern.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(HubError::config(format!("environment variable '{name}' is not set")));
    }
    Ok(expanded.into_owned())
}

/// Serialize a JSON value with sorted keys and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: &str, command: &str) -> UpstreamSpec {
        UpstreamSpec {
            id: id.to_string(),
            command: Some(command.to_string()),
            ..UpstreamSpec::default()
        }
    }

    #[test]
    fn strips_comments_outside_strings() {
        let raw = r#"{
            // line comment
            "a": "http://x/y", /* block */ "b": "with // inside"
        }"#;
        let value: Value = serde_json::from_str(&strip_jsonc_comments(raw)).unwrap();
        assert_eq!(value["a"], "http://x/y");
        assert_eq!(value["b"], "with // inside");
    }

    #[test]
    fn parses_compact_and_detailed_forms() {
        let config = parse_config(
            r#"{
                "version": 1,
                "mcpServers": {
                    "echo": { "command": "node", "args": ["echo.js"] }
                },
                "servers": [
                    { "id": "remote", "url": "https://example.com/mcp", "activationPolicy": "always" }
                ]
            }"#,
        )
        .unwrap();

        let servers = config.all_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].id, "echo");
        assert!(servers[0].is_local());
        assert_eq!(servers[1].id, "remote");
        assert_eq!(servers[1].activation_policy, ActivationPolicy::Always);
    }

    #[test]
    fn rejects_bad_documents() {
        assert!(parse_config(r#"{"version": 2}"#).is_err());
        assert!(parse_config(r#"{"version": 1, "logLevel": "loud"}"#).is_err());
        // Both transports set.
        assert!(
            parse_config(
                r#"{"version":1,"servers":[{"id":"x","command":"a","url":"http://b"}]}"#
            )
            .is_err()
        );
        // Neither transport set.
        assert!(parse_config(r#"{"version":1,"servers":[{"id":"x"}]}"#).is_err());
        // Duplicate id across forms.
        assert!(
            parse_config(
                r#"{"version":1,"mcpServers":{"x":{"command":"a"}},"servers":[{"id":"x","command":"b"}]}"#
            )
            .is_err()
        );
    }

    #[test]
    fn expands_env_references() {
        // PATH is present in every test environment.
        let path = std::env::var("PATH").unwrap();
        let config = parse_config(
            r#"{"version":1,"servers":[{"id":"r","url":"https://x/mcp","headers":{"x-path":"v:${env:PATH}"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            config.servers[0].headers.get("x-path").unwrap(),
            &format!("v:{path}")
        );

        let missing = parse_config(
            r#"{"version":1,"servers":[{"id":"r","url":"${env:HATAGO_TEST_NOT_SET_X1}"}]}"#,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn diff_detects_add_remove_modify() {
        let old = vec![local("a", "cmd-a"), local("b", "cmd-b")];
        let mut b2 = local("b", "cmd-b");
        b2.args = vec!["--fast".into()];
        let new = vec![b2, local("c", "cmd-c")];

        let diff = ConfigDiff::between(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "c");
        assert_eq!(diff.removed, vec!["a".to_string()]);
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].id, "b");
    }

    #[test]
    fn diff_ignores_untouched_specs() {
        let old = vec![local("a", "cmd-a")];
        let new = vec![local("a", "cmd-a")];
        assert!(ConfigDiff::between(&old, &new).is_empty());
    }

    #[test]
    fn tag_and_disabled_filtering() {
        let mut tagged = local("a", "cmd");
        tagged.tags = vec!["dev".into()];
        let mut disabled = local("b", "cmd");
        disabled.disabled = true;
        let config = HubConfig {
            servers: vec![tagged, disabled, local("c", "cmd")],
            ..HubConfig::default()
        };

        let all = config.effective_servers(&[]);
        assert_eq!(all.len(), 2); // disabled dropped

        let dev_only = config.effective_servers(&["dev".to_string()]);
        assert_eq!(dev_only.len(), 1);
        assert_eq!(dev_only[0].id, "a");
    }

    #[test]
    fn tool_filter_include_exclude() {
        let filter = ToolFilter {
            include: Some(vec!["a".into(), "b".into()]),
            exclude: vec!["b".into()],
            ..ToolFilter::default()
        };
        assert!(filter.admits("a"));
        assert!(!filter.admits("b")); // exclude wins
        assert!(!filter.admits("c"));
    }

    #[test]
    fn allow_net_restricts_remote_hosts() {
        let allowed = parse_config(
            r#"{"version":1,
                "security":{"allowNet":["internal.example.com"]},
                "servers":[{"id":"r","url":"https://internal.example.com/mcp"}]}"#,
        );
        assert!(allowed.is_ok());

        let denied = parse_config(
            r#"{"version":1,
                "security":{"allowNet":["internal.example.com"]},
                "servers":[{"id":"r","url":"https://evil.example.net/mcp"}]}"#,
        );
        assert!(denied.is_err());

        // Local processes are not subject to the network allowlist.
        let local = parse_config(
            r#"{"version":1,
                "security":{"allowNet":["internal.example.com"]},
                "servers":[{"id":"l","command":"true"}]}"#,
        );
        assert!(local.is_ok());
    }

    #[test]
    fn concurrency_inherits_global() {
        let concurrency = Concurrency {
            global: 8,
            per_server: HashMap::from([("echo".to_string(), 2)]),
        };
        assert_eq!(concurrency.for_server("echo"), 2);
        assert_eq!(concurrency.for_server("other"), 8);
    }
}
