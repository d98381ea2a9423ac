//! Capability registry: the per-hub map from public names to owning
//! upstreams.
//!
//! Entries are created when an upstream reaches ready (or is primed from
//! cached metadata for lazy upstreams) and destroyed when it stops. All
//! operations are synchronous under one lock; resolution is memoized with a
//! bounded cache so hot-path routing stays cheap.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::config::{NamingStrategy, ToolFilter, ToolNaming, UpstreamSpec, defaults};
use crate::error::{HubError, HubResult};
use crate::protocol::UpstreamCapabilities;

/// A resolved public name: which upstream owns it and what it is called
/// there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub upstream_id: String,
    pub original_name: String,
}

/// One registered capability.
#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub public_name: String,
    pub upstream_id: String,
    pub original_name: String,
    /// Full descriptor with the public name already substituted.
    pub descriptor: Value,
}

/// Which capability lists a mutation touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryChanges {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl RegistryChanges {
    #[must_use]
    pub fn any(&self) -> bool {
        self.tools || self.resources || self.prompts
    }

    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            tools: self.tools || other.tools,
            resources: self.resources || other.resources,
            prompts: self.prompts || other.prompts,
        }
    }
}

/// Generate the public name for a capability.
///
/// `label` is the upstream-id component: the upstream id itself, or the
/// configured per-upstream prefix override.
#[must_use]
pub fn generate_public_name(
    strategy: NamingStrategy,
    separator: &str,
    label: &str,
    original: &str,
) -> String {
    match strategy {
        NamingStrategy::Namespace => format!("{original}{separator}{label}"),
        NamingStrategy::Alias => format!("{label}{separator}{original}"),
        NamingStrategy::Error => original.to_string(),
    }
}

/// Invert [`generate_public_name`] against a set of known labels.
///
/// Labels are tried longest-first so overlapping labels parse
/// deterministically. Returns `(label, original)`.
#[must_use]
pub fn parse_public_name<'a>(
    strategy: NamingStrategy,
    separator: &str,
    labels: impl IntoIterator<Item = &'a str>,
    public: &str,
) -> Option<(String, String)> {
    let mut labels: Vec<&str> = labels.into_iter().collect();
    labels.sort_by_key(|l| std::cmp::Reverse(l.len()));

    for label in labels {
        let candidate = match strategy {
            NamingStrategy::Namespace => public
                .strip_suffix(label)
                .and_then(|rest| rest.strip_suffix(separator)),
            NamingStrategy::Alias => public
                .strip_prefix(label)
                .and_then(|rest| rest.strip_prefix(separator)),
            NamingStrategy::Error => (public == label).then_some(public),
        };
        if let Some(original) = candidate {
            if !original.is_empty() {
                return Some((label.to_string(), original.to_string()));
            }
        }
    }
    None
}

#[derive(Debug, Default)]
struct UpstreamEntries {
    /// Label used as this upstream's name component.
    label: String,
    /// original name -> public name, per capability class.
    tools: HashMap<String, String>,
    resources: HashMap<String, String>,
    prompts: HashMap<String, String>,
}

#[derive(Debug)]
struct Inner {
    naming: ToolNaming,
    tools: HashMap<String, CapabilityEntry>,
    resources: HashMap<String, CapabilityEntry>,
    prompts: HashMap<String, CapabilityEntry>,
    by_upstream: HashMap<String, UpstreamEntries>,
}

/// The registry proper.
pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
    /// Memoizes the strategy-inverse parse on resolution misses.
    parse_memo: moka::sync::Cache<String, Option<Resolved>>,
    revision: AtomicU64,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new(naming: ToolNaming) -> Self {
        Self {
            inner: RwLock::new(Inner {
                naming,
                tools: HashMap::new(),
                resources: HashMap::new(),
                prompts: HashMap::new(),
                by_upstream: HashMap::new(),
            }),
            parse_memo: moka::sync::Cache::new(defaults::PARSE_MEMO_CAPACITY),
            revision: AtomicU64::new(0),
        }
    }

    /// Monotonic counter bumped by every mutation.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Replace the naming configuration. Only valid while no upstream is
    /// registered; the hub re-registers everything after calling this.
    pub fn set_naming(&self, naming: ToolNaming) -> HubResult<()> {
        let mut inner = self.inner.write().expect("registry lock");
        if !inner.by_upstream.is_empty() {
            return Err(HubError::internal(
                "naming cannot change while upstreams are registered",
            ));
        }
        inner.naming = naming;
        self.parse_memo.invalidate_all();
        Ok(())
    }

    /// Register every capability of one upstream.
    ///
    /// Under the `error` strategy a public-name collision fails the whole
    /// registration (nothing is inserted) with `CONFIG_ERROR`. Under the
    /// renaming strategies collisions are logged and the latest definition
    /// wins.
    pub fn register_upstream(
        &self,
        spec: &UpstreamSpec,
        caps: &UpstreamCapabilities,
    ) -> HubResult<RegistryChanges> {
        let mut inner = self.inner.write().expect("registry lock");

        if inner.by_upstream.contains_key(&spec.id) {
            return Err(HubError::internal(format!(
                "upstream '{}' is already registered",
                spec.id
            )));
        }

        let label = spec.tools.prefix.clone().unwrap_or_else(|| spec.id.clone());
        let mut staged = UpstreamEntries { label: label.clone(), ..UpstreamEntries::default() };
        let mut tool_entries = Vec::new();
        let mut prompt_entries = Vec::new();
        let mut resource_entries = Vec::new();

        for tool in &caps.tools {
            if !spec.tools.admits(&tool.name) {
                continue;
            }
            let Some(public) =
                inner.public_name_for(&spec.tools, &label, &tool.name)
            else {
                continue;
            };
            if inner.tools.contains_key(&public) {
                inner.reject_or_warn(&spec.id, "tool", &public)?;
            }
            let mut descriptor = serde_json::to_value(tool)
                .map_err(|e| HubError::internal(format!("tool descriptor: {e}")))?;
            descriptor["name"] = Value::String(public.clone());
            staged.tools.insert(tool.name.clone(), public.clone());
            tool_entries.push(CapabilityEntry {
                public_name: public,
                upstream_id: spec.id.clone(),
                original_name: tool.name.clone(),
                descriptor,
            });
        }

        for prompt in &caps.prompts {
            let Some(public) =
                inner.public_name_for(&spec.tools, &label, &prompt.name)
            else {
                continue;
            };
            if inner.prompts.contains_key(&public) {
                inner.reject_or_warn(&spec.id, "prompt", &public)?;
            }
            let mut descriptor = serde_json::to_value(prompt)
                .map_err(|e| HubError::internal(format!("prompt descriptor: {e}")))?;
            descriptor["name"] = Value::String(public.clone());
            staged.prompts.insert(prompt.name.clone(), public.clone());
            prompt_entries.push(CapabilityEntry {
                public_name: public,
                upstream_id: spec.id.clone(),
                original_name: prompt.name.clone(),
                descriptor,
            });
        }

        for resource in &caps.resources {
            if resource.uri.len() > defaults::MAX_NAME_LEN {
                tracing::warn!(upstream = %spec.id, uri = %resource.uri, "resource URI over length bound, skipping");
                continue;
            }
            // Resource URIs are always prefixed, independent of strategy.
            let public = format!("{label}{}{}", inner.naming.separator, resource.uri);
            if inner.resources.contains_key(&public) {
                inner.reject_or_warn(&spec.id, "resource", &public)?;
            }
            let mut descriptor = serde_json::to_value(resource)
                .map_err(|e| HubError::internal(format!("resource descriptor: {e}")))?;
            descriptor["uri"] = Value::String(public.clone());
            staged.resources.insert(resource.uri.clone(), public.clone());
            resource_entries.push(CapabilityEntry {
                public_name: public,
                upstream_id: spec.id.clone(),
                original_name: resource.uri.clone(),
                descriptor,
            });
        }

        let changes = RegistryChanges {
            tools: !tool_entries.is_empty(),
            resources: !resource_entries.is_empty(),
            prompts: !prompt_entries.is_empty(),
        };

        for entry in tool_entries {
            inner.tools.insert(entry.public_name.clone(), entry);
        }
        for entry in prompt_entries {
            inner.prompts.insert(entry.public_name.clone(), entry);
        }
        for entry in resource_entries {
            inner.resources.insert(entry.public_name.clone(), entry);
        }
        inner.by_upstream.insert(spec.id.clone(), staged);
        drop(inner);

        self.bump();
        Ok(changes)
    }

    /// Remove every capability of one upstream.
    pub fn unregister_upstream(&self, id: &str) -> RegistryChanges {
        let mut inner = self.inner.write().expect("registry lock");
        let Some(entries) = inner.by_upstream.remove(id) else {
            return RegistryChanges::default();
        };

        let changes = RegistryChanges {
            tools: !entries.tools.is_empty(),
            resources: !entries.resources.is_empty(),
            prompts: !entries.prompts.is_empty(),
        };
        for public in entries.tools.values() {
            inner.tools.remove(public);
        }
        for public in entries.resources.values() {
            inner.resources.remove(public);
        }
        for public in entries.prompts.values() {
            inner.prompts.remove(public);
        }
        drop(inner);

        if changes.any() {
            self.bump();
        }
        changes
    }

    /// Whether an upstream currently has entries (registered or primed).
    #[must_use]
    pub fn has_upstream(&self, id: &str) -> bool {
        self.inner.read().expect("registry lock").by_upstream.contains_key(id)
    }

    #[must_use]
    pub fn resolve_tool(&self, public: &str) -> Option<Resolved> {
        self.resolve(public, Class::Tool)
    }

    #[must_use]
    pub fn resolve_resource(&self, public_uri: &str) -> Option<Resolved> {
        self.resolve(public_uri, Class::Resource)
    }

    #[must_use]
    pub fn resolve_prompt(&self, public: &str) -> Option<Resolved> {
        self.resolve(public, Class::Prompt)
    }

    fn resolve(&self, public: &str, class: Class) -> Option<Resolved> {
        let inner = self.inner.read().expect("registry lock");

        // Exact match wins.
        if let Some(entry) = inner.map(class).get(public) {
            return Some(Resolved {
                upstream_id: entry.upstream_id.clone(),
                original_name: entry.original_name.clone(),
            });
        }

        // Fall back to the strategy inverse, verified against registered
        // entries so we never route to a non-existent upstream.
        let memo_key = format!("{}\u{1f}{public}", class.tag());
        if let Some(hit) = self.parse_memo.get(&memo_key) {
            return hit;
        }

        let parsed = inner.parse_and_verify(public, class);
        self.parse_memo.insert(memo_key, parsed.clone());
        parsed
    }

    /// All tools, deterministically ordered by (upstream id, original name).
    #[must_use]
    pub fn list_tools(&self) -> Vec<Value> {
        self.list(Class::Tool)
    }

    #[must_use]
    pub fn list_resources(&self) -> Vec<Value> {
        self.list(Class::Resource)
    }

    #[must_use]
    pub fn list_prompts(&self) -> Vec<Value> {
        self.list(Class::Prompt)
    }

    fn list(&self, class: Class) -> Vec<Value> {
        let inner = self.inner.read().expect("registry lock");
        let mut entries: Vec<&CapabilityEntry> = inner.map(class).values().collect();
        entries.sort_by(|a, b| {
            (a.upstream_id.as_str(), a.original_name.as_str())
                .cmp(&(b.upstream_id.as_str(), b.original_name.as_str()))
        });
        entries.into_iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Tool count per upstream, for diagnostics.
    #[must_use]
    pub fn tool_count(&self, id: &str) -> usize {
        self.inner
            .read()
            .expect("registry lock")
            .by_upstream
            .get(id)
            .map_or(0, |e| e.tools.len())
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.parse_memo.invalidate_all();
    }
}

#[derive(Clone, Copy)]
enum Class {
    Tool,
    Resource,
    Prompt,
}

impl Class {
    fn tag(self) -> &'static str {
        match self {
            Self::Tool => "t",
            Self::Resource => "r",
            Self::Prompt => "p",
        }
    }
}

impl Inner {
    fn map(&self, class: Class) -> &HashMap<String, CapabilityEntry> {
        match class {
            Class::Tool => &self.tools,
            Class::Resource => &self.resources,
            Class::Prompt => &self.prompts,
        }
    }

    /// Public name for a tool or prompt, after filter aliases, the format
    /// template, and global aliases. `None` skips the entry.
    fn public_name_for(
        &self,
        filter: &ToolFilter,
        label: &str,
        original: &str,
    ) -> Option<String> {
        if original.len() > defaults::MAX_NAME_LEN {
            tracing::warn!(name = %original, "capability name over length bound, skipping");
            return None;
        }

        // Per-upstream aliases are keyed by original name and final.
        if let Some(alias) = filter.aliases.get(original) {
            return Some(alias.clone());
        }

        let generated = match &self.naming.format {
            Some(template) => template
                .replace("{server}", label)
                .replace("{tool}", original),
            None => generate_public_name(
                self.naming.strategy,
                &self.naming.separator,
                label,
                original,
            ),
        };

        // Global aliases are keyed by the generated public name.
        Some(
            self.naming
                .aliases
                .get(&generated)
                .cloned()
                .unwrap_or(generated),
        )
    }

    /// Collision handling: hard error under the `error` strategy, warn and
    /// overwrite otherwise.
    fn reject_or_warn(&self, upstream_id: &str, what: &str, public: &str) -> HubResult<()> {
        if self.naming.strategy == NamingStrategy::Error {
            return Err(HubError::config(format!(
                "{what} name '{public}' from upstream '{upstream_id}' collides with an existing registration"
            )));
        }
        tracing::warn!(
            upstream = %upstream_id,
            name = %public,
            "duplicate {what} name; latest definition wins"
        );
        Ok(())
    }

    fn parse_and_verify(&self, public: &str, class: Class) -> Option<Resolved> {
        // Resource URIs always use the prefix form regardless of strategy.
        let strategy = match class {
            Class::Resource => NamingStrategy::Alias,
            Class::Tool | Class::Prompt => self.naming.strategy,
        };

        let labels = self.by_upstream.values().map(|e| e.label.as_str());
        let (label, original) =
            parse_public_name(strategy, &self.naming.separator, labels, public)?;

        // Verify the parsed pair maps to a registered capability.
        let (id, entries) = self
            .by_upstream
            .iter()
            .find(|(_, e)| e.label == label)?;
        let known = match class {
            Class::Tool => &entries.tools,
            Class::Resource => &entries.resources,
            Class::Prompt => &entries.prompts,
        };
        known.contains_key(&original).then(|| Resolved {
            upstream_id: id.clone(),
            original_name: original,
        })
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("revision", &self.revision())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolDescriptor;

    fn naming(strategy: NamingStrategy) -> ToolNaming {
        ToolNaming { strategy, ..ToolNaming::default() }
    }

    fn spec(id: &str) -> UpstreamSpec {
        UpstreamSpec {
            id: id.to_string(),
            command: Some("true".to_string()),
            ..UpstreamSpec::default()
        }
    }

    fn caps(tools: &[&str]) -> UpstreamCapabilities {
        UpstreamCapabilities {
            tools: tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: (*name).to_string(),
                    rest: serde_json::Map::new(),
                })
                .collect(),
            ..UpstreamCapabilities::default()
        }
    }

    #[test]
    fn namespace_strategy_suffixes() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Namespace));
        registry.register_upstream(&spec("echo"), &caps(&["say"])).unwrap();

        let resolved = registry.resolve_tool("say_echo").unwrap();
        assert_eq!(resolved.upstream_id, "echo");
        assert_eq!(resolved.original_name, "say");
    }

    #[test]
    fn alias_strategy_prefixes() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry.register_upstream(&spec("echo"), &caps(&["say"])).unwrap();

        let resolved = registry.resolve_tool("echo_say").unwrap();
        assert_eq!(resolved.upstream_id, "echo");
        assert_eq!(resolved.original_name, "say");
        assert!(registry.resolve_tool("say_echo").is_none());
    }

    #[test]
    fn error_strategy_rejects_collisions() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Error));
        registry.register_upstream(&spec("a"), &caps(&["search"])).unwrap();

        let err = registry
            .register_upstream(&spec("b"), &caps(&["search"]))
            .unwrap_err();
        assert_eq!(err.kind(), "CONFIG_ERROR");

        // Nothing from the failed registration is visible.
        assert!(!registry.has_upstream("b"));
        let resolved = registry.resolve_tool("search").unwrap();
        assert_eq!(resolved.upstream_id, "a");
        assert_eq!(registry.list_tools().len(), 1);
    }

    #[test]
    fn unregister_removes_all_entries() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry.register_upstream(&spec("echo"), &caps(&["say", "shout"])).unwrap();
        assert_eq!(registry.list_tools().len(), 2);

        let changes = registry.unregister_upstream("echo");
        assert!(changes.tools);
        assert!(registry.list_tools().is_empty());
        assert!(registry.resolve_tool("echo_say").is_none());
    }

    #[test]
    fn listing_order_is_deterministic() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry.register_upstream(&spec("zeta"), &caps(&["b", "a"])).unwrap();
        registry.register_upstream(&spec("alpha"), &caps(&["z"])).unwrap();

        let names: Vec<String> = registry
            .list_tools()
            .into_iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["alpha_z", "zeta_a", "zeta_b"]);
    }

    #[test]
    fn include_exclude_and_aliases_apply() {
        let mut spec = spec("echo");
        spec.tools = ToolFilter {
            include: Some(vec!["say".into(), "shout".into()]),
            exclude: vec!["shout".into()],
            prefix: None,
            aliases: HashMap::from([("say".to_string(), "speak".to_string())]),
        };
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry
            .register_upstream(&spec, &caps(&["say", "shout", "hidden"]))
            .unwrap();

        assert_eq!(registry.list_tools().len(), 1);
        let resolved = registry.resolve_tool("speak").unwrap();
        assert_eq!(resolved.original_name, "say");
        assert!(registry.resolve_tool("echo_shout").is_none());
    }

    #[test]
    fn prefix_overrides_label() {
        let mut spec = spec("very-long-upstream-id");
        spec.tools.prefix = Some("s".to_string());
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry.register_upstream(&spec, &caps(&["say"])).unwrap();

        let resolved = registry.resolve_tool("s_say").unwrap();
        assert_eq!(resolved.upstream_id, "very-long-upstream-id");
    }

    #[test]
    fn resources_are_prefixed() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Namespace));
        let caps = UpstreamCapabilities {
            resources: vec![crate::protocol::ResourceDescriptor {
                uri: "file:///readme".to_string(),
                rest: serde_json::Map::new(),
            }],
            ..UpstreamCapabilities::default()
        };
        registry.register_upstream(&spec("docs"), &caps).unwrap();

        let resolved = registry.resolve_resource("docs_file:///readme").unwrap();
        assert_eq!(resolved.upstream_id, "docs");
        assert_eq!(resolved.original_name, "file:///readme");
    }

    #[test]
    fn revision_bumps_on_mutation() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        let before = registry.revision();
        registry.register_upstream(&spec("echo"), &caps(&["say"])).unwrap();
        let mid = registry.revision();
        assert!(mid > before);
        registry.unregister_upstream("echo");
        assert!(registry.revision() > mid);
    }

    #[test]
    fn parse_fallback_requires_registered_capability() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry.register_upstream(&spec("echo"), &caps(&["say"])).unwrap();

        // Parses as (echo, missing) but no such tool is registered.
        assert!(registry.resolve_tool("echo_missing").is_none());
        // Unknown label.
        assert!(registry.resolve_tool("ghost_say").is_none());
    }

    #[test]
    fn memo_is_invalidated_by_mutations() {
        let registry = CapabilityRegistry::new(naming(NamingStrategy::Alias));
        registry.register_upstream(&spec("echo"), &caps(&["say"])).unwrap();

        // Seed the memo with a miss, then register the capability for it.
        assert!(registry.resolve_tool("late_say").is_none());
        registry.register_upstream(&spec("late"), &caps(&["say"])).unwrap();
        let resolved = registry.resolve_tool("late_say").unwrap();
        assert_eq!(resolved.upstream_id, "late");
    }

    #[test]
    fn round_trip_generate_parse() {
        for strategy in [NamingStrategy::Namespace, NamingStrategy::Alias] {
            let public = generate_public_name(strategy, "_", "echo", "say_hello");
            let (label, original) =
                parse_public_name(strategy, "_", ["echo"], &public).unwrap();
            assert_eq!(label, "echo");
            assert_eq!(original, "say_hello");
        }
    }

    #[test]
    fn parse_prefers_longest_label() {
        let public = generate_public_name(NamingStrategy::Alias, "_", "x_echo", "say");
        let (label, original) =
            parse_public_name(NamingStrategy::Alias, "_", ["echo", "x_echo", "x"], &public)
                .unwrap();
        assert_eq!(label, "x_echo");
        assert_eq!(original, "say");
    }
}
