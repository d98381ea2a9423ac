//! Persisted state beside the config file.
//!
//! `<configFile>.metadata.json` caches per-upstream listings so lazy
//! upstreams have registry content before their first activation; it is
//! advisory and refreshed whenever live capabilities differ.
//! `<configFile>.backup` keeps the last config that loaded successfully.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::canonical_json;
use crate::protocol::UpstreamCapabilities;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    upstreams: HashMap<String, UpstreamCapabilities>,
}

/// Capability snapshot store, one per config file.
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<MetadataFile>,
}

impl MetadataStore {
    /// Derived sidecar path for a config file.
    #[must_use]
    pub fn path_for(config_path: &Path) -> PathBuf {
        sibling(config_path, "metadata.json")
    }

    /// Load the sidecar if present; a missing or unreadable file starts
    /// empty (the cache is advisory).
    pub async fn load(config_path: &Path) -> Self {
        let path = Self::path_for(config_path);
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<MetadataFile>(&raw) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding unreadable metadata");
                    MetadataFile::default()
                }
            },
            Err(_) => MetadataFile::default(),
        };
        Self { path, state: Mutex::new(state) }
    }

    /// Cached capabilities for one upstream.
    pub async fn cached(&self, id: &str) -> Option<UpstreamCapabilities> {
        self.state.lock().await.upstreams.get(id).cloned()
    }

    /// Record live capabilities, rewriting the file only when they differ
    /// from the cached snapshot. Write failures are logged, never surfaced.
    pub async fn record(&self, id: &str, caps: &UpstreamCapabilities) {
        let mut state = self.state.lock().await;
        let unchanged = state.upstreams.get(id).is_some_and(|cached| {
            let cached = serde_json::to_value(cached).unwrap_or_default();
            let live = serde_json::to_value(caps).unwrap_or_default();
            canonical_json(&cached) == canonical_json(&live)
        });
        if unchanged {
            return;
        }
        state.upstreams.insert(id.to_string(), caps.clone());
        state.version = 1;
        self.save(&state).await;
    }

    /// Drop an upstream that left the configuration.
    pub async fn remove(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.upstreams.remove(id).is_some() {
            self.save(&state).await;
        }
    }

    async fn save(&self, state: &MetadataFile) {
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                    tracing::warn!(path = %self.path.display(), error = %e, "metadata write failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "metadata serialization failed");
            }
        }
    }
}

/// Derived backup path for a config file.
#[must_use]
pub fn backup_path(config_path: &Path) -> PathBuf {
    sibling(config_path, "backup")
}

/// Keep a copy of the last config that parsed and applied cleanly.
pub async fn write_backup(config_path: &Path) {
    let backup = backup_path(config_path);
    if let Err(e) = tokio::fs::copy(config_path, &backup).await {
        tracing::warn!(path = %backup.display(), error = %e, "config backup failed");
    }
}

fn sibling(config_path: &Path, suffix: &str) -> PathBuf {
    let mut name = config_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    name.push('.');
    name.push_str(suffix);
    config_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolDescriptor;

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
    fn sidecar_paths_derive_from_config() {
        let config = Path::new("/tmp/hatago.config.json");
        assert_eq!(
            MetadataStore::path_for(config),
            Path::new("/tmp/hatago.config.json.metadata.json")
        );
        assert_eq!(backup_path(config), Path::new("/tmp/hatago.config.json.backup"));
    }

    #[tokio::test]
    async fn records_and_reloads_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("hatago.json");

        let store = MetadataStore::load(&config).await;
        assert!(store.cached("echo").await.is_none());
        store.record("echo", &caps(&["say"])).await;

        // A fresh store sees the persisted snapshot.
        let reloaded = MetadataStore::load(&config).await;
        let cached = reloaded.cached("echo").await.unwrap();
        assert_eq!(cached.tools.len(), 1);
        assert_eq!(cached.tools[0].name, "say");
    }

    #[tokio::test]
    async fn remove_forgets_upstreams() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("hatago.json");

        let store = MetadataStore::load(&config).await;
        store.record("echo", &caps(&["say"])).await;
        store.remove("echo").await;

        let reloaded = MetadataStore::load(&config).await;
        assert!(reloaded.cached("echo").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_metadata_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("hatago.json");
        tokio::fs::write(MetadataStore::path_for(&config), b"{not json")
            .await
            .unwrap();

        let store = MetadataStore::load(&config).await;
        assert!(store.cached("echo").await.is_none());
    }

    #[tokio::test]
    async fn backup_copies_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("hatago.json");
        tokio::fs::write(&config, b"{\"version\":1}").await.unwrap();

        write_backup(&config).await;
        let copied = tokio::fs::read_to_string(backup_path(&config)).await.unwrap();
        assert_eq!(copied, "{\"version\":1}");
    }
}
