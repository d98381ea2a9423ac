//! Config file watcher: debounced reload driving the hub.
//!
//! File events are bridged from the notify thread into tokio, debounced for
//! one second of quiescence, then reparsed. A file that fails to parse or
//! validate is logged and the running config stays live.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::load_config;
use crate::config::defaults;
use crate::error::{HubError, HubResult};
use crate::hub::Hub;

/// Keeps the underlying filesystem watcher alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch `config_path` and apply changes to `hub` until `shutdown` fires.
///
/// # Errors
///
/// Returns `CONFIG_ERROR` when the watch cannot be installed.
pub fn watch(
    hub: Arc<Hub>,
    config_path: PathBuf,
    shutdown: CancellationToken,
) -> HubResult<ConfigWatcher> {
    let (tx, rx) = mpsc::unbounded_channel();
    let file_name = config_path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else { return };
        if !matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
        ) {
            return;
        }
        // Editors often replace the file, so we watch the directory and
        // filter on the name.
        let relevant = event.paths.iter().any(|p| {
            p.file_name().map(|n| n.to_os_string()) == file_name
        });
        if relevant {
            let _ = tx.send(());
        }
    })
    .map_err(|e| HubError::config(format!("cannot create watcher: {e}")))?;

    let watch_root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher
        .watch(watch_root, RecursiveMode::NonRecursive)
        .map_err(|e| HubError::config(format!("cannot watch {}: {e}", watch_root.display())))?;

    tracing::info!(path = %config_path.display(), "watching config for changes");
    tokio::spawn(run_loop(hub, config_path, rx, shutdown));

    Ok(ConfigWatcher { _watcher: watcher })
}

async fn run_loop(
    hub: Arc<Hub>,
    config_path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
                debounce(&mut rx).await;
                reload_once(&hub, &config_path).await;
            }
        }
    }
}

/// Swallow further events until the file has been quiet for the debounce
/// window.
async fn debounce(rx: &mut mpsc::UnboundedReceiver<()>) {
    loop {
        match tokio::time::timeout(defaults::RELOAD_DEBOUNCE, rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) | Err(_) => break,
        }
    }
}

/// One reload attempt: parse, validate, apply. Failures keep the old
/// config.
pub async fn reload_once(hub: &Arc<Hub>, config_path: &Path) {
    match load_config(config_path) {
        Ok(config) => {
            tracing::info!(path = %config_path.display(), "config changed, applying");
            if let Err(e) = hub.apply_config(config).await {
                tracing::error!(error = %e, "config apply failed");
            }
        }
        Err(e) => {
            tracing::error!(
                path = %config_path.display(),
                error = %e,
                "config reload failed; keeping previous configuration"
            );
        }
    }
}

/// The debounce window, exposed so tests can wait it out.
#[must_use]
pub fn debounce_window() -> Duration {
    defaults::RELOAD_DEBOUNCE
}
