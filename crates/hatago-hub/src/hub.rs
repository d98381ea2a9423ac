//! Hub core: wires the registry, activation manager, downstream sessions,
//! and router behind one `handle` entry point, and applies config reloads.
//!
//! Multiple hubs can coexist in one process; nothing here is global.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEventKind, AuditLog};
use crate::config::{ActivationPolicy, ConfigDiff, HubConfig, UpstreamSpec};
use crate::error::HubResult;
use crate::persist::{self, MetadataStore};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RpcBody, methods};
use crate::registry::{CapabilityRegistry, RegistryChanges};
use crate::router::{RequestContext, Router};
use crate::server::session::SessionManager;
use crate::upstream::manager::{HubEvent, UpstreamManager};

pub struct Hub {
    config: RwLock<Arc<HubConfig>>,
    config_path: Option<PathBuf>,
    tags: Vec<String>,
    registry: Arc<CapabilityRegistry>,
    manager: Arc<UpstreamManager>,
    sessions: Arc<SessionManager>,
    router: Router,
    audit: Option<AuditLog>,
    metadata: Option<Arc<MetadataStore>>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build a hub from a validated config. Installs upstream state but
    /// does not connect anywhere; call [`Hub::start`] for that.
    pub async fn new(
        config: HubConfig,
        config_path: Option<PathBuf>,
        tags: Vec<String>,
    ) -> Arc<Self> {
        let registry = Arc::new(CapabilityRegistry::new(config.tool_naming.clone()));
        let sessions = SessionManager::new(config.session.ttl());

        let metadata = match &config_path {
            Some(path) => Some(Arc::new(MetadataStore::load(path).await)),
            None => None,
        };
        let audit = config_path.as_ref().map(|path| {
            AuditLog::open(AuditLog::path_for(path), &config.security.redact_keys)
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = UpstreamManager::new(
            registry.clone(),
            config.timeouts.clone(),
            config.concurrency.clone(),
            events_tx,
            metadata.clone(),
        );

        let router = Router::new(
            registry.clone(),
            manager.clone(),
            sessions.clone(),
            config.timeouts.clone(),
            audit.clone(),
        );

        for spec in config.effective_servers(&tags) {
            manager.install(spec);
        }

        spawn_event_pump(events_rx, sessions.clone(), audit.clone());

        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            tags,
            registry,
            manager,
            sessions,
            router,
            audit,
            metadata,
            shutdown: CancellationToken::new(),
        })
    }

    /// Activate `always` upstreams, prime lazy ones from cached metadata,
    /// and start the background sweeps.
    pub async fn start(&self) {
        self.audit(AuditEventKind::ConfigRead, serde_json::json!({
            "servers": self.manager.ids(),
        }));

        if let Some(metadata) = &self.metadata {
            for id in self.manager.ids() {
                if let Some(caps) = metadata.cached(&id).await {
                    self.manager.prime(&id, &caps);
                }
            }
        }

        self.manager.start_always().await;
        self.manager.spawn_idle_sweep();
        self.sessions.clone().spawn_cleanup(self.shutdown.child_token());
    }

    /// Stop background work and close every upstream session.
    pub async fn stop(&self) {
        tracing::info!("hub stopping");
        self.shutdown.cancel();
        self.manager.stop_all().await;
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn config(&self) -> Arc<HubConfig> {
        self.config.read().expect("config lock").clone()
    }

    /// Dispatch one message.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        self.router.handle(request, ctx).await
    }

    /// Dispatch a whole body element-wise, preserving order. Notifications
    /// produce no entry in the result.
    pub async fn handle_body(&self, body: RpcBody, ctx: &RequestContext) -> Vec<JsonRpcResponse> {
        let mut responses = Vec::new();
        for message in body.into_messages() {
            if let Some(response) = self.handle(message, ctx).await {
                responses.push(response);
            }
        }
        responses
    }

    /// Apply a reloaded config: converge upstream state to the new server
    /// set and emit a single aggregated list_changed per capability class.
    pub async fn apply_config(&self, new_config: HubConfig) -> HubResult<()> {
        let old_config = self.config();
        let old_servers = old_config.effective_servers(&self.tags);
        let new_servers = new_config.effective_servers(&self.tags);
        let diff = ConfigDiff::between(&old_servers, &new_servers);
        let naming_changed = old_config.tool_naming != new_config.tool_naming;

        if diff.is_empty() && !naming_changed {
            *self.config.write().expect("config lock") = Arc::new(new_config);
            return Ok(());
        }

        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            naming_changed,
            "applying configuration change"
        );

        // Snapshot listings so one aggregated notification can cover the
        // whole reload, however many registrations it touches.
        let before = self.listing_snapshot();

        if naming_changed {
            self.apply_naming_change(&new_config, &new_servers).await;
        }

        for id in &diff.removed {
            self.manager.remove(id, true).await;
            if let Some(metadata) = &self.metadata {
                metadata.remove(id).await;
            }
            self.audit(AuditEventKind::ServerRemoved, serde_json::json!({"id": id}));
        }

        for spec in &diff.added {
            self.manager.install(spec.clone());
            self.audit(AuditEventKind::ServerAdded, serde_json::json!({"id": spec.id}));
            self.activate_if_always(spec).await;
        }

        for spec in &diff.modified {
            self.audit(AuditEventKind::ServerModified, serde_json::json!({"id": spec.id}));
            if let Err(e) = self.manager.update_spec(spec.clone()).await {
                tracing::warn!(upstream = %spec.id, error = %e, "restart after modify failed");
            }
        }

        *self.config.write().expect("config lock") = Arc::new(new_config);
        if let Some(path) = &self.config_path {
            persist::write_backup(path).await;
        }

        let after = self.listing_snapshot();
        let changes = RegistryChanges {
            tools: before.0 != after.0,
            resources: before.1 != after.1,
            prompts: before.2 != after.2,
        };
        self.broadcast_list_changed(changes);
        self.audit(AuditEventKind::ConfigWrite, serde_json::json!({
            "added": diff.added.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            "removed": diff.removed,
            "modified": diff.modified.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        }));
        Ok(())
    }

    /// A naming change invalidates every public name: quiesce everything,
    /// swap the naming config, and bring back what should be running.
    async fn apply_naming_change(&self, new_config: &HubConfig, new_servers: &[UpstreamSpec]) {
        for id in self.manager.ids() {
            if let Err(e) = self.manager.deactivate(&id, true, "naming change").await {
                tracing::debug!(upstream = %id, error = %e, "deactivate for naming change");
            }
        }
        if let Err(e) = self.registry.set_naming(new_config.tool_naming.clone()) {
            tracing::error!(error = %e, "naming swap failed");
            return;
        }
        for spec in new_servers {
            self.activate_if_always(spec).await;
        }
    }

    async fn activate_if_always(&self, spec: &UpstreamSpec) {
        if spec.activation_policy != ActivationPolicy::Always {
            return;
        }
        if let Err(e) = self
            .manager
            .activate(&spec.id, &crate::upstream::ActivationTrigger::Reload, true)
            .await
        {
            tracing::warn!(upstream = %spec.id, error = %e, "activation after reload failed");
        }
    }

    fn listing_snapshot(&self) -> (Vec<Value>, Vec<Value>, Vec<Value>) {
        (
            self.registry.list_tools(),
            self.registry.list_resources(),
            self.registry.list_prompts(),
        )
    }

    fn broadcast_list_changed(&self, changes: RegistryChanges) {
        broadcast_changes(&self.sessions, changes);
    }

    fn audit(&self, kind: AuditEventKind, details: Value) {
        if let Some(audit) = &self.audit {
            audit.record(kind, details);
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("upstreams", &self.manager.ids())
            .field("sessions", &self.sessions.count())
            .finish()
    }
}

fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    sessions: Arc<SessionManager>,
    audit: Option<AuditLog>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::CapabilitiesChanged(changes) => {
                    broadcast_changes(&sessions, changes);
                }
                HubEvent::UpstreamActivated { id } => {
                    if let Some(audit) = &audit {
                        audit.record(
                            AuditEventKind::ServerActivated,
                            serde_json::json!({"id": id}),
                        );
                    }
                }
                HubEvent::UpstreamDeactivated { id } => {
                    if let Some(audit) = &audit {
                        audit.record(
                            AuditEventKind::ServerDeactivated,
                            serde_json::json!({"id": id}),
                        );
                    }
                }
                HubEvent::UpstreamFailed { id, error } => {
                    if let Some(audit) = &audit {
                        audit.record(
                            AuditEventKind::Error,
                            serde_json::json!({"id": id, "error": error}),
                        );
                    }
                }
            }
        }
    });
}

fn broadcast_changes(sessions: &Arc<SessionManager>, changes: RegistryChanges) {
    for (flag, method) in [
        (changes.tools, methods::TOOLS_LIST_CHANGED),
        (changes.resources, methods::RESOURCES_LIST_CHANGED),
        (changes.prompts, methods::PROMPTS_LIST_CHANGED),
    ] {
        if !flag {
            continue;
        }
        let frame = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        let delivered = sessions.broadcast(&frame);
        tracing::debug!(method, delivered, "list change notified");
    }
}
