//! Activation manager: one desired/actual state machine per upstream.
//!
//! A per-upstream transition lock serializes start/stop; everyone else
//! observes the state through a watch channel and the shared session slot.
//! On successful activation the manager runs the initialize handshake,
//! fetches listings, registers them, and announces the change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::session::UpstreamSession;
use super::{ActivationTrigger, ActualState, DesiredState, UpstreamStatus};
use crate::config::{ActivationPolicy, Concurrency, IdleStrategy, Timeouts, UpstreamSpec, defaults};
use crate::error::{HubError, HubResult};
use crate::persist::MetadataStore;
use crate::protocol::{
    PromptDescriptor, ResourceDescriptor, ToolDescriptor, UpstreamCapabilities, codes, methods,
};
use crate::registry::{CapabilityRegistry, RegistryChanges};
use crate::transport::{self, candidate_kinds};

/// Manager-to-hub announcements, fanned out to downstream sessions and the
/// audit log by the hub core.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Registry content changed; emit the matching list_changed
    /// notifications.
    CapabilitiesChanged(RegistryChanges),
    UpstreamActivated { id: String },
    UpstreamDeactivated { id: String },
    UpstreamFailed { id: String, error: String },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<HubEvent>;

struct UpstreamHandle {
    spec: RwLock<UpstreamSpec>,
    desired: RwLock<DesiredState>,
    state_tx: watch::Sender<ActualState>,
    session: RwLock<Option<Arc<UpstreamSession>>>,
    /// Serializes start/stop transitions.
    transition: tokio::sync::Mutex<()>,
    /// Bumped on every deliberate start/stop so stale exit monitors and
    /// restart loops notice they lost.
    generation: AtomicU64,
    activations: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl UpstreamHandle {
    fn new(spec: UpstreamSpec) -> Arc<Self> {
        let desired = match spec.activation_policy {
            ActivationPolicy::Always => DesiredState::Running,
            _ => DesiredState::Stopped,
        };
        let (state_tx, _) = watch::channel(ActualState::Stopped);
        Arc::new(Self {
            spec: RwLock::new(spec),
            desired: RwLock::new(desired),
            state_tx,
            session: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            activations: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    fn actual(&self) -> ActualState {
        *self.state_tx.borrow()
    }

    fn set_actual(&self, state: ActualState) {
        let _ = self.state_tx.send(state);
    }

    fn spec(&self) -> UpstreamSpec {
        self.spec.read().expect("spec lock").clone()
    }

    fn desired(&self) -> DesiredState {
        *self.desired.read().expect("desired lock")
    }

    fn set_desired(&self, desired: DesiredState) {
        *self.desired.write().expect("desired lock") = desired;
    }

    fn session(&self) -> Option<Arc<UpstreamSession>> {
        self.session.read().expect("session lock").clone()
    }

    fn record_error(&self, error: &HubError) {
        *self.last_error.lock().expect("error lock") = Some(error.to_string());
    }
}

pub struct UpstreamManager {
    registry: Arc<CapabilityRegistry>,
    timeouts: Timeouts,
    concurrency: Concurrency,
    handles: RwLock<HashMap<String, Arc<UpstreamHandle>>>,
    events: EventSender,
    metadata: Option<Arc<MetadataStore>>,
    shutdown: CancellationToken,
    /// Self-reference for the tasks this manager spawns.
    me: Weak<Self>,
}

impl UpstreamManager {
    #[must_use]
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        timeouts: Timeouts,
        concurrency: Concurrency,
        events: EventSender,
        metadata: Option<Arc<MetadataStore>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            timeouts,
            concurrency,
            handles: RwLock::new(HashMap::new()),
            events,
            metadata,
            shutdown: CancellationToken::new(),
            me: me.clone(),
        })
    }

    /// Install state for a spec first seen. Does not connect.
    pub fn install(&self, spec: UpstreamSpec) {
        let id = spec.id.clone();
        let mut handles = self.handles.write().expect("handles lock");
        handles.entry(id).or_insert_with(|| UpstreamHandle::new(spec));
    }

    /// Forget an upstream entirely: stop it, unregister, drop state.
    pub async fn remove(&self, id: &str, quiet: bool) {
        if let Err(e) = self.deactivate(id, quiet, "removed from configuration").await {
            tracing::debug!(upstream = %id, error = %e, "deactivate during removal");
        }
        self.handles.write().expect("handles lock").remove(id);
    }

    /// Replace the spec of an existing upstream. If it was running it is
    /// restarted; list-change notifications stay suppressed until the new
    /// capabilities are registered (the caller emits one aggregated
    /// notification).
    pub async fn update_spec(&self, spec: UpstreamSpec) -> HubResult<()> {
        let handle = self.handle(&spec.id)?;
        let was_running = matches!(handle.actual(), ActualState::Ready | ActualState::Starting);
        let id = spec.id.clone();
        let policy = spec.activation_policy;

        self.deactivate(&id, true, "restart").await?;
        *handle.spec.write().expect("spec lock") = spec;
        handle.set_desired(match policy {
            ActivationPolicy::Always => DesiredState::Running,
            _ => DesiredState::Stopped,
        });

        if was_running || policy == ActivationPolicy::Always {
            self.activate(&id, &ActivationTrigger::Reload, true).await?;
        }
        Ok(())
    }

    /// Ids of every installed upstream.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.handles.read().expect("handles lock").keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<UpstreamStatus> {
        let handles: Vec<(String, Arc<UpstreamHandle>)> = {
            let guard = self.handles.read().expect("handles lock");
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut statuses: Vec<UpstreamStatus> = handles
            .into_iter()
            .map(|(id, handle)| UpstreamStatus {
                desired: handle.desired(),
                actual: handle.actual(),
                activation_policy: handle.spec().activation_policy,
                activations: handle.activations.load(Ordering::SeqCst),
                tool_count: self.registry.tool_count(&id),
                last_error: handle.last_error.lock().expect("error lock").clone(),
                id,
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Activate every `always` upstream. Individual failures are recorded
    /// and logged, never fatal to startup.
    pub async fn start_always(&self) {
        let Some(me) = self.me.upgrade() else { return };
        let ids: Vec<String> = {
            let handles = self.handles.read().expect("handles lock");
            handles
                .iter()
                .filter(|(_, h)| h.spec().activation_policy == ActivationPolicy::Always)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut tasks = Vec::new();
        for id in ids {
            let manager = me.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = manager.activate(&id, &ActivationTrigger::Startup, false).await {
                    tracing::warn!(upstream = %id, error = %e, "startup activation failed");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Stop everything. Used on hub shutdown.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        for id in self.ids() {
            if let Err(e) = self.deactivate(&id, true, "hub shutting down").await {
                tracing::debug!(upstream = %id, error = %e, "deactivate during shutdown");
            }
        }
    }

    /// Seed registry entries for a lazy upstream from cached metadata so
    /// listings have content before first activation.
    pub fn prime(&self, id: &str, caps: &UpstreamCapabilities) {
        let Ok(handle) = self.handle(id) else { return };
        let spec = handle.spec();
        if spec.activation_policy == ActivationPolicy::Always {
            return;
        }
        if self.registry.has_upstream(id) {
            return;
        }
        match self.registry.register_upstream(&spec, caps) {
            Ok(_) => {
                tracing::debug!(upstream = %id, tools = caps.tools.len(), "primed from cached metadata");
            }
            Err(e) => {
                tracing::warn!(upstream = %id, error = %e, "metadata priming failed");
            }
        }
    }

    /// Resolve the session for a routed call, activating per policy.
    pub async fn session_for(
        &self,
        id: &str,
        trigger: &ActivationTrigger,
    ) -> HubResult<Arc<UpstreamSession>> {
        let handle = self.handle(id)?;
        if let Some(session) = handle.session() {
            if !session.is_closed() && handle.actual() == ActualState::Ready {
                return Ok(session);
            }
        }

        let policy = handle.spec().activation_policy;
        if policy == ActivationPolicy::Manual && !matches!(trigger, ActivationTrigger::Manual) {
            return Err(HubError::config(format!(
                "upstream '{id}' requires manual activation"
            )));
        }
        self.activate(id, trigger, false).await
    }

    /// Drive one upstream to ready. Concurrent callers share the same
    /// attempt: whoever holds the transition lock starts, the rest wait on
    /// the state watch.
    pub async fn activate(
        &self,
        id: &str,
        trigger: &ActivationTrigger,
        quiet: bool,
    ) -> HubResult<Arc<UpstreamSession>> {
        let handle = self.handle(id)?;
        let deadline = tokio::time::Instant::now() + self.timeouts.activation();

        loop {
            match handle.actual() {
                ActualState::Ready => {
                    if let Some(session) = handle.session() {
                        if !session.is_closed() {
                            return Ok(session);
                        }
                    }
                    // Stale ready state; fall through to restart.
                }
                state @ (ActualState::Starting | ActualState::Stopping) => {
                    self.wait_state_change(&handle, state, deadline).await?;
                    continue;
                }
                ActualState::Stopped | ActualState::Failing => {}
            }

            let _transition = handle.transition.lock().await;
            // Re-check: the previous holder may have finished the job.
            match handle.actual() {
                ActualState::Ready => {
                    if let Some(session) = handle.session() {
                        if !session.is_closed() {
                            continue;
                        }
                    }
                    // Ready but the session died underneath; start fresh.
                }
                ActualState::Starting | ActualState::Stopping => continue,
                ActualState::Stopped | ActualState::Failing => {}
            }

            tracing::info!(upstream = %id, trigger = trigger.as_str(), "activating upstream");
            handle.set_actual(ActualState::Starting);

            match self.start_instance(&handle, quiet).await {
                Ok(session) => {
                    *handle.session.write().expect("session lock") = Some(session.clone());
                    handle.set_actual(ActualState::Ready);
                    handle.activations.fetch_add(1, Ordering::SeqCst);
                    *handle.last_error.lock().expect("error lock") = None;
                    tracing::info!(upstream = %id, "upstream ready");
                    if !quiet {
                        self.emit(HubEvent::UpstreamActivated { id: id.to_string() });
                    }
                    return Ok(session);
                }
                Err(e) => {
                    handle.record_error(&e);
                    tracing::warn!(upstream = %id, error = %e, "activation failed");
                    handle.set_actual(match e {
                        // Sticky so operators can see the misconfiguration.
                        HubError::Config { .. } => ActualState::Failing,
                        _ => ActualState::Stopped,
                    });
                    self.emit(HubEvent::UpstreamFailed {
                        id: id.to_string(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
    }

    /// Stop one upstream: unregister first (the invariant is that entries
    /// disappear before the state reaches stopped), then close the session,
    /// cancelling in-flight calls with `reason`.
    pub async fn deactivate(&self, id: &str, quiet: bool, reason: &str) -> HubResult<()> {
        let handle = self.handle(id)?;
        let _transition = handle.transition.lock().await;

        handle.generation.fetch_add(1, Ordering::SeqCst);
        let session = handle.session.write().expect("session lock").take();
        let had_session = session.is_some();
        if had_session {
            handle.set_actual(ActualState::Stopping);
        }

        let changes = self.registry.unregister_upstream(id);
        if changes.any() && !quiet {
            self.emit(HubEvent::CapabilitiesChanged(changes));
        }

        if let Some(session) = session {
            session.close_with_reason(reason).await;
            tracing::info!(upstream = %id, reason, "upstream stopped");
            if !quiet {
                self.emit(HubEvent::UpstreamDeactivated { id: id.to_string() });
            }
        }
        handle.set_actual(ActualState::Stopped);
        Ok(())
    }

    /// One pass of the idle sweep: shut down `onDemand` upstreams that have
    /// been idle past their window with no calls in flight.
    pub async fn run_idle_sweep(&self) {
        let handles: Vec<(String, Arc<UpstreamHandle>)> = {
            let guard = self.handles.read().expect("handles lock");
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (id, handle) in handles {
            let spec = handle.spec();
            if spec.activation_policy != ActivationPolicy::OnDemand
                || spec.idle_policy.strategy != IdleStrategy::Shutdown
                || handle.actual() != ActualState::Ready
            {
                continue;
            }
            let Some(session) = handle.session() else { continue };
            if session.has_active_calls()
                || session.last_activity().elapsed() < spec.idle_policy.idle_window()
            {
                continue;
            }
            tracing::info!(upstream = %id, idle_ms = spec.idle_policy.idle_ms, "idle shutdown");
            if let Err(e) = self.deactivate(&id, false, "idle shutdown").await {
                tracing::debug!(upstream = %id, error = %e, "idle shutdown failed");
            }
        }
    }

    /// Background idle sweep, every 30 s until shutdown.
    pub fn spawn_idle_sweep(&self) {
        let Some(manager) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(defaults::IDLE_SWEEP);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.run_idle_sweep().await,
                }
            }
        });
    }

    fn handle(&self, id: &str) -> HubResult<Arc<UpstreamHandle>> {
        self.handles
            .read()
            .expect("handles lock")
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::config(format!("unknown upstream '{id}'")))
    }

    fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    async fn wait_state_change(
        &self,
        handle: &Arc<UpstreamHandle>,
        observed: ActualState,
        deadline: tokio::time::Instant,
    ) -> HubResult<()> {
        let mut rx = handle.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() != observed {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Ok(()),
                Err(_) => {
                    return Err(HubError::timeout("activation", self.timeouts.activation())
                        .with_upstream(handle.spec().id.as_str()));
                }
            }
        }
    }

    /// Connect, handshake, fetch listings, register. The transition lock is
    /// held by the caller.
    async fn start_instance(
        &self,
        handle: &Arc<UpstreamHandle>,
        quiet: bool,
    ) -> HubResult<Arc<UpstreamSession>> {
        let spec = handle.spec();
        let id = spec.id.clone();
        let generation = handle.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut last_error =
            HubError::transport_for(&id, "no transport candidates for upstream");
        for kind in candidate_kinds(&spec) {
            let connection =
                match tokio::time::timeout(self.timeouts.spawn(), transport::connect(&spec, kind))
                    .await
                {
                    Ok(Ok(connection)) => connection,
                    Ok(Err(e)) => {
                        tracing::debug!(upstream = %id, ?kind, error = %e, "transport connect failed");
                        last_error = HubError::transport_for(&id, e.to_string());
                        continue;
                    }
                    Err(_) => {
                        last_error = HubError::timeout("spawn", self.timeouts.spawn())
                            .with_upstream(&id);
                        continue;
                    }
                };

            let session = UpstreamSession::start(
                id.clone(),
                connection,
                self.concurrency.for_server(&id),
            );

            match self.handshake(&session).await {
                Ok(info) => {
                    let caps = match self.fetch_capabilities(&session, info).await {
                        Ok(caps) => caps,
                        Err(e) => {
                            session.close().await;
                            return Err(e);
                        }
                    };
                    self.register(handle, &spec, &caps, &session, generation, quiet).await?;
                    return Ok(session);
                }
                Err(e) => {
                    tracing::debug!(upstream = %id, ?kind, error = %e, "handshake failed");
                    session.close().await;
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn handshake(&self, session: &Arc<UpstreamSession>) -> HubResult<(Value, Option<String>)> {
        let cancel = CancellationToken::new();
        let params = serde_json::json!({
            "protocolVersion": crate::protocol::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "hatago-hub",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = session
            .call(methods::INITIALIZE, params, self.timeouts.healthcheck(), &cancel)
            .await?;
        session.notify(methods::INITIALIZED, Value::Null).await?;

        let server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Ok((server_info, protocol_version))
    }

    async fn fetch_capabilities(
        &self,
        session: &Arc<UpstreamSession>,
        (server_info, protocol_version): (Value, Option<String>),
    ) -> HubResult<UpstreamCapabilities> {
        let tools = self.fetch_list(session, methods::TOOLS_LIST, "tools").await?;
        let resources = self.fetch_list(session, methods::RESOURCES_LIST, "resources").await?;
        let prompts = self.fetch_list(session, methods::PROMPTS_LIST, "prompts").await?;

        Ok(UpstreamCapabilities {
            tools: parse_descriptors::<ToolDescriptor>(&tools),
            resources: parse_descriptors::<ResourceDescriptor>(&resources),
            prompts: parse_descriptors::<PromptDescriptor>(&prompts),
            server_info,
            protocol_version,
        })
    }

    /// Listing calls are idempotent: one retry with backoff on transport
    /// failures. Method-not-found means the capability class is absent.
    async fn fetch_list(
        &self,
        session: &Arc<UpstreamSession>,
        method: &str,
        key: &str,
    ) -> HubResult<Vec<Value>> {
        let cancel = CancellationToken::new();
        let mut attempt = 0u32;
        loop {
            let result = session
                .call(method, serde_json::json!({}), self.timeouts.tool_call(), &cancel)
                .await;
            match result {
                Ok(value) => {
                    let items = value
                        .get(key)
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    return Ok(items);
                }
                Err(HubError::ToolInvocation { code, .. }) if code == codes::METHOD_NOT_FOUND => {
                    return Ok(Vec::new());
                }
                Err(e) if e.is_retryable() && attempt == 0 => {
                    attempt += 1;
                    tracing::debug!(upstream = %session.upstream_id(), method, error = %e, "retrying listing");
                    tokio::time::sleep(transport::backoff_delay(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn register(
        &self,
        handle: &Arc<UpstreamHandle>,
        spec: &UpstreamSpec,
        caps: &UpstreamCapabilities,
        session: &Arc<UpstreamSession>,
        generation: u64,
        quiet: bool,
    ) -> HubResult<()> {
        // Drop primed entries before registering the live listings.
        let mut changes = RegistryChanges::default();
        if self.registry.has_upstream(&spec.id) {
            changes = changes.merge(self.registry.unregister_upstream(&spec.id));
        }
        match self.registry.register_upstream(spec, caps) {
            Ok(registered) => changes = changes.merge(registered),
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        }
        if changes.any() && !quiet {
            self.emit(HubEvent::CapabilitiesChanged(changes));
        }

        if let Some(metadata) = &self.metadata {
            let metadata = metadata.clone();
            let id = spec.id.clone();
            let caps = caps.clone();
            tokio::spawn(async move {
                metadata.record(&id, &caps).await;
            });
        }

        self.spawn_exit_monitor(handle, session, generation);
        Ok(())
    }

    fn spawn_exit_monitor(
        &self,
        handle: &Arc<UpstreamHandle>,
        session: &Arc<UpstreamSession>,
        generation: u64,
    ) {
        let Some(manager) = self.me.upgrade() else { return };
        let handle = handle.clone();
        let mut closed = session.closed();
        tokio::spawn(async move {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            manager.on_unexpected_exit(&handle, generation).await;
        });
    }

    async fn on_unexpected_exit(&self, handle: &Arc<UpstreamHandle>, generation: u64) {
        if handle.generation.load(Ordering::SeqCst) != generation {
            return; // deliberate stop or restart already superseded us
        }
        if matches!(handle.actual(), ActualState::Stopping | ActualState::Stopped) {
            return;
        }

        let spec = handle.spec();
        let id = spec.id.clone();
        tracing::warn!(upstream = %id, "upstream connection lost");

        {
            let _transition = handle.transition.lock().await;
            if handle.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            handle.generation.fetch_add(1, Ordering::SeqCst);
            handle.set_actual(ActualState::Failing);
            handle.session.write().expect("session lock").take();
            let changes = self.registry.unregister_upstream(&id);
            if changes.any() {
                self.emit(HubEvent::CapabilitiesChanged(changes));
            }
            self.emit(HubEvent::UpstreamFailed {
                id: id.clone(),
                error: "connection closed".to_string(),
            });
        }

        let should_restart = handle.desired() == DesiredState::Running
            && spec.activation_policy == ActivationPolicy::Always
            && !self.shutdown.is_cancelled();
        if !should_restart {
            handle.set_actual(ActualState::Stopped);
            return;
        }

        let Some(manager) = self.me.upgrade() else { return };
        let handle = handle.clone();
        tokio::spawn(async move {
            for attempt in 1..=defaults::MAX_RESTARTS {
                let delay = transport::backoff_delay(attempt);
                tokio::select! {
                    () = manager.shutdown.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if handle.desired() != DesiredState::Running {
                    return;
                }
                match manager.activate(&handle.spec().id, &ActivationTrigger::Startup, false).await
                {
                    Ok(_) => return,
                    Err(e) => {
                        tracing::warn!(
                            upstream = %handle.spec().id,
                            attempt,
                            error = %e,
                            "restart attempt failed"
                        );
                    }
                }
            }
            tracing::error!(upstream = %handle.spec().id, "restart attempts exhausted");
            handle.set_actual(ActualState::Stopped);
        });
    }
}

fn parse_descriptors<T: serde::de::DeserializeOwned>(items: &[Value]) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

impl std::fmt::Debug for UpstreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamManager")
            .field("upstreams", &self.ids())
            .finish()
    }
}
