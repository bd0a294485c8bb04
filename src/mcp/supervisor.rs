//! Connection lifecycle management.
//!
//! Every server gets one independent lifecycle task:
//!
//! ```text
//! Connecting ──handshake + tools/list──▶ Ready ──cancel──▶ Closing ──▶ Closed
//!      │                                  │
//!      └──────────── error ─────────▶ Failed ◀── transport error
//! ```
//!
//! A `Ready` connection parks on its cancellation token; `remove` and
//! `shutdown` cancel it and wait (bounded) for the task to finish. The
//! session handle lives inside [`LinkState::Ready`], so it exists exactly while
//! the connection is ready.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::catalog::{McpTool, ToolCatalog};
use super::config::ServerConfig;
use super::session::{Connector, RootEntry, RootSet, SessionContext, ToolOutput, ToolSession};
use crate::error::AgentError;
use crate::observer::SessionObserver;

/// Timing knobs for connection lifecycles.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Upper bound for transport open, handshake and initial tool listing.
    pub startup_timeout: Duration,
    /// How long `remove` waits for a task before aborting it.
    pub teardown_timeout: Duration,
    /// Pause after a teardown before the name can be connected again.
    pub reuse_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(5),
            reuse_grace: Duration::from_millis(100),
        }
    }
}

/// Public view of a connection's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed(String),
}

enum LinkState {
    Connecting,
    Ready(Arc<dyn ToolSession>),
    Closing,
    Closed,
    Failed(String),
}

impl LinkState {
    fn status(&self) -> ConnectionStatus {
        match self {
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Ready(_) => ConnectionStatus::Ready,
            Self::Closing => ConnectionStatus::Closing,
            Self::Closed => ConnectionStatus::Closed,
            Self::Failed(reason) => ConnectionStatus::Failed(reason.clone()),
        }
    }

    fn session(&self) -> Option<Arc<dyn ToolSession>> {
        match self {
            Self::Ready(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }
}

struct Slot {
    epoch: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: Arc<watch::Sender<LinkState>>,
}

/// Owns one lifecycle task per configured server.
pub struct ConnectionSupervisor {
    catalog: Arc<ToolCatalog>,
    connector: Arc<dyn Connector>,
    context: SessionContext,
    settings: SupervisorSettings,
    slots: Mutex<HashMap<String, Slot>>,
    /// Serializes add/remove per server name.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_epoch: AtomicU64,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("settings", &self.settings)
            .field("statuses", &self.statuses())
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// `workspace_root` is the first root advertised to every server.
    #[must_use]
    pub fn new(
        catalog: Arc<ToolCatalog>,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn SessionObserver>,
        workspace_root: RootEntry,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            catalog,
            connector,
            context: SessionContext {
                observer,
                roots: RootSet::new(workspace_root),
            },
            settings,
            slots: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// Start a connection for `name`, replacing any existing one.
    ///
    /// Returns once the lifecycle task is spawned; use
    /// [`wait_settled`](Self::wait_settled) to wait for the handshake.
    pub async fn add(&self, name: &str, config: ServerConfig) {
        let gate = self.gate(name);
        let _guard = gate.lock().await;

        if self.teardown(name).await {
            tokio::time::sleep(self.settings.reuse_grace).await;
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(LinkState::Connecting);
        let state = Arc::new(state);

        let lifecycle = Lifecycle {
            server: name.to_string(),
            epoch,
            config,
            connector: Arc::clone(&self.connector),
            context: self.context.clone(),
            catalog: Arc::clone(&self.catalog),
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            startup_timeout: self.settings.startup_timeout,
        };

        tracing::info!(server = %name, epoch, "Starting MCP connection");
        let task = tokio::spawn(lifecycle.run());

        self.lock_slots().insert(
            name.to_string(),
            Slot {
                epoch,
                cancel,
                task,
                state,
            },
        );
    }

    /// Stop the connection for `name` and purge its tools.
    ///
    /// After return `is_connected(name)` is false and the catalog holds
    /// nothing owned by `name`.
    pub async fn remove(&self, name: &str) {
        let gate = self.gate(name);
        let _guard = gate.lock().await;

        if self.teardown(name).await {
            tokio::time::sleep(self.settings.reuse_grace).await;
        }
    }

    /// Call a tool on `server`. The result is returned as is.
    ///
    /// A result that arrives after the connection was removed or replaced is
    /// discarded and reported as [`AgentError::NotConnected`].
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutput, AgentError> {
        let (epoch, session) = self
            .ready_session(server)
            .ok_or_else(|| AgentError::NotConnected(server.to_string()))?;

        tracing::debug!(server = %server, tool = %tool, "Calling MCP tool");
        let result = session.call_tool(tool, arguments).await;

        if self.ready_session(server).map(|(current, _)| current) != Some(epoch) {
            tracing::warn!(server = %server, tool = %tool, "Connection went away during call, discarding result");
            return Err(AgentError::NotConnected(server.to_string()));
        }

        let outcome = match &result {
            Ok(out) if out.is_error => "tool_error",
            Ok(_) => "ok",
            Err(AgentError::Connection { reason, .. }) => {
                self.mark_failed(server, epoch, reason.clone());
                "transport_error"
            }
            Err(_) => "error",
        };
        metrics::counter!("mcp_tool_calls_total", "server" => server.to_string(), "outcome" => outcome)
            .increment(1);

        result
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.ready_session(name).is_some()
    }

    /// Names of `Ready` connections, sorted.
    pub fn list_connected(&self) -> Vec<String> {
        let slots = self.lock_slots();
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(*slot.state.borrow(), LinkState::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn status(&self, name: &str) -> Option<ConnectionStatus> {
        self.lock_slots().get(name).map(|slot| slot.state.borrow().status())
    }

    pub fn statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.lock_slots()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.state.borrow().status()))
            .collect()
    }

    /// Wait until the connection leaves `Connecting`.
    ///
    /// Returns `None` if there is no connection for `name`.
    pub async fn wait_settled(&self, name: &str) -> Option<ConnectionStatus> {
        let mut rx = self.lock_slots().get(name)?.state.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s, LinkState::Connecting))
            .await
            .map(|s| s.status())
            .ok();
        Some(settled.unwrap_or_else(|| rx.borrow().status()))
    }

    /// Stop every connection and wait for all of them to drain.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot)> = self.lock_slots().drain().collect();
        if slots.is_empty() {
            return;
        }
        tracing::info!(connection_count = slots.len(), "Shutting down MCP connections");

        for (_, slot) in &slots {
            slot.cancel.cancel();
        }

        let teardown_timeout = self.settings.teardown_timeout;
        let drained = futures::future::join_all(slots.into_iter().map(|(name, slot)| async move {
            await_task(&name, slot.task, teardown_timeout).await;
            name
        }))
        .await;

        for name in &drained {
            self.catalog.unregister(name);
        }
        tokio::time::sleep(self.settings.reuse_grace).await;
    }

    /// Re-list tools on every ready connection and re-register them.
    pub async fn refresh_tools(&self) {
        for (name, epoch, session) in self.ready_sessions() {
            match session.list_tools().await {
                Ok(tools) => {
                    let slots = self.lock_slots();
                    let current = slots
                        .get(&name)
                        .filter(|slot| slot.epoch == epoch && slot.state.borrow().session().is_some());
                    if current.is_some() {
                        if let Err(e) = self.catalog.register(&name, epoch, tools) {
                            tracing::warn!(server = %name, error = %e, "Refreshed tools rejected");
                        }
                    }
                }
                Err(e) => tracing::warn!(server = %name, error = %e, "Failed to refresh tools"),
            }
        }
    }

    pub fn list_roots(&self) -> Vec<RootEntry> {
        self.context.roots.list()
    }

    /// Add a root directory and notify ready servers.
    ///
    /// Returns `Ok(false)` when the directory is already a root.
    pub async fn add_root(&self, path: &Path, name: Option<&str>) -> Result<bool, AgentError> {
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| AgentError::Config(format!("root {} is not accessible: {e}", path.display())))?;
        let entry = RootEntry::for_directory(&canonical, name)?;

        if !self.context.roots.insert(entry) {
            tracing::debug!(path = %canonical.display(), "Root already present");
            return Ok(false);
        }
        self.notify_roots_changed().await;
        Ok(true)
    }

    /// Remove a root by URI. The workspace root stays.
    pub async fn remove_root(&self, uri: &str) -> bool {
        if !self.context.roots.remove(uri) {
            return false;
        }
        self.notify_roots_changed().await;
        true
    }

    async fn notify_roots_changed(&self) {
        let sessions = self.ready_sessions();
        futures::future::join_all(sessions.into_iter().map(|(name, _, session)| async move {
            if let Err(e) = session.notify_roots_changed().await {
                tracing::warn!(server = %name, error = %e, "Failed to send roots changed notification");
            }
        }))
        .await;
    }

    /// Remove the slot, cancel its task and wait for it. Caller holds the gate.
    async fn teardown(&self, name: &str) -> bool {
        let slot = self.lock_slots().remove(name);
        let Some(slot) = slot else {
            self.catalog.unregister(name);
            return false;
        };

        tracing::info!(server = %name, epoch = slot.epoch, "Stopping MCP connection");
        slot.cancel.cancel();
        await_task(name, slot.task, self.settings.teardown_timeout).await;
        self.catalog.unregister(name);
        true
    }

    /// Tools leave the catalog here, before the lifecycle task wakes up.
    fn mark_failed(&self, server: &str, epoch: u64, reason: String) {
        let marked = {
            let slots = self.lock_slots();
            match slots.get(server).filter(|slot| slot.epoch == epoch) {
                Some(slot) => {
                    tracing::error!(server = %server, reason = %reason, "MCP transport failed");
                    slot.state.send_replace(LinkState::Failed(reason));
                    slot.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        if marked {
            self.catalog.unregister_epoch(server, epoch);
        }
    }

    fn ready_session(&self, name: &str) -> Option<(u64, Arc<dyn ToolSession>)> {
        let slots = self.lock_slots();
        let slot = slots.get(name)?;
        let session = slot.state.borrow().session()?;
        Some((slot.epoch, session))
    }

    fn ready_sessions(&self) -> Vec<(String, u64, Arc<dyn ToolSession>)> {
        let slots = self.lock_slots();
        let mut sessions: Vec<_> = slots
            .iter()
            .filter_map(|(name, slot)| {
                let session = slot.state.borrow().session()?;
                Some((name.clone(), slot.epoch, session))
            })
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    fn gate(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(name.to_string()).or_default())
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait for a lifecycle task, aborting it if it overruns `limit`.
async fn await_task(name: &str, mut task: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(server = %name, error = %e, "MCP connection task panicked"),
        Err(_) => {
            tracing::warn!(server = %name, timeout_ms = limit.as_millis(), "MCP connection did not stop in time, aborting");
            task.abort();
        }
    }
}

/// State owned by one lifecycle task.
struct Lifecycle {
    server: String,
    epoch: u64,
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    context: SessionContext,
    catalog: Arc<ToolCatalog>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<LinkState>>,
    startup_timeout: Duration,
}

impl Lifecycle {
    async fn run(self) {
        let opened = tokio::select! {
            () = self.cancel.cancelled() => {
                self.state.send_replace(LinkState::Closed);
                return;
            }
            opened = tokio::time::timeout(self.startup_timeout, self.open()) => opened,
        };

        let (session, tools) = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => return self.fail(e).await,
            Err(_) => {
                let e = AgentError::connection(
                    &self.server,
                    format!("handshake timed out after {}ms", self.startup_timeout.as_millis()),
                );
                return self.fail(e).await;
            }
        };

        self.state.send_replace(LinkState::Ready(Arc::clone(&session)));
        if let Err(e) = self.catalog.register(&self.server, self.epoch, tools.clone()) {
            session.close().await;
            return self.fail(e).await;
        }
        metrics::counter!("mcp_connections_total", "server" => self.server.clone(), "outcome" => "ready")
            .increment(1);
        self.context.observer.on_connect(&self.server, &tools).await;

        self.cancel.cancelled().await;

        self.catalog.unregister_epoch(&self.server, self.epoch);
        let failure = match &*self.state.borrow() {
            LinkState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        if failure.is_none() {
            self.state.send_replace(LinkState::Closing);
        }
        session.close().await;

        match failure {
            Some(reason) => {
                let e = AgentError::connection(&self.server, reason);
                self.context.observer.on_connection_error(&self.server, &e).await;
            }
            None => {
                self.state.send_replace(LinkState::Closed);
                self.context.observer.on_disconnect(&self.server).await;
            }
        }
    }

    async fn open(&self) -> Result<(Arc<dyn ToolSession>, Vec<McpTool>), AgentError> {
        let session = self
            .connector
            .connect(&self.server, &self.config, self.context.clone())
            .await?;
        match session.list_tools().await {
            Ok(tools) => Ok((session, tools)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn fail(&self, error: AgentError) {
        self.catalog.unregister_epoch(&self.server, self.epoch);
        self.state.send_replace(LinkState::Failed(error.to_string()));
        metrics::counter!("mcp_connections_total", "server" => self.server.clone(), "outcome" => "failed")
            .increment(1);
        self.context
            .observer
            .on_connection_error(&self.server, &error)
            .await;
    }
}
