//! One interactive chat session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AgentError;
use crate::events::TurnEvent;
use crate::llm::{AgentSettings, ContentPart, ImageUrl, LlmDriver, Message, Orchestrator};
use crate::mcp::{
    CollisionPolicy, ConnectionStatus, ConnectionSupervisor, Connector, McpConfig, RootEntry,
    ServerConfig, SupervisorSettings, ToolCatalog,
};
use crate::observer::SessionObserver;
use crate::workspace::{self, Workspace};

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Parent of the per-session workspace directories.
    pub workspace_root: PathBuf,
    pub system_prompt: Option<String>,
    pub agent: AgentSettings,
    pub supervisor: SupervisorSettings,
    pub collisions: CollisionPolicy,
}

/// A user message with optional file attachments.
#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub text: String,
    pub attachments: Vec<PathBuf>,
}

impl UserInput {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Display row for one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    /// `None` while no connection exists for the server.
    pub status: Option<ConnectionStatus>,
    /// Tools the server currently has in the catalog.
    pub tools: Vec<String>,
}

/// Cancels the running turn from another task.
///
/// Each turn arms a fresh token, so an interrupt only ever hits the turn that
/// was running when it was issued.
#[derive(Debug, Clone, Default)]
pub struct Interrupter(Arc<Mutex<CancellationToken>>);

impl Interrupter {
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    pub fn interrupt(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).cancel();
    }
}

/// Conversation history, workspace and tool-server connections of one user.
#[derive(Debug)]
pub struct ChatSession {
    id: String,
    supervisor: Arc<ConnectionSupervisor>,
    orchestrator: Orchestrator,
    /// Server configs with placeholders already expanded for this workspace.
    servers: BTreeMap<String, ServerConfig>,
    workspace: Workspace,
    history: Vec<Message>,
    interrupter: Interrupter,
}

impl ChatSession {
    /// Create the workspace, seed history and connect every enabled server.
    ///
    /// Returns once every enabled server is either ready or failed. A failed
    /// server does not fail the session.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] if the tool-server config is invalid or
    /// the workspace directory cannot be created.
    pub async fn open(
        options: SessionOptions,
        mcp: McpConfig,
        driver: Arc<dyn LlmDriver>,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, AgentError> {
        let id = Uuid::new_v4().to_string();
        let workspace = Workspace::create(&options.workspace_root, &id)
            .await
            .map_err(|e| {
                AgentError::Config(format!(
                    "cannot create workspace under {}: {e}",
                    options.workspace_root.display()
                ))
            })?;
        let root = RootEntry::for_directory(workspace.dir(), Some("user_session_folder"))?;

        let catalog = Arc::new(ToolCatalog::new(options.collisions));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            catalog,
            connector,
            observer,
            root,
            options.supervisor,
        ));
        let orchestrator = Orchestrator::new(driver, Arc::clone(&supervisor), options.agent);

        let servers: BTreeMap<String, ServerConfig> = mcp
            .mcp_servers
            .iter()
            .map(|(name, config)| (name.clone(), config.resolve(workspace.dir())))
            .collect();
        McpConfig {
            mcp_servers: servers.clone(),
        }
        .validate()?;

        let mut history = Vec::new();
        if let Some(prompt) = options.system_prompt.filter(|p| !p.trim().is_empty()) {
            history.push(Message::system(prompt));
        }

        tracing::info!(
            session_id = %id,
            workspace = %workspace.dir().display(),
            server_count = servers.len(),
            "Opening chat session"
        );

        let session = Self {
            id,
            supervisor,
            orchestrator,
            servers,
            workspace,
            history,
            interrupter: Interrupter::default(),
        };

        let enabled: Vec<&String> = mcp.enabled_servers().map(|(name, _)| name).collect();
        for name in &enabled {
            if let Some(config) = session.servers.get(*name) {
                session.supervisor.add(name, config.clone()).await;
            }
        }
        futures::future::join_all(enabled.iter().map(|name| session.supervisor.wait_settled(name)))
            .await;

        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append the user's message and run one turn over it.
    ///
    /// Image attachments are inlined as data URLs; other files are copied
    /// into the workspace and mentioned by name.
    pub async fn start_turn(
        &mut self,
        input: UserInput,
    ) -> impl Stream<Item = TurnEvent> + Send + '_ {
        let message = self.user_message(input).await;
        self.history.push(message);

        let cancel = self.interrupter.arm();
        let Self {
            orchestrator,
            history,
            workspace,
            ..
        } = self;
        orchestrator.run_turn(history, workspace, cancel)
    }

    async fn user_message(&self, input: UserInput) -> Message {
        if input.attachments.is_empty() {
            return Message::user(input.text);
        }

        let mut parts = vec![ContentPart::text(input.text)];
        for path in &input.attachments {
            let name = path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

            if workspace::is_image(&name) {
                match workspace::data_url(path).await {
                    Ok(url) => {
                        parts.push(ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url,
                                detail: Some("high".to_string()),
                            },
                        });
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Could not read image attachment");
                    }
                }
            }

            if let Err(e) = self.stage_attachment(path, &name).await {
                tracing::warn!(path = %path.display(), error = %e, "Could not copy attachment into workspace");
            }
            parts.push(ContentPart::text(format!("(Received file: {name})")));
        }
        Message::user(parts)
    }

    async fn stage_attachment(&self, path: &Path, name: &str) -> std::io::Result<()> {
        let target = self.workspace.dir().join(name);
        if path == target {
            return Ok(());
        }
        tokio::fs::copy(path, &target).await.map(|_| ())
    }

    /// Handle that interrupts whichever turn is running.
    #[must_use]
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    #[must_use]
    pub fn list_connected(&self) -> Vec<String> {
        self.supervisor.list_connected()
    }

    /// Connect or disconnect a configured server.
    ///
    /// Enabling waits for the handshake to settle and returns the resulting
    /// status; a failed handshake is reported through the status, not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::UnknownServer`] if `name` is not configured.
    pub async fn set_connection_enabled(
        &mut self,
        name: &str,
        enabled: bool,
    ) -> Result<ConnectionStatus, AgentError> {
        let config = self
            .servers
            .get_mut(name)
            .ok_or_else(|| AgentError::UnknownServer(name.to_string()))?;
        config.enabled = enabled;

        if !enabled {
            self.supervisor.remove(name).await;
            return Ok(ConnectionStatus::Closed);
        }

        let config = config.clone();
        self.supervisor.add(name, config).await;
        Ok(self
            .supervisor
            .wait_settled(name)
            .await
            .unwrap_or(ConnectionStatus::Closed))
    }

    /// Configured servers with their current connection status.
    #[must_use]
    pub fn servers(&self) -> Vec<ServerSummary> {
        let statuses = self.supervisor.statuses();
        self.servers
            .iter()
            .map(|(name, config)| ServerSummary {
                name: name.clone(),
                title: config.title.clone(),
                description: config.description.clone(),
                enabled: config.enabled,
                status: statuses.get(name).cloned(),
                tools: self
                    .supervisor
                    .catalog()
                    .tools_for(name)
                    .into_iter()
                    .map(|t| t.name)
                    .collect(),
            })
            .collect()
    }

    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Interrupt any running turn and close every connection.
    pub async fn shutdown(self) {
        self.interrupter.interrupt();
        self.supervisor.shutdown().await;
        tracing::info!(session_id = %self.id, "Chat session closed");
    }
}
