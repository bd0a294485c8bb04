//! Per-connection protocol sessions.
//!
//! [`ToolSession`] is the handle the supervisor keeps for a `Ready`
//! connection. [`Connector`] opens sessions; [`TransportConnector`] is the
//! production implementation that speaks MCP over stdio or streamable HTTP
//! through `rmcp`, and serves the in-process prompt table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rmcp::{
    ClientHandler, ErrorData as McpError, ServiceExt,
    model::{
        CallToolRequestParam, ClientCapabilities, ClientInfo, CreateElicitationRequestParam,
        CreateElicitationResult, ElicitationAction, Implementation, ListRootsResult,
        LoggingMessageNotificationParam, ProgressNotificationParam, RawContent, Root,
    },
    service::{NotificationContext, Peer, RequestContext, RoleClient, RunningService, ServiceError},
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::catalog::McpTool;
use super::config::{ServerConfig, Transport};
use super::prompts::PromptToolSession;
use crate::error::AgentError;
use crate::observer::{ElicitDecision, Progress, SessionObserver};

/// One content part of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    /// Non-text content (image, audio, resource); only its kind is kept.
    Other { kind: String },
}

/// Result of a tool call, as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    /// The server marked this result as a tool-side error.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Text parts joined with newlines; other parts are dropped.
    #[must_use]
    pub fn flatten_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Other { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A directory a tool server may operate within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEntry {
    pub uri: String,
    pub name: String,
}

impl RootEntry {
    /// Root for a local directory. `path` should already be absolute.
    pub fn for_directory(path: &Path, name: Option<&str>) -> Result<Self, AgentError> {
        let uri = url::Url::from_directory_path(path)
            .map_err(|()| AgentError::Config(format!("not an absolute path: {}", path.display())))?;
        let name = name.map_or_else(
            || {
                path.file_name()
                    .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
            },
            ToString::to_string,
        );
        Ok(Self {
            uri: uri.as_str().trim_end_matches('/').to_string(),
            name,
        })
    }
}

/// Roots shared by every session of one supervisor. Index 0 is the workspace.
#[derive(Debug, Clone, Default)]
pub struct RootSet(Arc<RwLock<Vec<RootEntry>>>);

impl RootSet {
    #[must_use]
    pub fn new(workspace: RootEntry) -> Self {
        Self(Arc::new(RwLock::new(vec![workspace])))
    }

    pub fn list(&self) -> Vec<RootEntry> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns false if the URI is already present.
    pub fn insert(&self, root: RootEntry) -> bool {
        let mut roots = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if roots.iter().any(|r| r.uri == root.uri) {
            return false;
        }
        roots.push(root);
        true
    }

    /// Returns false if the URI is unknown or is the workspace root.
    pub fn remove(&self, uri: &str) -> bool {
        let mut roots = self.0.write().unwrap_or_else(PoisonError::into_inner);
        match roots.iter().position(|r| r.uri == uri) {
            Some(0) | None => false,
            Some(idx) => {
                roots.remove(idx);
                true
            }
        }
    }
}

/// What a session needs from its owner: who to notify and which roots to expose.
#[derive(Clone)]
pub struct SessionContext {
    pub observer: Arc<dyn SessionObserver>,
    pub roots: RootSet,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

/// Handle to one live, initialized connection.
#[async_trait]
pub trait ToolSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, AgentError>;

    /// Call a tool. Tool-side errors come back as `Ok` with `is_error` set;
    /// `Err` means the call could not be made or the transport failed.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutput, AgentError>;

    /// Tell the server the roots list changed.
    async fn notify_roots_changed(&self) -> Result<(), AgentError>;

    /// Close the transport. Called exactly once, during teardown.
    async fn close(&self);
}

/// Opens a session for a server config: transport plus initialize handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &str,
        config: &ServerConfig,
        context: SessionContext,
    ) -> Result<Arc<dyn ToolSession>, AgentError>;
}

/// Client-side protocol handler for one server.
///
/// Answers roots and elicitation requests and routes notifications to the
/// observer tagged with this server's name.
#[derive(Clone)]
pub struct SessionHandler {
    server: String,
    context: SessionContext,
}

impl std::fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl SessionHandler {
    #[must_use]
    pub fn new(server: impl Into<String>, context: SessionContext) -> Self {
        Self {
            server: server.into(),
            context,
        }
    }
}

impl ClientHandler for SessionHandler {
    fn list_roots(
        &self,
        _context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<ListRootsResult, McpError>> + Send + '_ {
        async move {
            let roots = self
                .context
                .roots
                .list()
                .into_iter()
                .map(|r| Root {
                    uri: r.uri,
                    name: Some(r.name),
                })
                .collect();
            Ok(ListRootsResult { roots })
        }
    }

    fn create_elicitation(
        &self,
        request: CreateElicitationRequestParam,
        _context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<CreateElicitationResult, McpError>> + Send + '_ {
        async move {
            let decision = self
                .context
                .observer
                .on_elicit(&self.server, &request.message)
                .await;
            let action = match decision {
                ElicitDecision::Accept => ElicitationAction::Accept,
                ElicitDecision::Decline => ElicitationAction::Decline,
                ElicitDecision::Cancel => ElicitationAction::Cancel,
            };
            Ok(CreateElicitationResult {
                action,
                content: None,
            })
        }
    }

    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let progress = Progress {
                message: params.message,
                current: params.progress,
                total: params.total,
            };
            self.context
                .observer
                .on_progress(&self.server, &progress)
                .await;
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let level = format!("{:?}", params.level).to_lowercase();
            let text = match params.data {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            self.context
                .observer
                .on_log(&self.server, &level, &text)
                .await;
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            capabilities: ClientCapabilities::builder()
                .enable_roots()
                .enable_roots_list_changed()
                .enable_elicitation()
                .build(),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Live `rmcp` client connection.
pub struct RmcpSession {
    server: String,
    peer: Peer<RoleClient>,
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, SessionHandler>>>,
}

impl std::fmt::Debug for RmcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmcpSession")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl RmcpSession {
    fn new(server: &str, service: RunningService<RoleClient, SessionHandler>) -> Self {
        Self {
            server: server.to_string(),
            peer: service.peer().clone(),
            service: tokio::sync::Mutex::new(Some(service)),
        }
    }

    /// Transport failures mean the connection is gone; everything else is
    /// scoped to the call.
    fn call_error(&self, tool: &str, err: ServiceError) -> AgentError {
        match err {
            ServiceError::TransportClosed | ServiceError::TransportSend(_) => {
                AgentError::connection(&self.server, err)
            }
            other => AgentError::invocation(tool, other),
        }
    }
}

#[async_trait]
impl ToolSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, AgentError> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| AgentError::connection(&self.server, format!("tools/list failed: {e}")))?;

        Ok(tools
            .into_iter()
            .map(|t| McpTool {
                server: self.server.clone(),
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(&*t.input_schema)
                    .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}})),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutput, AgentError> {
        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| self.call_error(name, e))?;

        let content = result
            .content
            .into_iter()
            .map(|c| match c.raw {
                RawContent::Text(t) => ToolContent::Text { text: t.text },
                RawContent::Image(_) => ToolContent::Other {
                    kind: "image".to_string(),
                },
                RawContent::Audio(_) => ToolContent::Other {
                    kind: "audio".to_string(),
                },
                _ => ToolContent::Other {
                    kind: "resource".to_string(),
                },
            })
            .collect();

        Ok(ToolOutput {
            content,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn notify_roots_changed(&self) -> Result<(), AgentError> {
        self.peer
            .notify_roots_list_changed()
            .await
            .map_err(|e| AgentError::connection(&self.server, e))
    }

    async fn close(&self) {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            if let Err(e) = service.cancel().await {
                tracing::warn!(server = %self.server, error = %e, "MCP service did not shut down cleanly");
            }
        }
    }
}

/// Production connector: stdio and HTTP through `rmcp`, prompt tables in process.
#[derive(Debug, Clone, Default)]
pub struct TransportConnector {
    http: reqwest::Client,
}

impl TransportConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn http_client(
        &self,
        server: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<reqwest::Client, AgentError> {
        if headers.is_empty() {
            return Ok(self.http.clone());
        }
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| AgentError::connection(server, format!("invalid header name {k}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|e| AgentError::connection(server, format!("invalid header value for {k}: {e}")))?;
            map.insert(name, value);
        }
        reqwest::Client::builder()
            .default_headers(map)
            .build()
            .map_err(|e| AgentError::connection(server, e))
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        server: &str,
        config: &ServerConfig,
        context: SessionContext,
    ) -> Result<Arc<dyn ToolSession>, AgentError> {
        let handler = SessionHandler::new(server, context);

        let service = match &config.transport {
            Transport::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }
                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }

                let transport = TokioChildProcess::new(cmd)
                    .map_err(|e| AgentError::connection(server, format!("failed to spawn {command}: {e}")))?;
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| AgentError::connection(server, e))?
            }

            Transport::Http { url, headers } => {
                let client = self.http_client(server, headers)?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                );
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| AgentError::connection(server, e))?
            }

            Transport::Prompts { prompts } => {
                return Ok(Arc::new(PromptToolSession::new(server, prompts.clone())));
            }
        };

        tracing::debug!(server = %server, transport = config.transport.kind(), "MCP handshake complete");
        Ok(Arc::new(RmcpSession::new(server, service)))
    }
}
