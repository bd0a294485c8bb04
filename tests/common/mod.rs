//! Fakes for the tool-server and model seams.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcp_agent_loop::error::AgentError;
use mcp_agent_loop::llm::{EventStream, LlmDriver, LlmRequest, StreamEvent};
use mcp_agent_loop::mcp::session::SessionContext;
use mcp_agent_loop::mcp::{
    ConnectionSupervisor, Connector, McpTool, RootEntry, ServerConfig, SupervisorSettings,
    ToolCatalog, ToolOutput, ToolSession, Transport,
};
use mcp_agent_loop::observer::SessionObserver;

// ─────────────────────────────────────────────────────────────────────────────
// Tool servers
// ─────────────────────────────────────────────────────────────────────────────

/// What a fake tool does when called.
#[derive(Debug, Clone)]
pub enum Behavior {
    Text(String),
    /// Returns the arguments object as JSON text.
    Echo,
    /// Result flagged as a tool-side error.
    ToolError(String),
    Slow(Duration, String),
    /// The transport dies during the call.
    TransportFailure,
    /// Writes a few bytes to the path, then returns "written".
    WriteFile(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<(String, Behavior)>,
    pub handshake_error: Option<String>,
    pub handshake_delay: Option<Duration>,
}

impl FakeServer {
    pub fn with_tool(mut self, name: &str, behavior: Behavior) -> Self {
        self.tools.push((name.to_string(), behavior));
        self
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub roots_notifications: AtomicUsize,
}

type Servers = Arc<Mutex<HashMap<String, FakeServer>>>;

#[derive(Debug, Default)]
pub struct FakeConnector {
    servers: Servers,
    pub counters: Arc<Counters>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, server: FakeServer) -> Self {
        self.set(name, server);
        self
    }

    /// Replace a server's script. Live sessions see new tool lists on the next listing.
    pub fn set(&self, name: &str, server: FakeServer) {
        self.servers.lock().unwrap().insert(name.to_string(), server);
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn roots_notifications(&self) -> usize {
        self.counters.roots_notifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        server: &str,
        _config: &ServerConfig,
        _context: SessionContext,
    ) -> Result<Arc<dyn ToolSession>, AgentError> {
        let script = self
            .servers
            .lock()
            .unwrap()
            .get(server)
            .cloned()
            .unwrap_or_default();

        if let Some(delay) = script.handshake_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = script.handshake_error {
            return Err(AgentError::Connection {
                server: server.to_string(),
                reason,
            });
        }

        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            server: server.to_string(),
            servers: Arc::clone(&self.servers),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FakeSession {
    server: String,
    servers: Servers,
    counters: Arc<Counters>,
}

impl FakeSession {
    fn script(&self) -> FakeServer {
        self.servers
            .lock()
            .unwrap()
            .get(&self.server)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolSession for FakeSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, AgentError> {
        Ok(self
            .script()
            .tools
            .into_iter()
            .map(|(name, _)| McpTool {
                server: self.server.clone(),
                description: Some(format!("{name} tool")),
                name,
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutput, AgentError> {
        let behavior = self
            .script()
            .tools
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        match behavior {
            Behavior::Text(text) => Ok(ToolOutput::text(text)),
            Behavior::Echo => Ok(ToolOutput::text(
                serde_json::Value::Object(arguments).to_string(),
            )),
            Behavior::ToolError(text) => Ok(ToolOutput {
                is_error: true,
                ..ToolOutput::text(text)
            }),
            Behavior::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::text(text))
            }
            Behavior::TransportFailure => Err(AgentError::Connection {
                server: self.server.clone(),
                reason: "broken pipe".to_string(),
            }),
            Behavior::WriteFile(path) => {
                tokio::fs::write(&path, [0x89, b'P', b'N', b'G'])
                    .await
                    .map_err(|e| AgentError::ToolInvocation {
                        tool: name.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(ToolOutput::text("written"))
            }
        }
    }

    async fn notify_roots_changed(&self) -> Result<(), AgentError> {
        self.counters.roots_notifications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Config value for fake servers; the fake connector ignores it.
pub fn dummy_config() -> ServerConfig {
    ServerConfig {
        title: None,
        description: None,
        enabled: true,
        transport: Transport::Prompts { prompts: vec![] },
    }
}

pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        startup_timeout: Duration::from_secs(2),
        teardown_timeout: Duration::from_secs(1),
        reuse_grace: Duration::from_millis(10),
    }
}

pub fn supervisor_with(
    connector: Arc<dyn Connector>,
    catalog: Arc<ToolCatalog>,
    observer: Arc<dyn SessionObserver>,
    workspace: &Path,
) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        catalog,
        connector,
        observer,
        RootEntry::for_directory(workspace, Some("user_session_folder")).unwrap(),
        fast_settings(),
    )
}

/// Poll `check` until it holds, for at most one second.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ─────────────────────────────────────────────────────────────────────────────
// Observer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn on_connect(&self, server: &str, tools: &[McpTool]) {
        self.events
            .lock()
            .unwrap()
            .push(format!("connect:{server}:{}", tools.len()));
    }

    async fn on_disconnect(&self, server: &str) {
        self.events.lock().unwrap().push(format!("disconnect:{server}"));
    }

    async fn on_connection_error(&self, server: &str, _error: &AgentError) {
        self.events.lock().unwrap().push(format!("error:{server}"));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum Script {
    Events(Vec<Result<StreamEvent, String>>),
    /// The request itself fails.
    OpenError(String),
    /// Emit the events, then never finish.
    Hang(Vec<StreamEvent>),
}

#[derive(Debug, Default)]
pub struct ScriptedDriver {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedDriver {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmDriver for ScriptedDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        self.requests.lock().unwrap().push(req);
        let script = self.scripts.lock().unwrap().pop_front();

        match script {
            Some(Script::Events(events)) => Ok(Box::pin(futures::stream::iter(
                events
                    .into_iter()
                    .map(|e| e.map_err(|msg| anyhow::anyhow!(msg))),
            ))),
            Some(Script::OpenError(msg)) => Err(anyhow::anyhow!(msg)),
            Some(Script::Hang(events)) => {
                use futures::StreamExt;
                Ok(Box::pin(
                    futures::stream::iter(events.into_iter().map(Ok::<_, anyhow::Error>))
                        .chain(futures::stream::pending()),
                ))
            }
            None => Err(anyhow::anyhow!("no scripted response left")),
        }
    }
}

/// Model response that only says `text`.
pub fn say(text: &str) -> Script {
    Script::Events(vec![
        Ok(StreamEvent::TextDelta {
            text: text.to_string(),
        }),
        Ok(StreamEvent::Done),
    ])
}

/// Model response with one tool call per `(id, name, arguments)`.
pub fn call_tools(calls: &[(Option<&str>, &str, &str)]) -> Script {
    let mut events: Vec<Result<StreamEvent, String>> = calls
        .iter()
        .enumerate()
        .map(|(index, (id, name, arguments))| {
            Ok(StreamEvent::ToolCallDelta {
                index,
                id: id.map(ToString::to_string),
                name: Some((*name).to_string()).filter(|n| !n.is_empty()),
                arguments: Some((*arguments).to_string()),
            })
        })
        .collect();
    events.push(Ok(StreamEvent::Done));
    Script::Events(events)
}
