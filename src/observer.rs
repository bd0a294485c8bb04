//! Typed callbacks from the tool-server core to the UI collaborator.
//!
//! The UI implements [`SessionObserver`] and hands it to the supervisor at
//! construction time. Every method carries the server name so notifications
//! from one server are never attributed to another.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::mcp::catalog::McpTool;

/// Progress notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub message: Option<String>,
    pub current: f64,
    pub total: Option<f64>,
}

/// Answer to a server's elicitation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitDecision {
    Accept,
    Decline,
    Cancel,
}

/// Receives connection lifecycle events and server notifications.
///
/// All methods have no-op defaults; [`SessionObserver::on_elicit`] declines.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// A connection reached `Ready` and its tools are in the catalog.
    async fn on_connect(&self, _server: &str, _tools: &[McpTool]) {}

    /// A connection finished tearing down.
    async fn on_disconnect(&self, _server: &str) {}

    /// A connection failed during the handshake or while live.
    async fn on_connection_error(&self, _server: &str, _error: &AgentError) {}

    async fn on_progress(&self, _server: &str, _progress: &Progress) {}

    async fn on_log(&self, _server: &str, _level: &str, _text: &str) {}

    /// The server asks the user a yes/no/cancel question.
    async fn on_elicit(&self, _server: &str, _prompt: &str) -> ElicitDecision {
        ElicitDecision::Decline
    }
}

/// Observer that ignores everything and declines every elicitation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Observer that writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl SessionObserver for TracingObserver {
    async fn on_connect(&self, server: &str, tools: &[McpTool]) {
        tracing::info!(name: "mcp.server.connected", server = %server, tool_count = tools.len(), "MCP server connected");
        for tool in tools {
            tracing::debug!(name: "mcp.tool.discovered", server = %server, tool = %tool.name, "MCP tool discovered");
        }
    }

    async fn on_disconnect(&self, server: &str) {
        tracing::info!(name: "mcp.server.disconnected", server = %server, "MCP server disconnected");
    }

    async fn on_connection_error(&self, server: &str, error: &AgentError) {
        tracing::error!(name: "mcp.server.failed", server = %server, error = %error, "MCP server connection failed");
    }

    async fn on_progress(&self, server: &str, progress: &Progress) {
        tracing::info!(
            server = %server,
            current = progress.current,
            total = ?progress.total,
            message = progress.message.as_deref().unwrap_or(""),
            "Tool progress"
        );
    }

    async fn on_log(&self, server: &str, level: &str, text: &str) {
        tracing::info!(server = %server, level = %level, "{text}");
    }
}
