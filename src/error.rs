//! Error taxonomy shared by the supervisor, the tool catalog and the agent loop.
//!
//! Errors are scoped: anything tied to a single tool call is turned into
//! conversation content by the loop, anything tied to a connection stays with
//! that connection, and only [`AgentError::Stream`] ends a whole turn.

/// Errors raised by the tool-server core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// Transport or handshake failure for one server.
    #[error("MCP server {server} connection failed: {reason}")]
    Connection {
        /// Server name.
        server: String,
        /// Human readable cause.
        reason: String,
    },

    /// The target server is not in the `Ready` state.
    #[error("MCP server {0} is not connected")]
    NotConnected(String),

    /// No connected server publishes a tool with this name.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Malformed arguments or a failure reported while running the tool.
    #[error("{reason}")]
    ToolInvocation {
        /// Tool name.
        tool: String,
        /// Human readable cause.
        reason: String,
    },

    /// The running turn was interrupted while the tool was executing.
    #[error("Tool {0} was cancelled by user")]
    Interrupted(String),

    /// The model stream produced something that cannot be dispatched.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The model stream failed; fatal to the current turn only.
    #[error("Model stream failed: {0}")]
    Stream(String),

    /// Registration refused because another server already owns these names.
    #[error("MCP server {server} publishes tools already owned by another server: {}", tools.join(", "))]
    ToolCollision {
        /// Server whose registration was refused.
        server: String,
        /// Conflicting tool names.
        tools: Vec<String>,
    },

    /// The server name is not present in the loaded configuration.
    #[error("Unknown MCP server: {0}")]
    UnknownServer(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Short machine-readable code, used on error events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::ToolInvocation { .. } => "TOOL_INVOCATION",
            Self::Interrupted(_) => "INTERRUPTED",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::Stream(_) => "STREAM",
            Self::ToolCollision { .. } => "TOOL_COLLISION",
            Self::UnknownServer(_) => "UNKNOWN_SERVER",
            Self::Config(_) => "CONFIG",
        }
    }

    pub(crate) fn connection(server: &str, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            server: server.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invocation(tool: &str, reason: impl std::fmt::Display) -> Self {
        Self::ToolInvocation {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }
}
