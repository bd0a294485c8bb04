//! Model Context Protocol (MCP) client side.
//!
//! Connects to stdio and HTTP-based MCP servers, keeps their tool lists in a
//! single catalog, and routes tool calls to the owning server.
//!
//! # Configuration
//!
//! MCP servers are configured via `mcp.json`:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": {
//!       "transport": "stdio",
//!       "command": "uvx",
//!       "args": ["mcp-server-filesystem", "${WORKSPACE}"]
//!     },
//!     "search": {
//!       "transport": "http",
//!       "url": "https://mcp.tavily.com/mcp/?tavilyApiKey=${TAVILY_API_KEY}",
//!       "enabled": false
//!     },
//!     "prompts": {
//!       "transport": "prompts",
//!       "prompts": [
//!         { "name": "style_guide", "description": "House style", "text": "Use short sentences." }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Namespace
//!
//! Tools keep the names their servers publish. When two servers publish the
//! same name, the [`catalog::CollisionPolicy`] decides: by default the most
//! recently connected server owns it.

pub mod catalog;
pub mod config;
pub mod prompts;
pub mod session;
pub mod supervisor;

pub use catalog::{CollisionPolicy, McpTool, ToolCatalog};
pub use config::{McpConfig, ServerConfig, Transport};
pub use session::{Connector, RootEntry, ToolContent, ToolOutput, ToolSession, TransportConnector};
pub use supervisor::{ConnectionStatus, ConnectionSupervisor, SupervisorSettings};
