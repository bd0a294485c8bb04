//! Aggregated tool namespace across all connected servers.
//!
//! Each server's tool list is stored together with the connection epoch that
//! published it. Epochs grow monotonically across the whole supervisor, so when
//! two servers publish the same tool name the most recently connected one is
//! the current owner. Removing that server makes the older copy visible again.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A tool published by one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    /// Server this tool belongs to
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    /// Input schema (JSON), opaque to the core
    pub input_schema: serde_json::Value,
}

/// What to do when a server publishes a name another server already owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Newest registration owns the name; a warning is logged.
    #[default]
    LastWriterWins,
    /// The second registration fails with [`AgentError::ToolCollision`].
    Reject,
}

#[derive(Debug)]
struct Published {
    epoch: u64,
    tools: Vec<McpTool>,
}

/// Thread-safe tool catalog.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    servers: RwLock<BTreeMap<String, Published>>,
    policy: CollisionPolicy,
}

impl ToolCatalog {
    #[must_use]
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            servers: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    /// Replace `server`'s tool list in one step.
    pub fn register(&self, server: &str, epoch: u64, tools: Vec<McpTool>) -> Result<(), AgentError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);

        let shadowed: Vec<String> = tools
            .iter()
            .filter(|t| {
                servers
                    .iter()
                    .any(|(other, p)| other != server && p.tools.iter().any(|o| o.name == t.name))
            })
            .map(|t| t.name.clone())
            .collect();

        if !shadowed.is_empty() {
            match self.policy {
                CollisionPolicy::Reject => {
                    return Err(AgentError::ToolCollision {
                        server: server.to_string(),
                        tools: shadowed,
                    });
                }
                CollisionPolicy::LastWriterWins => {
                    tracing::warn!(
                        server = %server,
                        tools = ?shadowed,
                        "Tool names collide with another server, newest connection takes precedence"
                    );
                }
            }
        }

        tracing::debug!(server = %server, epoch, tool_count = tools.len(), "Registering tools");
        servers.insert(server.to_string(), Published { epoch, tools });
        Ok(())
    }

    /// Remove every tool owned by `server`.
    pub fn unregister(&self, server: &str) {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        servers.remove(server);
    }

    /// Remove `server`'s tools only if they were published by `epoch`.
    ///
    /// A connection tearing down late must not drop a newer connection's tools.
    pub fn unregister_epoch(&self, server: &str, epoch: u64) {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        if servers.get(server).is_some_and(|p| p.epoch == epoch) {
            servers.remove(server);
        }
    }

    /// Resolve a tool name to its current owner.
    pub fn resolve(&self, tool_name: &str) -> Result<(String, McpTool), AgentError> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        Self::owner(&servers, tool_name)
            .map(|tool| (tool.server.clone(), tool.clone()))
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))
    }

    /// Tools in the form the model API expects: `[{type: "function", function: {...}}]`.
    ///
    /// Ordered by server name, then by each server's published order; shadowed
    /// copies are left out.
    pub fn snapshot_for_model(&self) -> Vec<serde_json::Value> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers
            .values()
            .flat_map(|p| p.tools.iter())
            .filter(|t| Self::owner(&servers, &t.name).is_some_and(|o| o.server == t.server))
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.as_deref().unwrap_or(""),
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect()
    }

    /// Current tools for one server.
    pub fn tools_for(&self, server: &str) -> Vec<McpTool> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.get(server).map(|p| p.tools.clone()).unwrap_or_default()
    }

    pub fn servers(&self) -> Vec<String> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.values().all(|p| p.tools.is_empty())
    }

    pub fn len(&self) -> usize {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.values().map(|p| p.tools.len()).sum()
    }

    fn owner<'a>(servers: &'a BTreeMap<String, Published>, tool_name: &str) -> Option<&'a McpTool> {
        servers
            .values()
            .filter_map(|p| {
                p.tools
                    .iter()
                    .find(|t| t.name == tool_name)
                    .map(|t| (p.epoch, t))
            })
            .max_by_key(|(epoch, _)| *epoch)
            .map(|(_, t)| t)
    }
}
