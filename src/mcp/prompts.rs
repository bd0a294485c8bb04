//! In-process tool server backed by a table of fixed texts.
//!
//! Goes through the same supervisor, catalog and dispatch path as a remote
//! server; calling one of its tools returns the configured text.

use async_trait::async_trait;

use super::catalog::McpTool;
use super::config::PromptTool;
use super::session::{ToolOutput, ToolSession};
use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct PromptToolSession {
    server: String,
    prompts: Vec<PromptTool>,
}

impl PromptToolSession {
    #[must_use]
    pub fn new(server: impl Into<String>, prompts: Vec<PromptTool>) -> Self {
        Self {
            server: server.into(),
            prompts,
        }
    }
}

#[async_trait]
impl ToolSession for PromptToolSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, AgentError> {
        Ok(self
            .prompts
            .iter()
            .map(|p| McpTool {
                server: self.server.clone(),
                name: p.name.clone(),
                description: Some(p.description.clone()),
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolOutput, AgentError> {
        self.prompts
            .iter()
            .find(|p| p.name == name)
            .map(|p| ToolOutput::text(p.text.clone()))
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
    }

    async fn notify_roots_changed(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_static_text() {
        let session = PromptToolSession::new(
            "prompts",
            vec![PromptTool {
                name: "style_guide".into(),
                description: "House style".into(),
                text: "Use short sentences.".into(),
            }],
        );

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server, "prompts");

        let out = session
            .call_tool("style_guide", serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(out.flatten_text(), "Use short sentences.");

        let err = session.call_tool("missing", serde_json::Map::new()).await;
        assert!(matches!(err, Err(AgentError::ToolNotFound(_))));
    }
}
