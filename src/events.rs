//! Events streamed to the UI during a turn.
//!
//! # Event Types
//!
//! The [`TurnEvent`] enum covers:
//! - Turn lifecycle (start, done, interrupted, error)
//! - Assistant text deltas
//! - Tool call lifecycle (started, result)
//! - Files produced by tools
//!
//! # Example
//!
//! ```rust
//! use mcp_agent_loop::events::TurnEvent;
//!
//! let event = TurnEvent::TextDelta {
//!     text: "Hello".to_string(),
//! };
//! assert_eq!(event.name(), "message.delta");
//! let json = serde_json::to_string(&event).unwrap();
//! assert!(json.contains("message.delta"));
//! ```

use serde::{Deserialize, Serialize};

use crate::workspace::Artifact;

/// Events emitted by the agent loop for one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum TurnEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Turn Lifecycle
    // ─────────────────────────────────────────────────────────────────────
    /// A new turn started.
    #[serde(rename = "turn.start")]
    TurnStart {
        /// Unique identifier for this turn.
        request_id: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Message Content
    // ─────────────────────────────────────────────────────────────────────
    /// Incremental text delta from the assistant's response.
    #[serde(rename = "message.delta")]
    TextDelta {
        /// The text fragment to append.
        text: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Tool Calls
    // ─────────────────────────────────────────────────────────────────────
    /// A tool call is about to be dispatched.
    #[serde(rename = "tool_call.started")]
    ToolCallStarted {
        /// Tool call ID.
        id: String,
        /// Tool/function name.
        name: String,
        /// Raw arguments JSON as the model produced it.
        arguments: String,
    },

    /// Result of a tool call, as appended to history.
    #[serde(rename = "tool_result")]
    ToolResult {
        /// Tool call ID this result corresponds to.
        id: String,
        /// Tool/function name.
        name: String,
        /// Flattened text content.
        content: String,
        /// Whether the tool execution succeeded.
        success: bool,
    },

    /// Files a tool created or modified in the workspace.
    #[serde(rename = "artifacts")]
    ArtifactsProduced {
        /// Inline-displayable images.
        images: Vec<Artifact>,
        /// Other downloadable files.
        files: Vec<Artifact>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Errors and Completion
    // ─────────────────────────────────────────────────────────────────────
    /// The turn failed; history holds everything up to the failure.
    #[serde(rename = "error")]
    Error {
        /// Error message.
        message: String,
        /// Optional error code for programmatic handling.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// The user interrupted the turn.
    #[serde(rename = "interrupted")]
    Interrupted,

    /// The model produced a final answer with no further tool calls.
    #[serde(rename = "done")]
    Done,
}

impl TurnEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn.start",
            Self::TextDelta { .. } => "message.delta",
            Self::ToolCallStarted { .. } => "tool_call.started",
            Self::ToolResult { .. } => "tool_result",
            Self::ArtifactsProduced { .. } => "artifacts",
            Self::Error { .. } => "error",
            Self::Interrupted => "interrupted",
            Self::Done => "done",
        }
    }

    /// Whether this event ends the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Interrupted | Self::Done)
    }
}
