//! MCP agent loop
//!
//! A chat agent that streams model output, lets the model call tools hosted
//! on external Model Context Protocol servers, and reports files those tools
//! write into the session workspace.
//!
//! # Architecture
//!
//! - **Connection Supervisor**: one lifecycle task per tool server, add/remove at runtime
//! - **Tool Catalog**: single tool namespace across all connected servers
//! - **Agent Loop**: streamed completions, tool-call reassembly, sequential dispatch
//! - **Side-Effect Watcher**: workspace snapshots around every tool call
//!
//! # Modules
//!
//! - [`llm`]: LLM driver trait, message model and the agent loop
//! - [`mcp`]: MCP client configuration, sessions, catalog and supervisor
//! - [`events`]: Events streamed to the UI during a turn
//! - [`session`]: Chat session management
//! - [`workspace`]: Workspace snapshots and artifact classification

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod mcp;
pub mod observer;
pub mod session;
pub mod telemetry;
pub mod workspace;

pub use error::AgentError;
