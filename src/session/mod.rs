//! Chat session management.
//!
//! A [`ChatSession`] ties together everything one user conversation owns:
//! the message history, a private workspace directory, a connection
//! supervisor for the configured tool servers, and the agent loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_agent_loop::session::{ChatSession, UserInput};
//!
//! let mut session = ChatSession::open(options, mcp, driver, connector, observer).await?;
//! let interrupter = session.interrupter();
//! let events = session.start_turn(UserInput::text("List my files")).await;
//! futures::pin_mut!(events);
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! session.shutdown().await;
//! ```

mod chat;

pub use chat::{ChatSession, Interrupter, ServerSummary, SessionOptions, UserInput};
