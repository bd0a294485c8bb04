//! MCP agent loop
//!
//! Interactive terminal chat. Type a message to run a turn, Ctrl-C to
//! interrupt a running turn. Slash commands:
//!
//! - `/servers`: list configured tool servers and their status
//! - `/enable <name>` / `/disable <name>`: connect or disconnect a server
//! - `/attach <path>`: attach a file to the next message
//! - `/quit`: close all connections and exit

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::map_err_ignore)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unused_async)]
#![allow(clippy::match_same_arms)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use mcp_agent_loop::config::AppConfig;
use mcp_agent_loop::events::TurnEvent;
use mcp_agent_loop::llm::ChatCompletionsDriver;
use mcp_agent_loop::mcp::TransportConnector;
use mcp_agent_loop::mcp::config::load_mcp_config;
use mcp_agent_loop::observer::TracingObserver;
use mcp_agent_loop::session::{ChatSession, UserInput};
use mcp_agent_loop::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let config = AppConfig::load().context("Configuration error")?;
    telemetry::init(config.logging.format);

    info!(
        name: "llm.config.loaded",
        base_url = %config.llm.base_url,
        model = %config.llm.model,
        "LLM configuration loaded"
    );

    let mcp = load_mcp_config(&config.mcp.config_path)?;
    info!(
        name: "mcp.config.loaded",
        path = %config.mcp.config_path.display(),
        server_count = mcp.mcp_servers.len(),
        "MCP configuration loaded"
    );

    let driver = Arc::new(ChatCompletionsDriver::new(config.llm.clone()));
    let mut session = ChatSession::open(
        config.session_options(),
        mcp,
        driver,
        Arc::new(TransportConnector::new()),
        Arc::new(TracingObserver),
    )
    .await?;

    let interrupter = session.interrupter();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupter.interrupt();
        }
    });

    print_servers(&session);
    println!("Workspace: {}", session.workspace().dir().display());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut attachments: Vec<PathBuf> = Vec::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/servers", _) => print_servers(&session),
            ("/enable", name) | ("/disable", name) if !name.trim().is_empty() => {
                let enabled = line.starts_with("/enable");
                match session.set_connection_enabled(name.trim(), enabled).await {
                    Ok(status) => println!("{}: {status:?}", name.trim()),
                    Err(e) => eprintln!("{e}"),
                }
            }
            ("/attach", path) if !path.trim().is_empty() => {
                attachments.push(PathBuf::from(path.trim()));
                println!("Attached {} file(s) to the next message", attachments.len());
            }
            _ => {
                let input = UserInput {
                    text: line.to_string(),
                    attachments: std::mem::take(&mut attachments),
                };
                run_turn(&mut session, input).await?;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn run_turn(session: &mut ChatSession, input: UserInput) -> std::io::Result<()> {
    let events = session.start_turn(input).await;
    futures::pin_mut!(events);

    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::TurnStart { .. } => {}
            TurnEvent::TextDelta { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            TurnEvent::ToolCallStarted {
                name, arguments, ..
            } => writeln!(stdout, "\n[tool] {name} {arguments}")?,
            TurnEvent::ToolResult {
                name,
                content,
                success,
                ..
            } => {
                let marker = if success { "ok" } else { "failed" };
                writeln!(stdout, "[tool] {name} {marker}: {}", preview(&content))?;
            }
            TurnEvent::ArtifactsProduced { images, files } => {
                for artifact in images.iter().chain(&files) {
                    writeln!(stdout, "[file] {}", artifact.path.display())?;
                }
            }
            TurnEvent::Error { message, .. } => writeln!(stdout, "\n[error] {message}")?,
            TurnEvent::Interrupted => writeln!(stdout, "\n[interrupted]")?,
            TurnEvent::Done => writeln!(stdout)?,
        }
    }
    Ok(())
}

fn print_servers(session: &ChatSession) {
    for server in session.servers() {
        let title = server.title.as_deref().unwrap_or(&server.name);
        let status = server
            .status
            .map_or_else(|| "disabled".to_string(), |s| format!("{s:?}"));
        println!("  {} ({title}): {status}", server.name);
        if !server.tools.is_empty() {
            println!("      tools: {}", server.tools.join(", "));
        }
    }
}

fn preview(content: &str) -> String {
    const LIMIT: usize = 200;
    match content.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &content[..idx]),
        None => content.to_string(),
    }
}
