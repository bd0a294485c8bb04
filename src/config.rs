use crate::llm::{AgentSettings, LlmSettings};
use crate::mcp::{CollisionPolicy, SupervisorSettings};
use crate::session::SessionOptions;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Tool server config (mcp.json)
    #[arg(long, env = "MCP_CONFIG")]
    pub mcp_config: Option<PathBuf>,

    /// Parent directory of per-session workspaces
    #[arg(long, env = "WORKSPACE_DIR")]
    pub workspace: Option<PathBuf>,

    /// Model identifier
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,

    /// Base URL of the Chat Completions API
    #[arg(long, env = "LLM_BASE_URL")]
    pub base_url: Option<String>,

    /// API key for the model endpoint
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Maximum model round trips per turn
    #[arg(long, env = "MAX_ITERATIONS")]
    pub max_iterations: Option<u32>,

    /// Log output format: text or json
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub llm: LlmSettings,
    pub agent: AgentConfig,
    pub workspace: WorkspaceConfig,
    pub mcp: McpSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub fold_images_into_history: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpSettings {
    pub config_path: PathBuf,
    pub startup_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
    pub reuse_grace_ms: u64,
    pub collisions: CollisionPolicy,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Priority: CLI flag > CLI env var > `AGENT_LOOP_*` env > config file > defaults.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("llm.base_url", "https://api.openai.com")?
            .set_default("llm.model", "gpt-4o-mini")?
            .set_default("agent.max_iterations", 10)?
            .set_default("agent.fold_images_into_history", false)?
            .set_default("workspace.root", "workspace")?
            .set_default("mcp.config_path", "mcp.json")?
            .set_default("mcp.startup_timeout_ms", 30_000)?
            .set_default("mcp.teardown_timeout_ms", 5_000)?
            .set_default("mcp.reuse_grace_ms", 100)?
            .set_default("mcp.collisions", "last_writer_wins")?
            .set_default("logging.format", "text")?;

        // 2. Config file: explicit path must exist, ./agent-loop.{yaml,toml,json} may
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::with_name("agent-loop").required(false)),
        };

        // 3. Environment, e.g. AGENT_LOOP_MCP__STARTUP_TIMEOUT_MS=60000
        builder = builder.add_source(
            Environment::with_prefix("AGENT_LOOP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI overrides (clap also fills these from their env vars)
        if let Some(path) = &cli.mcp_config {
            builder = builder.set_override("mcp.config_path", path.display().to_string())?;
        }
        if let Some(dir) = &cli.workspace {
            builder = builder.set_override("workspace.root", dir.display().to_string())?;
        }
        if let Some(model) = cli.model {
            builder = builder.set_override("llm.model", model)?;
        }
        if let Some(url) = cli.base_url {
            builder = builder.set_override("llm.base_url", url)?;
        }
        if let Some(key) = cli.api_key.filter(|k| !k.trim().is_empty()) {
            builder = builder.set_override("llm.api_key", key)?;
        }
        if let Some(n) = cli.max_iterations {
            builder = builder.set_override("agent.max_iterations", n)?;
        }
        if let Some(format) = cli.log_format {
            builder = builder.set_override("logging.format", format.to_lowercase())?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.llm.base_url.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "llm.base_url cannot be empty".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "llm.model cannot be empty".to_string(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(config::ConfigError::Message(
                "agent.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_millis(self.mcp.startup_timeout_ms),
            teardown_timeout: Duration::from_millis(self.mcp.teardown_timeout_ms),
            reuse_grace: Duration::from_millis(self.mcp.reuse_grace_ms),
        }
    }

    #[must_use]
    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_iterations: self.agent.max_iterations,
            fold_images_into_history: self.agent.fold_images_into_history,
        }
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            workspace_root: self.workspace.root.clone(),
            system_prompt: self.agent.system_prompt.clone(),
            agent: self.agent_settings(),
            supervisor: self.supervisor_settings(),
            collisions: self.mcp.collisions,
        }
    }
}
