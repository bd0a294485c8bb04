//! `mcp.json` model and loading.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::error::AgentError;

/// Placeholder replaced with the chat session's workspace directory.
pub const WORKSPACE_PLACEHOLDER: &str = "WORKSPACE";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

/// One configured tool server.
///
/// Immutable once handed to the supervisor; changing it means removing the
/// connection and adding it again.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Display name for the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Initial desired state.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: Transport,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Transport {
    /// Subprocess speaking the protocol over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Streamable HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// In-process table of tools that return fixed text.
    Prompts { prompts: Vec<PromptTool> },
}

/// A tool whose call always returns the same text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PromptTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub text: String,
}

fn default_enabled() -> bool {
    true
}

impl Transport {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Prompts { .. } => "prompts",
        }
    }
}

impl ServerConfig {
    /// Return a copy with `${VAR}` and `${WORKSPACE}` placeholders expanded.
    #[must_use]
    pub fn resolve(&self, workspace: &Path) -> Self {
        let workspace = workspace.display().to_string();
        let lookup = |name: &str| {
            if name == WORKSPACE_PLACEHOLDER {
                Some(workspace.clone())
            } else {
                std::env::var(name).ok()
            }
        };

        let transport = match &self.transport {
            Transport::Stdio {
                command,
                args,
                env,
                cwd,
            } => Transport::Stdio {
                command: expand_placeholders(command, lookup),
                args: args.iter().map(|a| expand_placeholders(a, lookup)).collect(),
                env: expand_map(env, lookup),
                cwd: cwd
                    .as_ref()
                    .map(|c| PathBuf::from(expand_placeholders(&c.to_string_lossy(), lookup))),
            },
            Transport::Http { url, headers } => Transport::Http {
                url: expand_placeholders(url, lookup),
                headers: expand_map(headers, lookup),
            },
            Transport::Prompts { prompts } => Transport::Prompts {
                prompts: prompts.clone(),
            },
        };

        Self {
            transport,
            ..self.clone()
        }
    }

    fn validate(&self, name: &str) -> Result<(), AgentError> {
        match &self.transport {
            Transport::Stdio { command, .. } if command.trim().is_empty() => Err(
                AgentError::Config(format!("server {name}: stdio command is empty")),
            ),
            Transport::Http { url, .. } => url::Url::parse(url)
                .map(|_| ())
                .map_err(|e| AgentError::Config(format!("server {name}: invalid url {url}: {e}"))),
            Transport::Prompts { prompts } => {
                for prompt in prompts {
                    if !is_valid_tool_name(&prompt.name) {
                        return Err(AgentError::Config(format!(
                            "server {name}: invalid prompt tool name {:?}",
                            prompt.name
                        )));
                    }
                }
                Ok(())
            }
            Transport::Stdio { .. } => Ok(()),
        }
    }
}

impl McpConfig {
    /// Names of the servers marked `enabled`, in name order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.mcp_servers.iter().filter(|(_, cfg)| cfg.enabled)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        for (name, cfg) in &self.mcp_servers {
            cfg.validate(name)?;
        }
        Ok(())
    }
}

/// Load and validate `mcp.json`. A missing file is an empty configuration.
pub fn load_mcp_config(path: impl AsRef<Path>) -> Result<McpConfig, AgentError> {
    let path = path.as_ref();
    let txt = match fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No MCP config found, starting without tool servers");
            return Ok(McpConfig::default());
        }
        Err(e) => {
            return Err(AgentError::Config(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    parse_mcp_config(&txt)
}

pub fn parse_mcp_config(txt: &str) -> Result<McpConfig, AgentError> {
    let cfg: McpConfig =
        serde_json::from_str(txt).map_err(|e| AgentError::Config(format!("invalid mcp config: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Tool names the model APIs accept: `^[A-Za-z_][A-Za-z0-9_]*$`.
#[must_use]
pub fn is_valid_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand `${NAME}` placeholders through `lookup`.
/// Unknown names are left unchanged.
pub fn expand_placeholders(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_map(
    map: &BTreeMap<String, String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_placeholders(v, &lookup)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_transports() {
        let cfg = parse_mcp_config(
            r#"{
              "mcpServers": {
                "files": {
                  "transport": "stdio",
                  "command": "uvx",
                  "args": ["mcp-files", "--root", "${WORKSPACE}"],
                  "env": { "TOKEN": "${FILES_TOKEN}" }
                },
                "search": {
                  "transport": "http",
                  "url": "http://localhost:8931/mcp",
                  "enabled": false,
                  "title": "Web search"
                },
                "prompts": {
                  "transport": "prompts",
                  "prompts": [
                    { "name": "translator", "description": "Translation rules", "text": "Translate to French." }
                  ]
                }
              }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.mcp_servers.len(), 3);
        assert!(cfg.mcp_servers["files"].enabled);
        assert!(!cfg.mcp_servers["search"].enabled);
        assert_eq!(cfg.mcp_servers["search"].title.as_deref(), Some("Web search"));
        assert_eq!(cfg.mcp_servers["prompts"].transport.kind(), "prompts");

        let enabled: Vec<_> = cfg.enabled_servers().map(|(n, _)| n.as_str()).collect();
        assert_eq!(enabled, vec!["files", "prompts"]);
    }

    #[test]
    fn rejects_bad_prompt_names() {
        let err = parse_mcp_config(
            r#"{"mcpServers": {"p": {"transport": "prompts", "prompts": [{"name": "1bad", "text": "x"}]}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn rejects_bad_urls() {
        let err = parse_mcp_config(
            r#"{"mcpServers": {"h": {"transport": "http", "url": "not a url"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn placeholders_expand_and_unknown_stay() {
        let lookup = |name: &str| (name == "A").then(|| "1".to_string());
        assert_eq!(expand_placeholders("x${A}y${B}z", lookup), "x1y${B}z");
        assert_eq!(expand_placeholders("tail ${A", lookup), "tail ${A");
        assert_eq!(expand_placeholders("", lookup), "");
    }

    #[test]
    fn resolve_injects_workspace() {
        let cfg = ServerConfig {
            title: None,
            description: None,
            enabled: true,
            transport: Transport::Stdio {
                command: "server".into(),
                args: vec!["--dir".into(), "${WORKSPACE}".into()],
                env: BTreeMap::new(),
                cwd: Some(PathBuf::from("${WORKSPACE}")),
            },
        };
        let resolved = cfg.resolve(Path::new("/tmp/ws"));
        let Transport::Stdio { args, cwd, .. } = resolved.transport else {
            panic!("transport changed");
        };
        assert_eq!(args, vec!["--dir".to_string(), "/tmp/ws".to_string()]);
        assert_eq!(cwd, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn tool_name_rules() {
        assert!(is_valid_tool_name("list_files"));
        assert!(is_valid_tool_name("_x9"));
        assert!(!is_valid_tool_name(""));
        assert!(!is_valid_tool_name("a-b"));
    }
}
