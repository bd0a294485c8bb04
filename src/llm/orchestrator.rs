//! Agent loop: model streaming and tool dispatch.
//!
//! One turn alternates between two phases:
//! 1. **Responding**: request a completion with the current tool catalog
//!    attached and stream it through the [`ResponseAccumulator`].
//! 2. **ToolDispatch**: run every finished tool call in index order, append
//!    one tool-result message per call, and report workspace side effects.
//!
//! The turn ends when a Responding phase produces no tool calls. A failing
//! tool never ends the turn: its error becomes the tool-result text so the
//! model can react. Only a model stream failure (or the iteration cap)
//! aborts the turn.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(driver, supervisor, AgentSettings::default());
//! let events = orchestrator.run_turn(&mut history, &workspace, CancellationToken::new());
//! futures::pin_mut!(events);
//! while let Some(event) = events.next().await {
//!     println!("{}", event.name());
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AgentError;
use crate::events::TurnEvent;
use crate::mcp::session::ToolOutput;
use crate::mcp::supervisor::ConnectionSupervisor;
use crate::workspace::{self, Artifact, Workspace};

use super::{
    ContentPart, LlmDriver, LlmRequest, Message, PendingCall, ResponseAccumulator, ToolCall,
};

/// Loop behavior knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Upper bound on Responding phases per turn.
    pub max_iterations: u32,
    /// Append images produced by tools to history as a user message.
    #[serde(default)]
    pub fold_images_into_history: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            fold_images_into_history: false,
        }
    }
}

/// Drives turns against one model and one connection supervisor.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    supervisor: Arc<ConnectionSupervisor>,
    settings: AgentSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        driver: Arc<dyn LlmDriver>,
        supervisor: Arc<ConnectionSupervisor>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            driver,
            supervisor,
            settings,
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run one turn over `history`, which must already end with the user's
    /// message. History is appended to as the turn progresses.
    ///
    /// Cancelling `cancel` interrupts the turn: a running tool call resolves
    /// to a "cancelled" tool result, remaining calls of the batch get the
    /// same result, and the model is not asked again.
    #[allow(clippy::too_many_lines)]
    pub fn run_turn<'a>(
        &'a self,
        history: &'a mut Vec<Message>,
        workspace: &'a Workspace,
        cancel: CancellationToken,
    ) -> impl Stream<Item = TurnEvent> + Send + 'a {
        async_stream::stream! {
            let request_id = Uuid::new_v4().to_string();
            tracing::info!(
                request_id = %request_id,
                message_count = history.len(),
                "Starting turn"
            );
            yield TurnEvent::TurnStart { request_id: request_id.clone() };

            let mut iteration: u32 = 0;
            loop {
                if iteration >= self.settings.max_iterations {
                    tracing::error!(
                        request_id = %request_id,
                        iteration,
                        max_iterations = self.settings.max_iterations,
                        "Maximum tool loop iterations exceeded"
                    );
                    yield TurnEvent::Error {
                        message: "Maximum tool loop iterations exceeded".to_string(),
                        code: Some("MAX_ITERATIONS".to_string()),
                    };
                    break;
                }
                iteration += 1;

                let tools = self.supervisor.catalog().snapshot_for_model();
                let tool_choice = (!tools.is_empty()).then(|| "auto".to_string());
                tracing::info!(
                    request_id = %request_id,
                    iteration,
                    message_count = history.len(),
                    tool_count = tools.len(),
                    "Requesting model response"
                );
                let req = LlmRequest {
                    messages: history.clone(),
                    tools,
                    tool_choice,
                };

                let mut driver_stream = match self.driver.stream(req).await {
                    Ok(s) => s,
                    Err(e) => {
                        let e = AgentError::Stream(format!("{e:#}"));
                        tracing::error!(request_id = %request_id, iteration, error = %e, "Failed to open model stream");
                        yield stream_error(&e);
                        break;
                    }
                };

                // Responding
                let mut acc = ResponseAccumulator::new();
                let mut failure = None;
                let mut interrupted = false;
                loop {
                    let step = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        item = driver_stream.next() => Some(item),
                    };
                    match step {
                        None => {
                            interrupted = true;
                            break;
                        }
                        Some(None) => break,
                        Some(Some(Ok(event))) => {
                            if let Some(text) = acc.push(event) {
                                yield TurnEvent::TextDelta { text };
                            }
                            if acc.is_done() {
                                break;
                            }
                        }
                        Some(Some(Err(e))) => {
                            failure = Some(AgentError::Stream(format!("{e:#}")));
                            break;
                        }
                    }
                }
                drop(driver_stream);

                if let Some(e) = failure {
                    tracing::error!(request_id = %request_id, iteration, error = %e, "Model stream failed");
                    yield stream_error(&e);
                    break;
                }

                let response = acc.finish();
                if interrupted {
                    tracing::info!(request_id = %request_id, iteration, "Turn interrupted while responding");
                    if !response.text.is_empty() {
                        history.push(Message::assistant(response.text));
                    }
                    yield TurnEvent::Interrupted;
                    break;
                }

                if response.calls.is_empty() {
                    tracing::info!(
                        request_id = %request_id,
                        iteration,
                        "No tool calls to process, completing turn"
                    );
                    history.push(Message::assistant(response.text));
                    metrics::histogram!("agent_turn_iterations").record(f64::from(iteration));
                    yield TurnEvent::Done;
                    break;
                }

                // ToolDispatch
                let ids = assign_call_ids(history, &response.calls);
                let calls: Vec<ToolCall> = response
                    .calls
                    .iter()
                    .zip(ids)
                    .map(|(c, id)| ToolCall::function(id, c.name.clone(), c.arguments.clone()))
                    .collect();

                tracing::info!(
                    request_id = %request_id,
                    iteration,
                    tool_call_count = calls.len(),
                    "Dispatching tool calls"
                );
                history.push(Message::Assistant {
                    content: (!response.text.is_empty()).then_some(response.text),
                    tool_calls: calls.clone(),
                });

                let mut produced_images: Vec<Artifact> = Vec::new();
                let mut stopped = false;
                for call in &calls {
                    let name = call.function.name.clone();

                    if stopped {
                        let content = AgentError::Interrupted(name.clone()).to_string();
                        history.push(Message::tool_result(call.id.clone(), content.clone()));
                        yield TurnEvent::ToolResult { id: call.id.clone(), name, content, success: false };
                        continue;
                    }

                    yield TurnEvent::ToolCallStarted {
                        id: call.id.clone(),
                        name: name.clone(),
                        arguments: call.function.arguments.clone(),
                    };

                    let before = workspace.snapshot().await;
                    let outcome = self.dispatch(call, &cancel).await;
                    let (content, success) = match outcome {
                        Ok(out) => {
                            tracing::info!(
                                request_id = %request_id,
                                tool_id = %call.id,
                                tool_name = %name,
                                is_error = out.is_error,
                                "Tool call finished"
                            );
                            (out.flatten_text(), !out.is_error)
                        }
                        Err(e) => {
                            tracing::warn!(
                                request_id = %request_id,
                                tool_id = %call.id,
                                tool_name = %name,
                                error = %e,
                                "Tool call failed"
                            );
                            stopped = matches!(e, AgentError::Interrupted(_));
                            (tool_error_text(&name, &e), false)
                        }
                    };

                    history.push(Message::tool_result(call.id.clone(), content.clone()));
                    yield TurnEvent::ToolResult { id: call.id.clone(), name, content, success };

                    let after = workspace.snapshot().await;
                    let changes = workspace::diff(&before, &after);
                    if !changes.is_empty() {
                        let (images, files) = workspace.classify(&changes);
                        if self.settings.fold_images_into_history {
                            produced_images.extend(images.iter().cloned());
                        }
                        yield TurnEvent::ArtifactsProduced { images, files };
                    }
                }

                // Folded after the batch so assistant/tool-result pairs stay contiguous.
                if !produced_images.is_empty() {
                    if let Some(message) = image_message(&produced_images).await {
                        history.push(message);
                    }
                }

                if stopped {
                    tracing::info!(request_id = %request_id, iteration, "Turn interrupted during tool dispatch");
                    yield TurnEvent::Interrupted;
                    break;
                }
            }
        }
    }

    /// Resolve and run one call. Every failure comes back as an error value.
    async fn dispatch(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, AgentError> {
        let name = &call.function.name;
        if name.is_empty() {
            return Err(AgentError::ProtocolViolation(format!(
                "tool call {} has no name",
                call.id
            )));
        }

        let arguments = parse_arguments(name, &call.function.arguments)?;
        let (server, tool) = self.supervisor.catalog().resolve(name)?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AgentError::Interrupted(name.clone())),
            result = self.supervisor.call_tool(&server, &tool.name, arguments) => result,
        }
    }
}

/// One id per call, unique across the whole history.
///
/// The model's id is kept unless it is missing or already taken, in which
/// case `call_{history_len}_{index}` is used instead.
fn assign_call_ids(history: &[Message], calls: &[PendingCall]) -> Vec<String> {
    let mut taken: HashSet<String> = history
        .iter()
        .flat_map(|m| match m {
            Message::Assistant { tool_calls, .. } => {
                tool_calls.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
            }
            Message::Tool { tool_call_id, .. } => vec![tool_call_id.clone()],
            _ => Vec::new(),
        })
        .collect();

    let base = history.len();
    calls
        .iter()
        .enumerate()
        .map(|(i, call)| {
            let id = match &call.id {
                Some(id) if !id.is_empty() && !taken.contains(id) => id.clone(),
                _ => {
                    let mut id = format!("call_{base}_{i}");
                    let mut n = 1;
                    while taken.contains(&id) {
                        id = format!("call_{base}_{i}_{n}");
                        n += 1;
                    }
                    id
                }
            };
            taken.insert(id.clone());
            id
        })
        .collect()
}

/// Accumulated argument text to a JSON object. Empty text is `{}`.
fn parse_arguments(
    tool: &str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(serde_json::Value::Null) => Ok(serde_json::Map::new()),
        Ok(other) => Err(AgentError::invocation(
            tool,
            format!("arguments must be a JSON object, got {other}"),
        )),
        Err(e) => Err(AgentError::invocation(
            tool,
            format!("invalid JSON arguments: {e}"),
        )),
    }
}

fn tool_error_text(name: &str, error: &AgentError) -> String {
    match error {
        AgentError::Interrupted(_) => error.to_string(),
        _ => format!("Error executing tool {name}: {error}"),
    }
}

fn stream_error(error: &AgentError) -> TurnEvent {
    TurnEvent::Error {
        message: error.to_string(),
        code: Some(error.code().to_string()),
    }
}

/// User message carrying tool-produced images as inline data URLs.
async fn image_message(images: &[Artifact]) -> Option<Message> {
    let mut parts = Vec::with_capacity(images.len() + 1);
    let mut names = Vec::with_capacity(images.len());
    for image in images {
        match workspace::data_url(&image.path).await {
            Ok(url) => {
                parts.push(ContentPart::image_url(url));
                names.push(image.name.as_str());
            }
            Err(e) => {
                tracing::warn!(path = %image.path.display(), error = %e, "Could not inline produced image");
            }
        }
    }
    if parts.is_empty() {
        return None;
    }
    parts.insert(
        0,
        ContentPart::text(format!("Images produced by tools: {}", names.join(", "))),
    );
    Some(Message::user(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_parse_to_objects() {
        assert!(parse_arguments("t", "").unwrap().is_empty());
        assert!(parse_arguments("t", "null").unwrap().is_empty());
        assert_eq!(parse_arguments("t", r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(matches!(
            parse_arguments("t", "[1]"),
            Err(AgentError::ToolInvocation { .. })
        ));
        assert!(matches!(
            parse_arguments("t", "{\"a\":"),
            Err(AgentError::ToolInvocation { .. })
        ));
    }

    fn pending(id: Option<&str>) -> PendingCall {
        PendingCall {
            index: 0,
            id: id.map(ToString::to_string),
            name: "t".into(),
            arguments: String::new(),
        }
    }

    #[test]
    fn repeated_model_ids_are_replaced() {
        let history = vec![
            Message::user("hi"),
            Message::Assistant {
                content: None,
                tool_calls: vec![ToolCall::function("call_0", "t", "{}")],
            },
            Message::tool_result("call_0", "ok"),
        ];
        let calls = [pending(Some("call_0")), pending(Some("abc")), pending(Some("abc")), pending(None)];
        assert_eq!(
            assign_call_ids(&history, &calls),
            vec!["call_3_0", "abc", "call_3_2", "call_3_3"]
        );
    }

    #[test]
    fn synthesized_id_skips_one_the_model_already_used() {
        let calls = [pending(Some("call_0_1")), pending(None)];
        assert_eq!(assign_call_ids(&[], &calls), vec!["call_0_1", "call_0_1_1"]);
    }

    #[test]
    fn error_text_formats() {
        let e = AgentError::NotConnected("files".into());
        assert_eq!(
            tool_error_text("list_files", &e),
            "Error executing tool list_files: MCP server files is not connected"
        );
        let e = AgentError::Interrupted("slow".into());
        assert_eq!(tool_error_text("slow", &e), "Tool slow was cancelled by user");
    }
}
