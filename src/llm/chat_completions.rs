//! OpenAI Chat Completions API driver.
//!
//! This module implements the [`LlmDriver`] trait for the OpenAI Chat Completions
//! API (`/v1/chat/completions`), turning the SSE response into
//! [`StreamEvent`]s. Tool-call fragments are passed through untouched; the
//! agent loop reassembles them.

use anyhow::Context;
use futures::StreamExt;

use super::{EventStream, LlmDriver, LlmRequest, LlmSettings, StreamEvent};

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": true,
            "messages": req.messages,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools);
            if let Some(choice) = req.tool_choice {
                body["tool_choice"] = serde_json::Value::String(choice);
            }
        }
        if let Some(t) = self.settings.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = self.request_body(req);

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some((pos, delim)) = find_frame_end(&buf) {
                    let frame = buf.drain(..pos + delim).collect::<Vec<_>>();
                    for event in parse_frame(&String::from_utf8_lossy(&frame))? {
                        yield event;
                    }
                }
            }

            // Last frame without a trailing blank line.
            for event in parse_frame(&String::from_utf8_lossy(&buf))? {
                yield event;
            }
        };

        Ok(Box::pin(out))
    }
}

fn sse_data(line: &str) -> Option<&str> {
    line.trim().strip_prefix("data:").map(str::trim)
}

/// Events of one SSE frame. Lines may end in `\n` or `\r\n`.
fn parse_frame(text: &str) -> anyhow::Result<Vec<StreamEvent>> {
    let mut events = Vec::new();
    for line in text.lines() {
        let Some(data) = sse_data(line) else {
            continue;
        };
        if data == "[DONE]" {
            events.push(StreamEvent::Done);
            continue;
        }

        let v: serde_json::Value = serde_json::from_str(data)
            .with_context(|| format!("malformed stream chunk: {data}"))?;
        events.extend(parse_chunk(&v));
    }
    Ok(events)
}

/// Map one `chat.completion.chunk` to stream events.
fn parse_chunk(v: &serde_json::Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let delta = &v["choices"][0]["delta"];

    if let Some(s) = delta.get("content").and_then(|x| x.as_str()) {
        if !s.is_empty() {
            events.push(StreamEvent::TextDelta {
                text: s.to_string(),
            });
        }
    }

    if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
        for (position, tc) in arr.iter().enumerate() {
            let index = tc
                .get("index")
                .and_then(serde_json::Value::as_u64)
                .and_then(|i| usize::try_from(i).ok())
                .unwrap_or(position);
            let function = tc.get("function");
            events.push(StreamEvent::ToolCallDelta {
                index,
                id: tc.get("id").and_then(|x| x.as_str()).map(ToString::to_string),
                name: function
                    .and_then(|f| f.get("name"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string),
                arguments: function
                    .and_then(|f| f.get("arguments"))
                    .and_then(|x| x.as_str())
                    .map(ToString::to_string),
            });
        }
    }

    events
}

/// Position and length of the first frame delimiter (`\n\n` or `\r\n\r\n`).
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_tool_fragments() {
        let chunk = serde_json::json!({
            "choices": [{
                "delta": {
                    "content": "Hi",
                    "tool_calls": [
                        {"index": 1, "id": "call_x", "function": {"name": "list_files", "arguments": "{\"pa"}}
                    ]
                }
            }]
        });

        let events = parse_chunk(&chunk);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "Hi".into() },
                StreamEvent::ToolCallDelta {
                    index: 1,
                    id: Some("call_x".into()),
                    name: Some("list_files".into()),
                    arguments: Some("{\"pa".into()),
                },
            ]
        );
    }

    #[test]
    fn empty_chunk_yields_nothing() {
        let chunk = serde_json::json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        assert!(parse_chunk(&chunk).is_empty());
    }

    #[test]
    fn body_attaches_tools_only_when_present() {
        let driver = ChatCompletionsDriver::new(LlmSettings {
            base_url: "http://localhost".into(),
            api_key: None,
            model: "m".into(),
            temperature: None,
        });

        let bare = driver.request_body(LlmRequest {
            messages: vec![],
            tools: vec![],
            tool_choice: Some("auto".into()),
        });
        assert!(bare.get("tools").is_none());
        assert!(bare.get("tool_choice").is_none());

        let with_tools = driver.request_body(LlmRequest {
            messages: vec![],
            tools: vec![serde_json::json!({"type": "function"})],
            tool_choice: Some("auto".into()),
        });
        assert_eq!(with_tools["tool_choice"], "auto");
        assert_eq!(with_tools["tools"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn crlf_frames_are_split() {
        let body = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        let (pos, delim) = find_frame_end(body).unwrap();
        assert_eq!(delim, 4);

        let first = parse_frame(&String::from_utf8_lossy(&body[..pos + delim])).unwrap();
        assert_eq!(first, vec![StreamEvent::TextDelta { text: "Hi".into() }]);
        let rest = &body[pos + delim..];
        assert_eq!(find_frame_end(rest), Some((rest.len() - 4, 4)));
        assert_eq!(parse_frame(&String::from_utf8_lossy(rest)).unwrap(), vec![StreamEvent::Done]);
    }

    #[test]
    fn earliest_delimiter_wins() {
        assert_eq!(find_frame_end(b"a\n\nb\r\n\r\n"), Some((1, 2)));
        assert_eq!(find_frame_end(b"a\r\n\r\nb\n\n"), Some((1, 4)));
        assert_eq!(find_frame_end(b"data: partial"), None);
    }

    #[test]
    fn unterminated_tail_frame_still_parses() {
        let tail = "data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}";
        assert_eq!(find_frame_end(tail.as_bytes()), None);
        assert_eq!(
            parse_frame(tail).unwrap(),
            vec![StreamEvent::TextDelta { text: "end".into() }]
        );
        assert!(parse_frame("").unwrap().is_empty());
        assert!(parse_frame("data: {not json").is_err());
    }

    #[test]
    fn sse_data_lines() {
        assert_eq!(sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(sse_data(": keep-alive"), None);
    }
}
