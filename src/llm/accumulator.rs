//! Reassembly of a streamed model response.
//!
//! Tool-call fragments are keyed by the stream-assigned index, not by id:
//! providers interleave several calls and only send the id once. Names
//! overwrite, argument fragments append, and the finished calls come out in
//! ascending index order no matter how the indices arrived.

use std::collections::BTreeMap;

use super::StreamEvent;

#[derive(Debug, Default, Clone)]
struct Fragment {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// A finished tool call request. Arguments are still raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub index: usize,
    pub id: Option<String>,
    /// Empty when the stream never named the call.
    pub name: String,
    pub arguments: String,
}

/// Everything the model produced in one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedResponse {
    pub text: String,
    pub calls: Vec<PendingCall>,
}

#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    text: String,
    calls: BTreeMap<usize, Fragment>,
    done: bool,
}

impl ResponseAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns the text to forward for live display.
    pub fn push(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::TextDelta { text } => {
                if text.is_empty() {
                    return None;
                }
                self.text.push_str(&text);
                Some(text)
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let fragment = self.calls.entry(index).or_default();
                if let Some(id) = id.filter(|id| !id.is_empty()) {
                    fragment.id = Some(id);
                }
                if let Some(name) = name.filter(|name| !name.is_empty()) {
                    fragment.name = name;
                }
                if let Some(arguments) = arguments {
                    fragment.arguments.push_str(&arguments);
                }
                None
            }
            StreamEvent::Done => {
                self.done = true;
                None
            }
        }
    }

    /// Whether the stream signalled the end of the response.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    #[must_use]
    pub fn finish(self) -> AccumulatedResponse {
        AccumulatedResponse {
            text: self.text,
            calls: self
                .calls
                .into_iter()
                .map(|(index, f)| PendingCall {
                    index,
                    id: f.id,
                    name: f.name,
                    arguments: f.arguments,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: usize, name: Option<&str>, arguments: Option<&str>) -> StreamEvent {
        StreamEvent::ToolCallDelta {
            index,
            id: None,
            name: name.map(ToString::to_string),
            arguments: arguments.map(ToString::to_string),
        }
    }

    #[test]
    fn out_of_order_indices_come_back_sorted() {
        let mut acc = ResponseAccumulator::new();
        acc.push(delta(2, Some("third"), Some("{\"c\":")));
        acc.push(delta(0, Some("first"), Some("{")));
        acc.push(delta(2, None, Some("3}")));
        acc.push(delta(1, Some("second"), Some("{}")));
        acc.push(delta(0, None, Some("}")));
        acc.push(StreamEvent::Done);

        let out = acc.finish();
        let summary: Vec<_> = out
            .calls
            .iter()
            .map(|c| (c.index, c.name.as_str(), c.arguments.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![(0, "first", "{}"), (1, "second", "{}"), (2, "third", "{\"c\":3}")]
        );
    }

    #[test]
    fn text_is_forwarded_and_buffered() {
        let mut acc = ResponseAccumulator::new();
        assert_eq!(acc.push(StreamEvent::TextDelta { text: "Hel".into() }), Some("Hel".into()));
        assert_eq!(acc.push(StreamEvent::TextDelta { text: String::new() }), None);
        assert_eq!(acc.push(StreamEvent::TextDelta { text: "lo".into() }), Some("lo".into()));
        assert!(!acc.is_done());
        acc.push(StreamEvent::Done);
        assert!(acc.is_done());

        let out = acc.finish();
        assert_eq!(out.text, "Hello");
        assert!(out.calls.is_empty());
    }

    #[test]
    fn name_overwrites_and_id_is_kept() {
        let mut acc = ResponseAccumulator::new();
        acc.push(StreamEvent::ToolCallDelta {
            index: 0,
            id: Some("call_a".into()),
            name: Some("draft".into()),
            arguments: None,
        });
        acc.push(StreamEvent::ToolCallDelta {
            index: 0,
            id: Some(String::new()),
            name: Some("final".into()),
            arguments: Some("{}".into()),
        });

        let call = &acc.finish().calls[0];
        assert_eq!(call.id.as_deref(), Some("call_a"));
        assert_eq!(call.name, "final");
    }

    #[test]
    fn unnamed_call_is_kept_with_empty_name() {
        let mut acc = ResponseAccumulator::new();
        acc.push(delta(0, None, Some("{}")));
        let out = acc.finish();
        assert_eq!(out.calls.len(), 1);
        assert!(out.calls[0].name.is_empty());
    }
}
