use std::collections::{HashMap, HashSet};

use parley_ai::{ContentBlock, FunctionCall, Message, Role, StreamIncrement, ToolCall, ToolCallDelta};

use crate::types::{SessionEpoch, new_message_id, new_tool_call_id, now_millis};

pub const DEFAULT_EMPTY_RESPONSE_PLACEHOLDER: &str =
    "Sorry, I couldn't generate a response. Please try again.";

/// Accumulated state of the assistant message being streamed.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDraft {
    id: String,
    epoch: SessionEpoch,
    assistant_id: Option<String>,
    created_at: i64,
    content: String,
    thinking: String,
    thinking_signature: Option<String>,
    tool_calls: Vec<ToolCall>,
    /// Provider delta index to position in `tool_calls`.
    slots: HashMap<usize, usize>,
}

impl TurnDraft {
    pub fn new(epoch: SessionEpoch, assistant_id: Option<String>) -> Self {
        Self {
            id: new_message_id(),
            epoch,
            assistant_id,
            created_at: now_millis(),
            content: String::new(),
            thinking: String::new(),
            thinking_signature: None,
            tool_calls: vec![],
            slots: HashMap::new(),
        }
    }

    pub fn epoch(&self) -> &SessionEpoch {
        &self.epoch
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    /// Folds one increment into the draft.
    pub fn apply(mut self, increment: &StreamIncrement) -> Self {
        if let Some(delta) = &increment.content {
            self.content.push_str(delta);
        }
        if let Some(delta) = &increment.thinking {
            self.thinking.push_str(delta);
        }
        if let Some(signature) = &increment.thinking_signature {
            self.thinking_signature = Some(signature.clone());
        }
        for delta in &increment.tool_calls {
            self.apply_tool_call_delta(delta);
        }
        self
    }

    fn apply_tool_call_delta(&mut self, delta: &ToolCallDelta) {
        let Some(index) = delta.index else {
            self.tool_calls.push(ToolCall {
                id: delta.id.clone().unwrap_or_default(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: delta.function.name.clone().unwrap_or_default(),
                    arguments: delta.function.arguments.clone().unwrap_or_default(),
                },
            });
            return;
        };

        let position = match self.slots.get(&index) {
            Some(position) => *position,
            None => {
                self.tool_calls.push(ToolCall::new("", "", ""));
                let position = self.tool_calls.len() - 1;
                self.slots.insert(index, position);
                position
            }
        };
        let call = &mut self.tool_calls[position];
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = &delta.function.name {
            call.function.name.push_str(name);
        }
        if let Some(arguments) = &delta.function.arguments {
            call.function.arguments.push_str(arguments);
        }
    }

    /// True once the draft has visible content, a reasoning trace or a tool
    /// call. An empty streaming bubble is never shown.
    pub fn is_displayable(&self) -> bool {
        !self.content.trim().is_empty()
            || !self.thinking.trim().is_empty()
            || self.tool_calls.iter().any(|call| !call.function.name.is_empty())
    }

    /// Streaming view of the draft.
    pub fn snapshot(&self) -> Message {
        let mut message = self.base_message();
        message.is_streaming = true;
        message.tool_calls = (!self.tool_calls.is_empty()).then(|| self.tool_calls.clone());
        message
    }

    /// Final assistant message. Calls without a name are dropped; blank or
    /// repeated ids are replaced with synthesized ones so every call id is
    /// unique within the message.
    pub fn finalize(self, placeholder: &str) -> Message {
        let mut message = self.base_message();
        let mut seen = HashSet::new();
        let calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .filter(|call| !call.function.name.trim().is_empty())
            .map(|mut call| {
                if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
                    call.id = new_tool_call_id();
                    seen.insert(call.id.clone());
                }
                call
            })
            .collect();
        message.tool_calls = (!calls.is_empty()).then_some(calls);
        message.is_streaming = false;
        apply_empty_placeholder(message, placeholder)
    }

    fn base_message(&self) -> Message {
        let content = if self.content.is_empty() {
            vec![]
        } else {
            vec![ContentBlock::text(self.content.clone())]
        };
        let mut message = Message::new(Role::Assistant, content);
        message.id = self.id.clone();
        message.session_id = self.epoch.session_id().to_string();
        message.assistant_id = self.assistant_id.clone();
        message.created_at = self.created_at;
        message.thinking = (!self.thinking.is_empty()).then(|| self.thinking.clone());
        message.thinking_signature = self.thinking_signature.clone();
        message
    }
}

/// Replaces an empty, call-free assistant message with the placeholder text.
/// Applying it twice changes nothing.
pub fn apply_empty_placeholder(mut message: Message, placeholder: &str) -> Message {
    if message.role == Role::Assistant
        && !message.has_tool_calls()
        && !message.has_resource()
        && message.text().trim().is_empty()
    {
        message.content = vec![ContentBlock::text(placeholder)];
    }
    message
}

#[cfg(test)]
mod tests {
    use parley_ai::FunctionDelta;

    use super::*;

    fn draft() -> TurnDraft {
        TurnDraft::new(SessionEpoch::new("S1"), Some("assistant-1".to_string()))
    }

    fn indexed(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> StreamIncrement {
        StreamIncrement::tool_call(ToolCallDelta {
            id: id.map(str::to_string),
            index: Some(index),
            function: FunctionDelta {
                name: name.map(str::to_string),
                arguments: args.map(str::to_string),
            },
        })
    }

    #[test]
    fn content_and_thinking_deltas_append() {
        let draft = draft()
            .apply(&StreamIncrement::thinking("let me "))
            .apply(&StreamIncrement::thinking("think"))
            .apply(&StreamIncrement::content("4"))
            .apply(&StreamIncrement::content("."));

        let snapshot = draft.snapshot();
        assert_eq!(snapshot.text(), "4.");
        assert_eq!(snapshot.thinking.as_deref(), Some("let me think"));
        assert!(snapshot.is_streaming);
        assert_eq!(snapshot.session_id, "S1");
    }

    #[test]
    fn indexed_deltas_accumulate_and_unindexed_deltas_append() {
        let draft = draft()
            .apply(&indexed(0, Some("t1"), Some("calc__add"), Some("{\"a\":")))
            .apply(&indexed(1, Some("t2"), Some("calc__add"), Some("{\"a\":3,")))
            .apply(&indexed(0, None, None, Some("2,\"b\":3}")))
            .apply(&indexed(1, None, None, Some("\"b\":4}")))
            .apply(&StreamIncrement::tool_call(ToolCallDelta {
                id: Some("t3".to_string()),
                index: None,
                function: FunctionDelta {
                    name: Some("clock__now".to_string()),
                    arguments: None,
                },
            }));

        let calls = draft.tool_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.arguments, "{\"a\":2,\"b\":3}");
        assert_eq!(calls[1].function.arguments, "{\"a\":3,\"b\":4}");
        assert_eq!(calls[2].name(), "clock__now");
        assert_eq!(calls[2].function.arguments, "");
    }

    #[test]
    fn displayable_only_after_meaningful_output() {
        let empty = draft().apply(&StreamIncrement::content("  "));
        assert!(!empty.is_displayable());
        assert!(empty.clone().apply(&StreamIncrement::content("hi")).is_displayable());
        assert!(empty.apply(&indexed(0, Some("t1"), Some("calc__add"), None)).is_displayable());
    }

    #[test]
    fn finalize_repairs_blank_ids_and_clears_streaming_flag() {
        let message = draft()
            .apply(&indexed(0, None, Some("calc__add"), Some("{}")))
            .finalize(DEFAULT_EMPTY_RESPONSE_PLACEHOLDER);

        assert!(!message.is_streaming);
        assert_eq!(message.tool_calls().len(), 1);
        assert!(message.tool_calls()[0].id.starts_with("call_"));
        assert!(message.content.is_empty());
    }

    #[test]
    fn sparse_provider_indexes_map_to_compact_slots() {
        let draft = draft()
            .apply(&indexed(4_000_000_000, Some("t1"), Some("calc__add"), Some("{\"a\":1,")))
            .apply(&indexed(7, Some("t2"), Some("calc__add"), Some("{}")))
            .apply(&indexed(4_000_000_000, None, None, Some("\"b\":2}")));

        let calls = draft.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.arguments, "{\"a\":1,\"b\":2}");
        assert_eq!(calls[1].id, "t2");
    }

    #[test]
    fn finalize_gives_repeated_call_ids_fresh_ones() {
        let message = draft()
            .apply(&indexed(0, Some("dup"), Some("calc__add"), Some("{}")))
            .apply(&indexed(1, Some("dup"), Some("calc__add"), Some("{}")))
            .apply(&indexed(2, Some("dup"), Some("calc__add"), Some("{}")))
            .finalize(DEFAULT_EMPTY_RESPONSE_PLACEHOLDER);

        let ids: Vec<&str> = message.tool_calls().iter().map(|call| call.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "dup");
        assert!(ids[1].starts_with("call_"));
        assert!(ids[2].starts_with("call_"));
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn empty_output_gets_placeholder_once() {
        let message = draft().finalize("nothing to say");
        assert_eq!(message.text(), "nothing to say");
        assert!(message.tool_calls.is_none());

        let again = apply_empty_placeholder(message.clone(), "nothing to say");
        assert_eq!(again, message);
    }
}
