use std::sync::Arc;

use parley_ai::{Message, ToolDefinition};
use serde_json::Value;
use tracing::debug;

use crate::types::{AssistantProfile, SessionEpoch};

/// Inputs available to prompt extensions when the prompt is assembled.
pub struct PromptContext<'a> {
    pub epoch: &'a SessionEpoch,
    pub assistant: &'a AssistantProfile,
    pub tools: &'a [ToolDefinition],
}

/// Contributes a fragment to the system prompt. Fragments are computed when
/// the prompt is built, so they see the state of the world at submission.
pub trait PromptExtension: Send + Sync {
    /// Lower values are placed first.
    fn priority(&self) -> i32;

    fn fragment(&self, context: &PromptContext<'_>) -> Option<String>;
}

pub struct FnPromptExtension<F> {
    priority: i32,
    render: F,
}

impl<F> PromptExtension for FnPromptExtension<F>
where
    F: Fn(&PromptContext<'_>) -> Option<String> + Send + Sync,
{
    fn priority(&self) -> i32 {
        self.priority
    }

    fn fragment(&self, context: &PromptContext<'_>) -> Option<String> {
        (self.render)(context)
    }
}

pub fn prompt_extension<F>(priority: i32, render: F) -> Arc<dyn PromptExtension>
where
    F: Fn(&PromptContext<'_>) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(FnPromptExtension { priority, render })
}

#[derive(Clone, Default)]
pub struct SystemPromptBuilder {
    extensions: Vec<Arc<dyn PromptExtension>>,
}

impl SystemPromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, extension: Arc<dyn PromptExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn push(&mut self, extension: Arc<dyn PromptExtension>) {
        self.extensions.push(extension);
    }

    pub fn build(&self, context: &PromptContext<'_>) -> String {
        let mut ordered: Vec<&Arc<dyn PromptExtension>> = self.extensions.iter().collect();
        ordered.sort_by_key(|extension| extension.priority());

        let mut sections = Vec::with_capacity(ordered.len() + 1);
        let base = context.assistant.system_prompt.trim();
        if !base.is_empty() {
            sections.push(base.to_string());
        }
        for extension in ordered {
            if let Some(fragment) = extension.fragment(context) {
                let fragment = fragment.trim();
                if !fragment.is_empty() {
                    sections.push(fragment.to_string());
                }
            }
        }
        sections.join("\n\n")
    }
}

/// Re-escapes malformed JSON embedded in tool-call arguments and structured
/// reasoning traces so the provider receives valid payloads.
pub fn sanitize_embedded_json(mut messages: Vec<Message>) -> Vec<Message> {
    let mut repaired = 0usize;
    for message in &mut messages {
        if let Some(calls) = message.tool_calls.as_mut() {
            for call in calls {
                let arguments = &call.function.arguments;
                if !arguments.trim().is_empty() && !is_valid_json(arguments) {
                    call.function.arguments = escape_as_json_string(arguments);
                    repaired += 1;
                }
            }
        }
        if let Some(thinking) = message.thinking.as_mut() {
            let trimmed = thinking.trim_start();
            if (trimmed.starts_with('{') || trimmed.starts_with('[')) && !is_valid_json(thinking) {
                *thinking = escape_as_json_string(thinking);
                repaired += 1;
            }
        }
    }
    if repaired > 0 {
        debug!(repaired, "re-escaped malformed embedded json");
    }
    messages
}

fn is_valid_json(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw).is_ok()
}

fn escape_as_json_string(raw: &str) -> String {
    Value::String(raw.to_string()).to_string()
}
