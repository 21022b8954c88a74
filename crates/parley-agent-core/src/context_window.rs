use std::collections::HashSet;

use parley_ai::{ContentBlock, Message, ModelCatalog, Role, ToolCall};
use tracing::{debug, warn};

/// Approximate byte-pair encoding profile. Prose compresses better than
/// punctuation-heavy JSON, so the two are priced separately.
const PROSE_BYTES_PER_TOKEN: f64 = 3.2;
const JSON_BYTES_PER_TOKEN: f64 = 2.8;
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
const TOOL_CALL_OVERHEAD_TOKENS: usize = 10;

pub const DEFAULT_CONTEXT_BUDGET_RATIO: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindowOptions {
    pub provider: String,
    pub model: String,
    pub budget_ratio: f64,
    /// Fixed token budget that bypasses the catalog lookup.
    pub budget_tokens: Option<usize>,
}

impl ContextWindowOptions {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            budget_ratio: DEFAULT_CONTEXT_BUDGET_RATIO,
            budget_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextSelection {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    /// `None` when no budget could be determined and the input passed through.
    pub budget: Option<usize>,
    pub dropped_messages: usize,
    pub dropped_tool_calls: usize,
}

pub fn estimate_tokens(text: &str) -> usize {
    bytes_to_tokens(text.len(), PROSE_BYTES_PER_TOKEN)
}

pub fn estimate_json_tokens(json: &str) -> usize {
    bytes_to_tokens(json.len(), JSON_BYTES_PER_TOKEN)
}

fn bytes_to_tokens(bytes: usize, bytes_per_token: f64) -> usize {
    if bytes == 0 {
        return 0;
    }
    (bytes as f64 / bytes_per_token).ceil() as usize
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS;
    for block in &message.content {
        tokens += match block {
            ContentBlock::Text { text } => estimate_tokens(text),
            ContentBlock::Resource { resource } => estimate_json_tokens(&resource.to_string()),
        };
    }
    if let Some(thinking) = &message.thinking {
        tokens += estimate_tokens(thinking);
    }
    for call in message.tool_calls() {
        tokens += TOOL_CALL_OVERHEAD_TOKENS
            + estimate_tokens(&call.function.name)
            + estimate_json_tokens(&call.function.arguments);
    }
    tokens
}

fn resolve_budget(options: &ContextWindowOptions, catalog: &ModelCatalog) -> Option<usize> {
    if let Some(budget) = options.budget_tokens {
        return Some(budget);
    }
    let spec = catalog.lookup(&options.provider, &options.model)?;
    Some((f64::from(spec.context_window) * options.budget_ratio).floor() as usize)
}

/// Picks the longest suffix of `messages` that fits the model's token budget,
/// then repairs tool-call pairing inside that suffix.
pub fn select_context_window(
    messages: &[Message],
    options: &ContextWindowOptions,
    catalog: &ModelCatalog,
) -> ContextSelection {
    let Some(budget) = resolve_budget(options, catalog) else {
        warn!(
            provider = options.provider.as_str(),
            model = options.model.as_str(),
            "unknown model, context window passed through untrimmed"
        );
        return ContextSelection {
            estimated_tokens: messages.iter().map(estimate_message_tokens).sum(),
            messages: messages.to_vec(),
            budget: None,
            dropped_messages: 0,
            dropped_tool_calls: 0,
        };
    };

    let mut used = 0usize;
    let mut start = messages.len();
    for (index, message) in messages.iter().enumerate().rev() {
        let cost = estimate_message_tokens(message);
        if used + cost > budget {
            break;
        }
        used += cost;
        start = index;
    }

    let trimmed = start;
    let (selected, dropped_messages, dropped_tool_calls) = repair_tool_pairing(&messages[start..]);
    let selection = ContextSelection {
        estimated_tokens: selected.iter().map(estimate_message_tokens).sum(),
        messages: selected,
        budget: Some(budget),
        dropped_messages: trimmed + dropped_messages,
        dropped_tool_calls,
    };

    debug!(
        provider = options.provider.as_str(),
        model = options.model.as_str(),
        budget,
        estimated_tokens = selection.estimated_tokens,
        kept = selection.messages.len(),
        dropped_messages = selection.dropped_messages,
        dropped_tool_calls = selection.dropped_tool_calls,
        "context window selected"
    );
    selection
}

/// Returns the repaired messages plus the number of messages and tool calls
/// removed.
fn repair_tool_pairing(messages: &[Message]) -> (Vec<Message>, usize, usize) {
    let mut repaired = Vec::with_capacity(messages.len());
    let mut dropped_messages = 0usize;
    let mut dropped_calls = 0usize;
    let mut index = 0usize;

    while index < messages.len() {
        let message = &messages[index];
        match message.role {
            Role::Assistant if message.has_tool_calls() => {
                let block_end = messages[index + 1..]
                    .iter()
                    .position(|next| next.role != Role::Tool)
                    .map_or(messages.len(), |offset| index + 1 + offset);
                let results = &messages[index + 1..block_end];
                let answered: HashSet<&str> = results
                    .iter()
                    .filter_map(|result| result.tool_call_id.as_deref())
                    .collect();

                let mut seen_calls: HashSet<&str> = HashSet::new();
                let kept: Vec<ToolCall> = message
                    .tool_calls()
                    .iter()
                    .filter(|call| {
                        answered.contains(call.id.as_str()) && seen_calls.insert(call.id.as_str())
                    })
                    .cloned()
                    .collect();
                dropped_calls += message.tool_calls().len() - kept.len();

                let mut consumed: HashSet<String> = HashSet::new();
                let kept_ids: HashSet<String> = kept.iter().map(|call| call.id.clone()).collect();

                let mut assistant = message.clone();
                assistant.tool_calls = if kept.is_empty() { None } else { Some(kept) };
                if is_blank_assistant(&assistant) {
                    dropped_messages += 1;
                } else {
                    repaired.push(assistant);
                }

                for result in results {
                    let paired = result
                        .tool_call_id
                        .as_ref()
                        .is_some_and(|id| kept_ids.contains(id) && consumed.insert(id.clone()));
                    if paired {
                        repaired.push(result.clone());
                    } else {
                        dropped_messages += 1;
                    }
                }
                index = block_end;
            }
            Role::Tool => {
                dropped_messages += 1;
                index += 1;
            }
            _ => {
                if message.role == Role::Assistant && is_blank_assistant(message) {
                    dropped_messages += 1;
                } else {
                    repaired.push(message.clone());
                }
                index += 1;
            }
        }
    }

    (repaired, dropped_messages, dropped_calls)
}

fn is_blank_assistant(message: &Message) -> bool {
    !message.has_tool_calls() && !message.has_resource() && message.text().trim().is_empty()
}
