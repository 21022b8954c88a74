use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use jsonschema::JSONSchema;
use parley_ai::{ContentBlock, ErrorCode, Message, ParleyError, ToolCall};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::backends::{BackendKind, ToolBackendError};
use crate::resolver::{ResolvedTool, ToolRegistry};
use crate::types::{
    SessionEpoch, TurnEvent, TurnEventStream, new_message_id, new_tool_call_id, now_millis,
};

/// Everything a dispatch needs besides the calls themselves.
#[derive(Clone)]
pub struct ToolScope {
    pub epoch: SessionEpoch,
    pub registry: Arc<ToolRegistry>,
    pub allowed_tool_aliases: Option<Vec<String>>,
    pub validate_arguments: bool,
    pub assistant_id: Option<String>,
    pub events: Option<TurnEventStream>,
}

impl ToolScope {
    pub fn new(epoch: SessionEpoch, registry: Arc<ToolRegistry>) -> Self {
        Self {
            epoch,
            registry,
            allowed_tool_aliases: None,
            validate_arguments: true,
            assistant_id: None,
            events: None,
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(events) = &self.events {
            events.push(event);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolBatchOutcome {
    /// One tool message per call, in call order.
    pub results: Vec<Message>,
    pub has_resource: bool,
}

/// Executes every call concurrently. A failing call becomes an error tool
/// message and never affects its siblings.
pub async fn execute_tool_batch(calls: &[ToolCall], scope: &ToolScope) -> ToolBatchOutcome {
    let results = join_all(calls.iter().map(|call| execute_tool_call(call, scope))).await;
    let has_resource = results.iter().any(Message::has_resource);
    ToolBatchOutcome {
        results,
        has_resource,
    }
}

pub async fn execute_tool_call(call: &ToolCall, scope: &ToolScope) -> Message {
    let call_id = if call.id.trim().is_empty() {
        let synthesized = new_tool_call_id();
        warn!(
            tool = call.name(),
            synthesized = synthesized.as_str(),
            "tool call without id, synthesized one"
        );
        synthesized
    } else {
        call.id.clone()
    };

    scope.emit(TurnEvent::ToolExecutionStart {
        epoch: scope.epoch.clone(),
        tool_call_id: call_id.clone(),
        tool_name: call.name().to_string(),
    });

    let started = Instant::now();
    let outcome = run_call(call, scope).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let is_error = outcome.is_err();
    let content = match outcome {
        Ok(content) => {
            info!(
                tool = call.name(),
                tool_call_id = call_id.as_str(),
                duration_ms,
                "tool call completed"
            );
            content
        }
        Err(error) => {
            warn!(
                tool = call.name(),
                tool_call_id = call_id.as_str(),
                duration_ms,
                code = error.code.as_str(),
                error = error.message.as_str(),
                "tool call failed"
            );
            vec![ContentBlock::text(format!("Error: {}", error.message))]
        }
    };

    scope.emit(TurnEvent::ToolExecutionEnd {
        epoch: scope.epoch.clone(),
        tool_call_id: call_id.clone(),
        tool_name: call.name().to_string(),
        duration_ms,
        is_error,
    });

    let mut message = Message::tool_result(call_id, content);
    message.id = new_message_id();
    message.session_id = scope.epoch.session_id().to_string();
    message.assistant_id = scope.assistant_id.clone();
    message.created_at = now_millis();
    message
}

async fn run_call(call: &ToolCall, scope: &ToolScope) -> Result<Vec<ContentBlock>, ParleyError> {
    let resolved = scope.registry.resolve(call.name()).map_err(|error| {
        ParleyError::new(ErrorCode::ToolResolution, error.to_string()).with_details(error.details())
    })?;

    check_access(&resolved, scope.allowed_tool_aliases.as_deref())
        .map_err(|message| ParleyError::new(ErrorCode::ToolAccessDenied, message))?;

    let args = parse_arguments(&call.function.arguments).map_err(|error| {
        ParleyError::validation(format!("Invalid arguments for tool '{}': {error}", call.name()))
    })?;

    if scope.validate_arguments {
        if let Some(schema) = &resolved.input_schema {
            validate_arguments(&resolved.canonical_name, schema, &args)
                .map_err(ParleyError::validation)?;
        }
    }

    let invocation = resolved.invocation();
    let value = resolved
        .backend
        .execute(&invocation, args)
        .await
        .map_err(|error| {
            ParleyError::new(ErrorCode::ToolExecution, error.to_string()).with_details(json!({
                "backend": resolved.kind().as_str(),
                "tool": invocation.canonical_name,
            }))
        })?;
    normalize_result(value).map_err(|message| ParleyError::new(ErrorCode::ToolExecution, message))
}

fn check_access(resolved: &ResolvedTool, allowed: Option<&[String]>) -> Result<(), String> {
    if resolved.kind() != BackendKind::Native {
        return Ok(());
    }
    let (Some(allowed), Some(alias)) = (allowed, resolved.alias.as_deref()) else {
        return Ok(());
    };
    if allowed.iter().any(|entry| entry == alias) {
        return Ok(());
    }
    Err(format!(
        "Access denied: this assistant is not allowed to use '{}' (alias '{alias}')",
        resolved.canonical_name
    ))
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(raw)
}

fn validate_arguments(tool: &str, schema: &Value, args: &Value) -> Result<(), String> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|error| format!("Invalid JSON schema for tool '{tool}': {error}"))?;

    if let Err(errors) = compiled.validate(args) {
        let messages = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect::<Vec<_>>();
        return Err(format!(
            "Validation failed for tool '{tool}': {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Turns a raw backend result into tool message content. Error payloads
/// embedded in an otherwise successful result are surfaced as errors.
pub fn normalize_result(value: Value) -> Result<Vec<ContentBlock>, String> {
    if let Some(error) = value.get("error").filter(|error| error.is_object()) {
        return Err(match serde_json::from_value::<ToolBackendError>(error.clone()) {
            Ok(error) => error.to_string(),
            Err(_) => error.to_string(),
        });
    }

    let Some(items) = value.get("content").and_then(Value::as_array) else {
        return Ok(vec![ContentBlock::text(stringify(&value))]);
    };

    if value.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str))
            .unwrap_or("Tool execution error");
        return Err(message.to_string());
    }

    Ok(items.iter().map(normalize_block).collect())
}

fn normalize_block(item: &Value) -> ContentBlock {
    match item.get("type").and_then(Value::as_str) {
        Some("text") => match item.get("text") {
            Some(Value::String(text)) => ContentBlock::text(text.clone()),
            Some(other) => ContentBlock::text(stringify(other)),
            None => ContentBlock::text(String::new()),
        },
        Some("resource") => {
            let resource = item.get("resource").cloned().unwrap_or_else(|| item.clone());
            if resource.get("mimeType").is_none() {
                warn!("resource block without mimeType");
            }
            ContentBlock::Resource { resource }
        }
        _ => ContentBlock::text(stringify(item)),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_keeps_resources_and_stringifies_other_blocks() {
        let blocks = normalize_result(json!({
            "content": [
                {"type": "text", "text": "5"},
                {"type": "resource", "resource": {"uri": "ui://chart", "mimeType": "text/html"}},
                {"type": "image", "data": "AAAA"}
            ]
        }))
        .expect("normalizes");

        assert_eq!(blocks[0], ContentBlock::text("5"));
        assert_eq!(
            blocks[1],
            ContentBlock::Resource {
                resource: json!({"uri": "ui://chart", "mimeType": "text/html"})
            }
        );
        let ContentBlock::Text { text } = &blocks[2] else {
            panic!("image block should become text");
        };
        assert_eq!(
            serde_json::from_str::<Value>(text).expect("stringified json"),
            json!({"type": "image", "data": "AAAA"})
        );
    }

    #[test]
    fn normalize_stringifies_data_only_results() {
        assert_eq!(
            normalize_result(json!({"sum": 5})).expect("normalizes"),
            vec![ContentBlock::text(r#"{"sum":5}"#)]
        );
        assert_eq!(
            normalize_result(json!("plain")).expect("normalizes"),
            vec![ContentBlock::text("plain")]
        );
    }

    #[test]
    fn normalize_surfaces_embedded_errors() {
        let error = normalize_result(json!({
            "error": {"code": -32602, "message": "missing path"}
        }))
        .expect_err("error payload");
        assert_eq!(error, "missing path (code -32602)");

        let flagged = normalize_result(json!({
            "content": [{"type": "text", "text": "permission denied"}],
            "isError": true
        }))
        .expect_err("isError payload");
        assert_eq!(flagged, "permission denied");
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        assert_eq!(parse_arguments("  ").expect("parses"), json!({}));
        assert!(parse_arguments("{not json").is_err());
    }

    #[test]
    fn schema_validation_reports_failures() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "number"}},
            "required": ["a"]
        });
        assert!(validate_arguments("calc__add", &schema, &json!({"a": 1})).is_ok());
        let error = validate_arguments("calc__add", &schema, &json!({"a": "x"}))
            .expect_err("wrong type");
        assert!(error.starts_with("Validation failed for tool 'calc__add'"));
    }
}
