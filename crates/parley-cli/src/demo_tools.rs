use parley_agent_core::{
    ToolBackendError, ToolInvocation, ToolRegistry, ToolServer, ToolSpec, executor_fn,
};
use serde_json::{Value, json};

/// Tool servers available to the offline CLI: a native calculator and an
/// embedded renderer that answers with a UI resource.
pub fn demo_registry() -> ToolRegistry {
    let calc = executor_fn(|invocation: ToolInvocation, args: Value| async move {
        let a = number_arg(&args, "a")?;
        let b = number_arg(&args, "b")?;
        let value = match invocation.tool.as_str() {
            "add" => a + b,
            "multiply" => a * b,
            other => {
                return Err(ToolBackendError::invalid_params(format!(
                    "unknown calc operation '{other}'"
                )));
            }
        };
        Ok::<Value, ToolBackendError>(json!({
            "content": [{"type": "text", "text": value.to_string()}]
        }))
    });

    let render = executor_fn(|_invocation: ToolInvocation, args: Value| async move {
        let title = args
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Untitled");
        Ok::<Value, ToolBackendError>(json!({
            "content": [
                {"type": "text", "text": format!("Rendered card '{title}'.")},
                {"type": "resource", "resource": {
                    "uri": "ui://card/demo",
                    "mimeType": "text/html",
                    "text": format!("<h1>{title}</h1>")
                }}
            ]
        }))
    });

    let operands = json!({
        "type": "object",
        "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
        "required": ["a", "b"]
    });
    ToolRegistry::new()
        .with_server(
            ToolServer::native("calc", calc)
                .with_alias("calc")
                .with_tool(ToolSpec::new("add", "Add two numbers", operands.clone()))
                .with_tool(ToolSpec::new("multiply", "Multiply two numbers", operands)),
        )
        .with_server(ToolServer::embedded("ui", render).with_tool(ToolSpec::new(
            "card",
            "Render a titled card",
            json!({"type": "object", "properties": {"title": {"type": "string"}}}),
        )))
}

fn number_arg(args: &Value, name: &str) -> Result<f64, ToolBackendError> {
    args.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolBackendError::invalid_params(format!("'{name}' must be a number")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_agent_core::{SessionEpoch, ToolScope, execute_tool_call};
    use parley_ai::ToolCall;

    use super::*;

    #[tokio::test]
    async fn calculator_resolves_with_and_without_namespace() {
        let scope = ToolScope::new(SessionEpoch::new("S1"), Arc::new(demo_registry()));

        let full = execute_tool_call(
            &ToolCall::new("t1", "builtin.calc__add", r#"{"a":2,"b":3}"#),
            &scope,
        )
        .await;
        assert_eq!(full.text(), "5");

        let bare = execute_tool_call(&ToolCall::new("t2", "multiply", r#"{"a":4,"b":2.5}"#), &scope)
            .await;
        assert_eq!(bare.text(), "10");
    }

    #[tokio::test]
    async fn card_returns_resource_block() {
        let scope = ToolScope::new(SessionEpoch::new("S1"), Arc::new(demo_registry()));
        let result =
            execute_tool_call(&ToolCall::new("c1", "ui__card", r#"{"title":"Q3"}"#), &scope).await;
        assert!(result.has_resource());
        assert_eq!(result.text(), "Rendered card 'Q3'.");
    }
}
