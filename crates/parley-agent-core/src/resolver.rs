use parley_ai::ToolDefinition;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::backends::{BackendKind, ToolBackend, ToolExecutorRef, ToolInvocation};

pub const BUILTIN_NAMESPACE: &str = "builtin.";
pub const SERVER_TOOL_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolServer {
    pub name: String,
    /// Access-control name checked against an assistant's allow-list.
    pub alias: String,
    pub backend: ToolBackend,
    pub tools: Vec<ToolSpec>,
}

impl ToolServer {
    fn with_backend(name: impl Into<String>, backend: ToolBackend) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            backend,
            tools: vec![],
        }
    }

    pub fn native(name: impl Into<String>, executor: ToolExecutorRef) -> Self {
        Self::with_backend(name, ToolBackend::Native(executor))
    }

    pub fn embedded(name: impl Into<String>, executor: ToolExecutorRef) -> Self {
        Self::with_backend(name, ToolBackend::Embedded(executor))
    }

    pub fn remote(name: impl Into<String>, executor: ToolExecutorRef) -> Self {
        Self::with_backend(name, ToolBackend::Remote(executor))
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn qualified_name(&self, tool: &str) -> String {
        qualified_name(self.kind(), &self.name, tool)
    }
}

pub fn qualified_name(kind: BackendKind, server: &str, tool: &str) -> String {
    match kind {
        BackendKind::Native => format!("{BUILTIN_NAMESPACE}{server}{SERVER_TOOL_SEPARATOR}{tool}"),
        BackendKind::Embedded | BackendKind::Remote => {
            format!("{server}{SERVER_TOOL_SEPARATOR}{tool}")
        }
    }
}

/// A called tool name mapped onto a live server. Recomputed on every
/// dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub backend: ToolBackend,
    pub canonical_name: String,
    pub server: String,
    pub tool: String,
    /// Present for native tools only.
    pub alias: Option<String>,
    pub input_schema: Option<Value>,
}

impl ResolvedTool {
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn invocation(&self) -> ToolInvocation {
        ToolInvocation {
            server: self.server.clone(),
            tool: self.tool.clone(),
            canonical_name: self.canonical_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Tool '{called}' not found. Known tools: {}", known.join(", "))]
    NotFound { called: String, known: Vec<String> },
}

impl ResolveError {
    pub fn details(&self) -> Value {
        match self {
            Self::NotFound { called, known } => json!({ "called": called, "known": known }),
        }
    }
}

/// Registered tool servers in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    servers: Vec<ToolServer>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server, replacing a previous registration of the same name and
    /// kind in place.
    pub fn register(&mut self, server: ToolServer) {
        match self
            .servers
            .iter_mut()
            .find(|existing| existing.name == server.name && existing.kind() == server.kind())
        {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
    }

    pub fn with_server(mut self, server: ToolServer) -> Self {
        self.register(server);
        self
    }

    pub fn servers(&self) -> &[ToolServer] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.iter().all(|server| server.tools.is_empty())
    }

    pub fn known_names(&self) -> Vec<String> {
        self.entries()
            .map(|(server, tool)| server.qualified_name(&tool.name))
            .collect()
    }

    pub fn manifest(&self) -> Vec<ToolDefinition> {
        self.entries()
            .map(|(server, tool)| ToolDefinition {
                name: server.qualified_name(&tool.name),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect()
    }

    fn entries(&self) -> impl Iterator<Item = (&ToolServer, &ToolSpec)> {
        self.servers
            .iter()
            .flat_map(|server| server.tools.iter().map(move |tool| (server, tool)))
    }

    pub fn resolve(&self, called: &str) -> Result<ResolvedTool, ResolveError> {
        if let Some((server, tool)) = self
            .entries()
            .find(|(server, tool)| server.qualified_name(&tool.name) == called)
        {
            debug!(called, "tool resolved by exact name");
            return Ok(resolved(server, &tool.name, Some(tool)));
        }

        if let Some(rest) = called.strip_prefix(BUILTIN_NAMESPACE) {
            if let Some((server_name, tool_name)) = rest.split_once(SERVER_TOOL_SEPARATOR) {
                if let Some(server) = self.servers.iter().find(|server| {
                    server.kind() == BackendKind::Native && server.name == server_name
                }) {
                    debug!(called, "tool resolved by builtin namespace");
                    let spec = server.tools.iter().find(|tool| tool.name == tool_name);
                    return Ok(resolved(server, tool_name, spec));
                }
            }
        }

        for (server, tool) in self.entries() {
            let qualified = server.qualified_name(&tool.name);
            let unprefixed = qualified
                .strip_prefix(BUILTIN_NAMESPACE)
                .unwrap_or(qualified.as_str());
            if unprefixed == called || tool.name == called {
                debug!(called, canonical = qualified.as_str(), "tool resolved by suffix");
                return Ok(resolved(server, &tool.name, Some(tool)));
            }
        }

        Err(ResolveError::NotFound {
            called: called.to_string(),
            known: self.known_names(),
        })
    }
}

fn resolved(server: &ToolServer, tool: &str, spec: Option<&ToolSpec>) -> ResolvedTool {
    ResolvedTool {
        backend: server.backend.clone(),
        canonical_name: server.qualified_name(tool),
        server: server.name.clone(),
        tool: tool.to_string(),
        alias: (server.kind() == BackendKind::Native).then(|| server.alias.clone()),
        input_schema: spec.map(|spec| spec.input_schema.clone()),
    }
}
