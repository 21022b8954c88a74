use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which concrete server answered a resolved tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub server: String,
    pub tool: String,
    pub canonical_name: String,
}

/// Error payload returned by a tool server, in the `{code, message, data}`
/// shape used on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBackendError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

impl ToolBackendError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Display for ToolBackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)?;
        if let Some(data) = &self.data {
            write!(f, ": {data}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolBackendError {}

/// Single capability every tool server exposes. The `Ok` value is the raw
/// server result, usually `{"content": [...]}`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: Value,
    ) -> Result<Value, ToolBackendError>;
}

pub type ToolExecutorRef = Arc<dyn ToolExecutor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Compiled into the host process and namespaced `builtin.`.
    Native,
    /// In-process server reached through the tool protocol.
    Embedded,
    /// External process or network server.
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Embedded => "embedded",
            Self::Remote => "remote",
        }
    }
}

#[derive(Clone)]
pub enum ToolBackend {
    Native(ToolExecutorRef),
    Embedded(ToolExecutorRef),
    Remote(ToolExecutorRef),
}

impl ToolBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Native(_) => BackendKind::Native,
            Self::Embedded(_) => BackendKind::Embedded,
            Self::Remote(_) => BackendKind::Remote,
        }
    }

    pub async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: Value,
    ) -> Result<Value, ToolBackendError> {
        match self {
            Self::Native(executor) | Self::Embedded(executor) | Self::Remote(executor) => {
                executor.execute(invocation, args).await
            }
        }
    }
}

impl std::fmt::Debug for ToolBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

/// Adapts a plain async closure into a [`ToolExecutor`].
pub struct FnToolExecutor<F> {
    handler: F,
}

impl<F, Fut> FnToolExecutor<F>
where
    F: Fn(ToolInvocation, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ToolBackendError>> + Send,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> ToolExecutor for FnToolExecutor<F>
where
    F: Fn(ToolInvocation, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ToolBackendError>> + Send,
{
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: Value,
    ) -> Result<Value, ToolBackendError> {
        (self.handler)(invocation.clone(), args).await
    }
}

pub fn executor_fn<F, Fut>(handler: F) -> ToolExecutorRef
where
    F: Fn(ToolInvocation, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ToolBackendError>> + Send + 'static,
{
    Arc::new(FnToolExecutor::new(handler))
}
