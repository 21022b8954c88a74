//! Message model, streaming primitives and transport contract shared by the
//! turn orchestrator.

mod error;
mod event_stream;
mod models;
mod reliable;
mod transport;
mod types;

pub use error::{ErrorCode, ParleyError};
pub use event_stream::{ChatEventStream, ChatStreamEvent, EventStream};
pub use models::{ModelCatalog, ModelSpec};
pub use reliable::{DEFAULT_RETRY_BASE_BACKOFF_MS, DEFAULT_TRANSPORT_RETRY_COUNT, ReliableTransport};
pub use transport::{ChatTransport, ChatTransportRef, StreamChatOptions, TransportConfig};
pub use types::{
    ContentBlock, FunctionCall, FunctionDelta, Message, Role, StreamIncrement, ToolCall,
    ToolCallDelta, ToolDefinition, TurnError,
};
