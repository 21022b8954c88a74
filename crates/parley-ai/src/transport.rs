use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ParleyError;
use crate::event_stream::ChatEventStream;
use crate::types::{Message, ToolDefinition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_retry_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamChatOptions {
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    pub config: TransportConfig,
}

/// Opaque streaming model source. Provider wire formats live behind this.
pub trait ChatTransport: Send + Sync {
    fn stream_chat(
        &self,
        messages: Vec<Message>,
        options: StreamChatOptions,
    ) -> Result<ChatEventStream, ParleyError>;
}

impl<F> ChatTransport for F
where
    F: Fn(Vec<Message>, StreamChatOptions) -> Result<ChatEventStream, ParleyError>
        + Send
        + Sync
        + 'static,
{
    fn stream_chat(
        &self,
        messages: Vec<Message>,
        options: StreamChatOptions,
    ) -> Result<ChatEventStream, ParleyError> {
        (self)(messages, options)
    }
}

pub type ChatTransportRef = Arc<dyn ChatTransport>;
