use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use parley_ai::{Message, ParleyError};

use crate::types::AssistantProfile;

/// Durable message log. Implementations upsert by message id and list a
/// session's messages in insertion order.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, messages: &[Message]) -> Result<(), ParleyError>;

    async fn list(&self, session_id: &str) -> Result<Vec<Message>, ParleyError>;
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Vec<Message>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, messages: &[Message]) -> Result<(), ParleyError> {
        let mut sessions = self.sessions();
        for message in messages {
            if message.session_id.is_empty() {
                return Err(ParleyError::validation(format!(
                    "message '{}' has no session id",
                    message.id
                )));
            }
            let log = sessions.entry(message.session_id.clone()).or_default();
            match log.iter_mut().find(|existing| existing.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => log.push(message.clone()),
            }
        }
        Ok(())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Message>, ParleyError> {
        Ok(self.sessions().get(session_id).cloned().unwrap_or_default())
    }
}

pub trait AssistantRegistry: Send + Sync {
    fn get(&self, assistant_id: &str) -> Option<AssistantProfile>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticAssistantRegistry {
    assistants: HashMap<String, AssistantProfile>,
}

impl StaticAssistantRegistry {
    pub fn new(assistants: impl IntoIterator<Item = AssistantProfile>) -> Self {
        Self {
            assistants: assistants
                .into_iter()
                .map(|assistant| (assistant.id.clone(), assistant))
                .collect(),
        }
    }
}

impl AssistantRegistry for StaticAssistantRegistry {
    fn get(&self, assistant_id: &str) -> Option<AssistantProfile> {
        self.assistants.get(assistant_id).cloned()
    }
}
