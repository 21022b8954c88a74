use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parley_ai::{EventStream, Message, TurnError};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Identity of the conversation a piece of asynchronous work belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionEpoch(String);

impl SessionEpoch {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self(session_id.into())
    }

    pub fn session_id(&self) -> &str {
        &self.0
    }
}

impl Display for SessionEpoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only view of an assistant as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssistantProfile {
    pub id: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Builtin tool aliases this assistant may call. `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tool_aliases: Option<Vec<String>>,
}

impl AssistantProfile {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt: system_prompt.into(),
            allowed_tool_aliases: None,
        }
    }

    pub fn with_allowed_tool_aliases(mut self, aliases: Vec<String>) -> Self {
        self.allowed_tool_aliases = Some(aliases);
        self
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(AbortInner {
                    aborted: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.signal.inner.aborted.store(true, Ordering::SeqCst);
        self.signal.inner.notify.notify_waiters();
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The exchange ran to a response without tool calls, or stopped on a
    /// resource result. `messages` lists everything persisted by this run.
    Completed { messages: Vec<Message> },
    Failed {
        error: TurnError,
        messages: Vec<Message>,
        /// Unfinished assistant reply carrying `error`. Never persisted.
        partial: Option<Message>,
    },
    Cancelled {
        acknowledgement: Message,
        messages: Vec<Message>,
    },
}

impl TurnOutcome {
    pub fn persisted(&self) -> &[Message] {
        match self {
            Self::Completed { messages }
            | Self::Failed { messages, .. }
            | Self::Cancelled { messages, .. } => messages,
        }
    }

    pub fn error(&self) -> Option<&TurnError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TurnStart {
        epoch: SessionEpoch,
    },
    /// Live view of the streaming assistant message. Only emitted once the
    /// draft has something worth showing.
    DraftUpdated {
        epoch: SessionEpoch,
        draft: Message,
    },
    MessagePersisted {
        epoch: SessionEpoch,
        message: Message,
    },
    ToolExecutionStart {
        epoch: SessionEpoch,
        tool_call_id: String,
        tool_name: String,
    },
    ToolExecutionEnd {
        epoch: SessionEpoch,
        tool_call_id: String,
        tool_name: String,
        duration_ms: u64,
        is_error: bool,
    },
    TurnEnd {
        epoch: SessionEpoch,
        outcome: TurnOutcome,
    },
}

impl TurnEvent {
    pub fn epoch(&self) -> &SessionEpoch {
        match self {
            Self::TurnStart { epoch }
            | Self::DraftUpdated { epoch, .. }
            | Self::MessagePersisted { epoch, .. }
            | Self::ToolExecutionStart { epoch, .. }
            | Self::ToolExecutionEnd { epoch, .. }
            | Self::TurnEnd { epoch, .. } => epoch,
        }
    }
}

pub type TurnEventStream = EventStream<TurnEvent, TurnOutcome>;

pub fn turn_event_stream() -> TurnEventStream {
    EventStream::new(|event: &TurnEvent| match event {
        TurnEvent::TurnEnd { outcome, .. } => Some(outcome.clone()),
        _ => None,
    })
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn new_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
