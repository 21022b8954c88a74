use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use parley_ai::{Message, ParleyError, TurnError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::orchestrator::{TurnContext, TurnDeps, run_turn};
use crate::resolver::ToolRegistry;
use crate::sequencer::MessageSequencer;
use crate::session_guard::SessionGuard;
use crate::types::{AssistantProfile, SessionEpoch, TurnEvent, TurnOutcome};

#[derive(Clone)]
pub struct ChatSettings {
    pub assistant: AssistantProfile,
    pub provider: String,
    pub model: String,
    pub registry: Arc<ToolRegistry>,
    pub transport_retry_count: Option<usize>,
}

impl ChatSettings {
    pub fn new(
        assistant: AssistantProfile,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            assistant,
            provider: provider.into(),
            model: model.into(),
            registry: Arc::new(ToolRegistry::new()),
            transport_retry_count: None,
        }
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Bounds transport retries for every turn of this chat.
    pub fn with_transport_retry_count(mut self, retries: usize) -> Self {
        self.transport_retry_count = Some(retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatState {
    pub session: Option<SessionEpoch>,
    pub messages: Vec<Message>,
    pub draft: Option<Message>,
    pub error: Option<TurnError>,
    pub is_streaming: bool,
    pub pending_tool_calls: Vec<String>,
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The submission ran as its own turn. Queued input that arrived in the
    /// meantime has been drained as well.
    Finished(TurnOutcome),
    /// A turn was already running; the input waits in the queue.
    Queued { position: usize },
}

struct ChatInner {
    settings: ChatSettings,
    guard: SessionGuard,
    sequencer: MessageSequencer,
    messages: Vec<Message>,
    pending_tool_calls: HashSet<String>,
    retryable: bool,
}

struct TurnRequest {
    epoch: SessionEpoch,
    input: Vec<Message>,
    is_retry: bool,
}

/// Stateful front of the orchestrator: one session at a time, one streaming
/// turn at a time, input arriving mid-turn queued for later.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Mutex<ChatInner>>,
    deps: Arc<TurnDeps>,
    is_running: Arc<AtomicBool>,
    idle_notify: Arc<Notify>,
}

impl ChatController {
    pub fn new(deps: Arc<TurnDeps>, settings: ChatSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChatInner {
                settings,
                guard: SessionGuard::new(None),
                sequencer: MessageSequencer::new(),
                messages: vec![],
                pending_tool_calls: HashSet::new(),
                retryable: false,
            })),
            deps,
            is_running: Arc::new(AtomicBool::new(false)),
            idle_notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChatInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn state(&self) -> ChatState {
        let inner = self.lock();
        let mut pending_tool_calls = inner.pending_tool_calls.iter().cloned().collect::<Vec<_>>();
        pending_tool_calls.sort();
        ChatState {
            session: inner.guard.current().cloned(),
            messages: inner.messages.clone(),
            draft: inner.guard.draft().cloned(),
            error: inner.guard.error().cloned(),
            is_streaming: self.is_running.load(Ordering::SeqCst),
            pending_tool_calls,
            queued: inner.sequencer.len(),
        }
    }

    pub fn set_assistant(&self, assistant: AssistantProfile) {
        self.lock().settings.assistant = assistant;
    }

    pub fn set_model(&self, provider: impl Into<String>, model: impl Into<String>) {
        let mut inner = self.lock();
        inner.settings.provider = provider.into();
        inner.settings.model = model.into();
    }

    pub fn set_registry(&self, registry: ToolRegistry) {
        self.lock().settings.registry = Arc::new(registry);
    }

    /// Activates `session_id` (or no session). In-flight work of the previous
    /// session is aborted and its queue dropped; the transcript is reloaded
    /// from history.
    pub async fn switch_session(&self, session_id: Option<String>) -> Result<(), ParleyError> {
        let epoch = session_id.map(SessionEpoch::new);
        {
            let mut inner = self.lock();
            if !inner.guard.switch_to(epoch.clone()) {
                return Ok(());
            }
            inner.sequencer.clear();
            inner.messages.clear();
            inner.pending_tool_calls.clear();
            inner.retryable = false;
        }

        let Some(epoch) = epoch else {
            return Ok(());
        };
        let transcript = self.deps.history.list(epoch.session_id()).await?;
        let mut inner = self.lock();
        if inner.guard.accepts(&epoch) {
            inner.messages = transcript;
        }
        Ok(())
    }

    pub async fn submit_text(&self, text: &str) -> Result<SubmitOutcome, ParleyError> {
        self.submit(vec![Message::user_text(text)]).await
    }

    pub async fn submit(&self, messages: Vec<Message>) -> Result<SubmitOutcome, ParleyError> {
        if messages.is_empty() {
            return Err(ParleyError::validation("submitted messages cannot be empty"));
        }

        let epoch = {
            let mut inner = self.lock();
            let Some(epoch) = inner.guard.current().cloned() else {
                return Err(ParleyError::validation("no active session"));
            };
            if self
                .is_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                inner.sequencer.enqueue(epoch, messages);
                return Ok(SubmitOutcome::Queued {
                    position: inner.sequencer.len(),
                });
            }
            epoch
        };

        let outcome = self
            .spawn_run(TurnRequest {
                epoch,
                input: messages,
                is_retry: false,
            })
            .await;
        Ok(SubmitOutcome::Finished(outcome))
    }

    /// Re-runs the last failed turn of the active session without new input.
    pub async fn retry(&self) -> Result<TurnOutcome, ParleyError> {
        let epoch = {
            let mut inner = self.lock();
            let Some(epoch) = inner.guard.current().cloned() else {
                return Err(ParleyError::validation("no active session"));
            };
            if !inner.retryable {
                return Err(ParleyError::validation("no failed turn to retry"));
            }
            if self
                .is_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(ParleyError::validation("a turn is already running"));
            }
            inner.guard.dismiss_error();
            epoch
        };

        Ok(self
            .spawn_run(TurnRequest {
                epoch,
                input: vec![],
                is_retry: true,
            })
            .await)
    }

    /// Stops the streaming turn. Persisted input stays; queued input is kept.
    pub fn cancel(&self) -> bool {
        self.lock().guard.abort_in_flight()
    }

    pub fn dismiss_error(&self) -> Option<TurnError> {
        self.lock().guard.dismiss_error()
    }

    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if !self.is_running.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Runs the drain loop on its own task so that dropping the caller's
    /// future never strands the running flag.
    async fn spawn_run(&self, first: TurnRequest) -> TurnOutcome {
        let this = self.clone();
        match tokio::spawn(async move { this.run(first).await }).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(error = %error, "turn task stopped before finishing");
                {
                    let _inner = self.lock();
                    self.is_running.store(false, Ordering::SeqCst);
                }
                self.idle_notify.notify_waiters();
                TurnOutcome::Completed { messages: vec![] }
            }
        }
    }

    /// Runs `first`, then drains queued input one item per idle transition.
    /// Must be entered with the running flag held.
    async fn run(&self, first: TurnRequest) -> TurnOutcome {
        let mut first_outcome = None;
        let mut next = Some(first);

        while let Some(request) = next.take() {
            let outcome = self.run_single(request).await;
            first_outcome.get_or_insert(outcome);

            let mut inner = self.lock();
            let current = inner.guard.current().cloned();
            next = inner
                .sequencer
                .release_next(current.as_ref())
                .map(|item| TurnRequest {
                    epoch: item.epoch,
                    input: item.messages,
                    is_retry: false,
                });
            if next.is_none() {
                self.is_running.store(false, Ordering::SeqCst);
            } else {
                debug!(remaining = inner.sequencer.len(), "draining queued input");
            }
        }

        self.idle_notify.notify_waiters();
        first_outcome.unwrap_or_else(|| TurnOutcome::Completed { messages: vec![] })
    }

    async fn run_single(&self, request: TurnRequest) -> TurnOutcome {
        let context = {
            let mut inner = self.lock();
            if !inner.guard.accepts(&request.epoch) {
                return TurnOutcome::Completed { messages: vec![] };
            }
            inner.pending_tool_calls.clear();
            let signal = inner.guard.begin_turn();
            TurnContext {
                epoch: request.epoch.clone(),
                assistant: inner.settings.assistant.clone(),
                provider: inner.settings.provider.clone(),
                model: inner.settings.model.clone(),
                registry: inner.settings.registry.clone(),
                signal,
                is_retry: request.is_retry,
                transport_retry_count: inner.settings.transport_retry_count,
            }
        };

        let stream = run_turn(request.input, context, self.deps.clone());
        while let Some(event) = stream.next().await {
            self.apply_event(event);
        }
        let outcome = stream.result().await.unwrap_or_else(|| TurnOutcome::Completed {
            messages: vec![],
        });

        let mut inner = self.lock();
        if inner.guard.accepts(&request.epoch) {
            inner.guard.end_turn();
            inner.pending_tool_calls.clear();
            inner.retryable = matches!(outcome, TurnOutcome::Failed { .. });
        }
        outcome
    }

    fn apply_event(&self, event: TurnEvent) {
        let mut inner = self.lock();
        if !inner.guard.accepts(event.epoch()) {
            return;
        }

        match event {
            TurnEvent::TurnStart { .. } => {}
            TurnEvent::DraftUpdated { epoch, draft } => {
                inner.guard.accept_draft(&epoch, draft);
            }
            TurnEvent::MessagePersisted { message, .. } => {
                if inner.guard.draft().is_some_and(|draft| draft.id == message.id) {
                    inner.guard.clear_draft();
                }
                match inner
                    .messages
                    .iter_mut()
                    .find(|existing| existing.id == message.id)
                {
                    Some(existing) => *existing = message,
                    None => inner.messages.push(message),
                }
            }
            TurnEvent::ToolExecutionStart { tool_call_id, .. } => {
                inner.pending_tool_calls.insert(tool_call_id);
            }
            TurnEvent::ToolExecutionEnd { tool_call_id, .. } => {
                inner.pending_tool_calls.remove(&tool_call_id);
            }
            TurnEvent::TurnEnd { epoch, outcome } => {
                inner.guard.clear_draft();
                match outcome {
                    TurnOutcome::Failed { error, .. } => {
                        inner.guard.record_error(&epoch, error);
                    }
                    TurnOutcome::Cancelled {
                        acknowledgement, ..
                    } => inner.messages.push(acknowledgement),
                    TurnOutcome::Completed { .. } => {}
                }
            }
        }
    }
}
