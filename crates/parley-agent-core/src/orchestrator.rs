use std::sync::Arc;
use std::time::Instant;

use parley_ai::{
    ChatStreamEvent, ChatTransportRef, ErrorCode, Message, ModelCatalog, ParleyError, Role,
    StreamChatOptions, TransportConfig, TurnError,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::context_window::select_context_window;
use crate::dispatcher::{ToolScope, execute_tool_batch};
use crate::history::HistoryStore;
use crate::prompt::{PromptContext, SystemPromptBuilder, sanitize_embedded_json};
use crate::resolver::ToolRegistry;
use crate::stream_state::TurnDraft;
use crate::types::{
    AbortSignal, AssistantProfile, SessionEpoch, TurnEvent, TurnEventStream, TurnOutcome,
    new_message_id, now_millis, turn_event_stream,
};

/// Everything one exchange needs to know about where it runs.
#[derive(Clone)]
pub struct TurnContext {
    pub epoch: SessionEpoch,
    pub assistant: AssistantProfile,
    pub provider: String,
    pub model: String,
    pub registry: Arc<ToolRegistry>,
    pub signal: AbortSignal,
    /// Set for an explicit user retry. A failure is then reported as
    /// `RetryFailed`.
    pub is_retry: bool,
    /// Per-request bound for transport retries. `None` keeps the transport's
    /// own policy.
    pub transport_retry_count: Option<usize>,
}

/// Long-lived collaborators shared by every turn.
pub struct TurnDeps {
    pub transport: ChatTransportRef,
    pub history: Arc<dyn HistoryStore>,
    pub catalog: ModelCatalog,
    pub prompt: SystemPromptBuilder,
    pub config: OrchestratorConfig,
}

impl TurnDeps {
    pub fn new(
        transport: ChatTransportRef,
        history: Arc<dyn HistoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            transport,
            history,
            catalog: config.model_catalog(),
            prompt: SystemPromptBuilder::new(),
            config,
        }
    }

    /// Same as [`TurnDeps::new`] but wraps the transport with the configured
    /// retry policy.
    pub fn reliable(
        transport: ChatTransportRef,
        history: Arc<dyn HistoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let transport: ChatTransportRef = Arc::new(config.reliable_transport(transport));
        Self::new(transport, history, config)
    }

    pub fn with_prompt_builder(mut self, prompt: SystemPromptBuilder) -> Self {
        self.prompt = prompt;
        self
    }
}

/// Runs one exchange, including tool follow-ups, on a spawned task. The
/// returned stream resolves to the [`TurnOutcome`].
pub fn run_turn(input: Vec<Message>, context: TurnContext, deps: Arc<TurnDeps>) -> TurnEventStream {
    let stream = turn_event_stream();
    let task_stream = stream.clone();
    tokio::spawn(async move {
        TurnRunner::new(context, deps, task_stream).run(input).await;
    });
    stream
}

struct TurnRunner {
    context: TurnContext,
    deps: Arc<TurnDeps>,
    stream: TurnEventStream,
    persisted: Vec<Message>,
    submitted_count: usize,
}

struct PreparedRequest {
    messages: Vec<Message>,
    options: StreamChatOptions,
}

enum StreamedResponse {
    Finalized(Message),
    Cancelled,
    Failed {
        error: ParleyError,
        partial: Option<Message>,
    },
}

impl TurnRunner {
    fn new(context: TurnContext, deps: Arc<TurnDeps>, stream: TurnEventStream) -> Self {
        Self {
            context,
            deps,
            stream,
            persisted: vec![],
            submitted_count: 0,
        }
    }

    async fn run(mut self, input: Vec<Message>) {
        let started = Instant::now();
        self.stream.push(TurnEvent::TurnStart {
            epoch: self.context.epoch.clone(),
        });

        let outcome = self.drive(input).await;
        let status = match &outcome {
            TurnOutcome::Completed { .. } => "completed",
            TurnOutcome::Failed { .. } => "failed",
            TurnOutcome::Cancelled { .. } => "cancelled",
        };
        info!(
            session = self.context.epoch.session_id(),
            provider = self.context.provider.as_str(),
            model = self.context.model.as_str(),
            status,
            persisted = outcome.persisted().len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "turn finished"
        );

        self.stream.push(TurnEvent::TurnEnd {
            epoch: self.context.epoch.clone(),
            outcome: outcome.clone(),
        });
        self.stream.end(Some(outcome));
    }

    async fn drive(&mut self, input: Vec<Message>) -> TurnOutcome {
        let mut pending = input;
        loop {
            if self.context.signal.is_aborted() {
                return self.cancelled();
            }

            let request = match self.submit(pending).await {
                Ok(request) => request,
                Err(error) => return self.failed(error),
            };

            let assistant = match self.stream_response(request).await {
                StreamedResponse::Finalized(message) => message,
                StreamedResponse::Cancelled => return self.cancelled(),
                StreamedResponse::Failed { error, partial } => {
                    return self.failed_with_partial(error, partial);
                }
            };

            if let Err(error) = self.persist(vec![assistant.clone()]).await {
                return self.failed(error);
            }
            if !assistant.has_tool_calls() {
                return self.completed();
            }

            let scope = self.tool_scope();
            let signal = self.context.signal.clone();
            let batch = tokio::select! {
                biased;
                _ = signal.cancelled() => return self.cancelled(),
                batch = execute_tool_batch(assistant.tool_calls(), &scope) => batch,
            };
            if self.context.signal.is_aborted() {
                return self.cancelled();
            }

            if batch.has_resource && self.deps.config.short_circuit_resource_results {
                debug!(
                    session = self.context.epoch.session_id(),
                    results = batch.results.len(),
                    "resource result ends the exchange"
                );
                if let Err(error) = self.persist(batch.results).await {
                    return self.failed(error);
                }
                return self.completed();
            }

            pending = batch.results;
        }
    }

    /// Validates and persists new input, then assembles the request from the
    /// stored history.
    async fn submit(&mut self, pending: Vec<Message>) -> Result<PreparedRequest, ParleyError> {
        let session_id = self.context.epoch.session_id().to_string();
        if session_id.trim().is_empty() {
            return Err(ParleyError::validation("no active session"));
        }
        let mut stamped = Vec::with_capacity(pending.len());
        for message in pending {
            stamped.push(self.stamp(message)?);
        }
        if !stamped.is_empty() {
            self.persist(stamped).await?;
        }

        let history = self.deps.history.list(&session_id).await.map_err(persistence_error)?;
        let options = self
            .deps
            .config
            .context_window_options(&self.context.provider, &self.context.model);
        let selection = select_context_window(&history, &options, &self.deps.catalog);
        let messages = sanitize_embedded_json(selection.messages);
        self.submitted_count = messages.len();

        let tools = self.context.registry.manifest();
        let system_prompt = self.deps.prompt.build(&PromptContext {
            epoch: &self.context.epoch,
            assistant: &self.context.assistant,
            tools: &tools,
        });

        debug!(
            session = session_id.as_str(),
            messages = messages.len(),
            tools = tools.len(),
            estimated_tokens = selection.estimated_tokens,
            "submitting turn"
        );
        Ok(PreparedRequest {
            messages,
            options: StreamChatOptions {
                system_prompt,
                tools,
                config: TransportConfig {
                    provider: self.context.provider.clone(),
                    model: self.context.model.clone(),
                    transport_retry_count: self.context.transport_retry_count,
                },
            },
        })
    }

    fn stamp(&self, mut message: Message) -> Result<Message, ParleyError> {
        if message.role == Role::Tool
            && message
                .tool_call_id
                .as_deref()
                .map_or(true, |id| id.trim().is_empty())
        {
            return Err(ParleyError::validation("tool message is missing tool_call_id"));
        }
        if !message.session_id.is_empty() && message.session_id != self.context.epoch.session_id() {
            return Err(ParleyError::validation(format!(
                "message belongs to session '{}', not '{}'",
                message.session_id, self.context.epoch
            )));
        }
        message.session_id = self.context.epoch.session_id().to_string();
        if message.id.is_empty() {
            message.id = new_message_id();
        }
        if message.created_at == 0 {
            message.created_at = now_millis();
        }
        if message.role != Role::User && message.assistant_id.is_none() {
            message.assistant_id = Some(self.context.assistant.id.clone());
        }
        message.is_streaming = false;
        Ok(message)
    }

    async fn stream_response(&mut self, request: PreparedRequest) -> StreamedResponse {
        let chat = match self
            .deps
            .transport
            .stream_chat(request.messages, request.options)
        {
            Ok(chat) => chat,
            Err(error) => {
                return StreamedResponse::Failed {
                    error,
                    partial: None,
                };
            }
        };

        let signal = self.context.signal.clone();
        let mut draft = TurnDraft::new(
            self.context.epoch.clone(),
            Some(self.context.assistant.id.clone()),
        );
        loop {
            let event = tokio::select! {
                biased;
                _ = signal.cancelled() => return StreamedResponse::Cancelled,
                event = chat.next() => event,
            };
            match event {
                Some(ChatStreamEvent::Increment(increment)) => {
                    draft = draft.apply(&increment);
                    if draft.is_displayable() {
                        self.stream.push(TurnEvent::DraftUpdated {
                            epoch: self.context.epoch.clone(),
                            draft: draft.snapshot(),
                        });
                    }
                }
                Some(ChatStreamEvent::Done) => break,
                Some(ChatStreamEvent::Error(error)) => {
                    return StreamedResponse::Failed {
                        error,
                        partial: draft.is_displayable().then(|| draft.snapshot()),
                    };
                }
                None => {
                    return StreamedResponse::Failed {
                        error: ParleyError::new(
                            ErrorCode::Protocol,
                            "model stream ended without a terminal event",
                        ),
                        partial: draft.is_displayable().then(|| draft.snapshot()),
                    };
                }
            }
        }

        StreamedResponse::Finalized(draft.finalize(&self.deps.config.empty_response_placeholder))
    }

    async fn persist(&mut self, messages: Vec<Message>) -> Result<(), ParleyError> {
        self.deps
            .history
            .append(&messages)
            .await
            .map_err(persistence_error)?;
        for message in messages {
            self.stream.push(TurnEvent::MessagePersisted {
                epoch: self.context.epoch.clone(),
                message: message.clone(),
            });
            self.persisted.push(message);
        }
        Ok(())
    }

    fn tool_scope(&self) -> ToolScope {
        ToolScope {
            epoch: self.context.epoch.clone(),
            registry: self.context.registry.clone(),
            allowed_tool_aliases: self.context.assistant.allowed_tool_aliases.clone(),
            validate_arguments: self.deps.config.validate_tool_arguments,
            assistant_id: Some(self.context.assistant.id.clone()),
            events: Some(self.stream.clone()),
        }
    }

    fn completed(&mut self) -> TurnOutcome {
        TurnOutcome::Completed {
            messages: std::mem::take(&mut self.persisted),
        }
    }

    fn cancelled(&mut self) -> TurnOutcome {
        let mut acknowledgement = Message::system_text(&self.deps.config.cancelled_acknowledgement);
        acknowledgement.id = new_message_id();
        acknowledgement.session_id = self.context.epoch.session_id().to_string();
        acknowledgement.created_at = now_millis();
        debug!(session = self.context.epoch.session_id(), "turn cancelled");
        TurnOutcome::Cancelled {
            acknowledgement,
            messages: std::mem::take(&mut self.persisted),
        }
    }

    fn failed(&mut self, error: ParleyError) -> TurnOutcome {
        self.failed_with_partial(error, None)
    }

    fn failed_with_partial(&mut self, error: ParleyError, partial: Option<Message>) -> TurnOutcome {
        let error = self.classify(error);
        warn!(
            session = self.context.epoch.session_id(),
            code = error.error_type.as_str(),
            error = error.display_message.as_str(),
            partial = partial.is_some(),
            "turn failed"
        );
        let partial = partial.map(|mut message| {
            message.is_streaming = false;
            message.error = Some(error.clone());
            message
        });
        TurnOutcome::Failed {
            error,
            messages: std::mem::take(&mut self.persisted),
            partial,
        }
    }

    fn classify(&self, error: ParleyError) -> TurnError {
        let error_type = if self.context.is_retry {
            ErrorCode::RetryFailed
        } else {
            error.code
        };
        let mut details = json!({
            "provider": self.context.provider,
            "model": self.context.model,
            "messageCount": self.submitted_count,
            "code": error.code.as_str(),
        });
        if let (Some(object), Some(source)) = (details.as_object_mut(), error.details) {
            object.insert("source".to_string(), source);
        }
        TurnError {
            display_message: error.message,
            error_type,
            recoverable: error_type.is_recoverable(),
            details,
        }
    }
}

fn persistence_error(error: ParleyError) -> ParleyError {
    if error.code == ErrorCode::Persistence {
        return error;
    }
    ParleyError {
        code: ErrorCode::Persistence,
        message: format!("history store failed: {}", error.message),
        details: Some(json!({ "code": error.code.as_str() })),
    }
}
