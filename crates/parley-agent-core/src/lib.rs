//! Conversational turn orchestration built on top of `parley-ai`.

mod backends;
mod chat;
mod config;
mod context_window;
mod dispatcher;
mod history;
mod orchestrator;
mod prompt;
mod resolver;
mod sequencer;
mod session_guard;
mod stream_state;
mod types;

pub use backends::{
    BackendKind, FnToolExecutor, INTERNAL_ERROR, INVALID_PARAMS, ToolBackend, ToolBackendError,
    ToolExecutor, ToolExecutorRef, ToolInvocation, executor_fn,
};
pub use chat::{ChatController, ChatSettings, ChatState, SubmitOutcome};
pub use config::{
    CONFIG_FILE_NAME, ConfigError, DEFAULT_CANCELLED_ACKNOWLEDGEMENT, OrchestratorConfig,
    default_config_path, parley_home_dir,
};
pub use context_window::{
    ContextSelection, ContextWindowOptions, DEFAULT_CONTEXT_BUDGET_RATIO, estimate_json_tokens,
    estimate_message_tokens, estimate_tokens, select_context_window,
};
pub use dispatcher::{
    ToolBatchOutcome, ToolScope, execute_tool_batch, execute_tool_call, normalize_result,
};
pub use history::{AssistantRegistry, HistoryStore, InMemoryHistoryStore, StaticAssistantRegistry};
pub use orchestrator::{TurnContext, TurnDeps, run_turn};
pub use prompt::{
    FnPromptExtension, PromptContext, PromptExtension, SystemPromptBuilder, prompt_extension,
    sanitize_embedded_json,
};
pub use resolver::{
    BUILTIN_NAMESPACE, ResolveError, ResolvedTool, SERVER_TOOL_SEPARATOR, ToolRegistry, ToolServer,
    ToolSpec, qualified_name,
};
pub use sequencer::{MessageSequencer, QueuedInput};
pub use session_guard::SessionGuard;
pub use stream_state::{DEFAULT_EMPTY_RESPONSE_PLACEHOLDER, TurnDraft, apply_empty_placeholder};
pub use types::{
    AbortController, AbortSignal, AssistantProfile, SessionEpoch, TurnEvent, TurnEventStream,
    TurnOutcome, turn_event_stream,
};
