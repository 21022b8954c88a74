use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use clap::{Args, Parser, Subcommand};
use parley_agent_core::{
    AssistantProfile, AssistantRegistry, ChatController, ChatSettings, HistoryStore,
    InMemoryHistoryStore, OrchestratorConfig, StaticAssistantRegistry, SubmitOutcome, TurnDeps,
    TurnOutcome, default_config_path, parley_home_dir,
};
use parley_ai::{ChatTransportRef, Message};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod demo_tools;
mod script;

use script::ScriptedTransport;

const DEFAULT_ASSISTANT_ID: &str = "default";
const RESTRICTED_ASSISTANT_ID: &str = "restricted";

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "parley conversational turn runner")]
struct Cli {
    #[arg(long, global = true)]
    conf_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<RootCommand>,
    #[command(flatten)]
    chat: ChatArgs,
}

#[derive(Subcommand, Debug, Clone)]
enum RootCommand {
    Chat(ChatArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Args, Debug, Clone)]
struct ChatArgs {
    #[arg(long, default_value = "cli")]
    session: String,
    #[arg(long, default_value = "openai")]
    provider: String,
    #[arg(long, default_value = "gpt-4o")]
    model: String,
    #[arg(long, default_value = DEFAULT_ASSISTANT_ID)]
    assistant: String,
    #[arg(long)]
    system_prompt: Option<String>,
    /// JSON file of scripted model replies.
    #[arg(long)]
    script: Option<PathBuf>,
    #[arg(long = "prompt")]
    prompts: Vec<String>,
    #[arg(long, default_value_t = false)]
    no_tools: bool,
    /// Overrides the configured transport retry count for this chat.
    #[arg(long)]
    retries: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let conf_dir = cli.conf_dir.clone();
    init_tracing(conf_dir.as_deref());

    let result = match cli.command {
        Some(RootCommand::Chat(args)) => run_chat(args, conf_dir.as_deref()).await,
        Some(RootCommand::Config) => print_config(conf_dir.as_deref()),
        None => run_chat(cli.chat, conf_dir.as_deref()).await,
    };

    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing(conf_dir: Option<&Path>) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let log_dir = parley_home_dir(conf_dir);
    if let Err(error) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warning: failed to create log dir {}: {error}",
            log_dir.display()
        );
        return;
    }

    let appender = tracing_appender::rolling::never(&log_dir, "parley.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = TRACE_GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init();
}

fn load_config(conf_dir: Option<&Path>) -> Result<OrchestratorConfig, String> {
    let path = default_config_path(conf_dir);
    OrchestratorConfig::load(&path).map_err(|error| error.to_string())
}

fn print_config(conf_dir: Option<&Path>) -> Result<(), String> {
    let config = load_config(conf_dir)?;
    let rendered = serde_json::to_string_pretty(&json!({
        "path": default_config_path(conf_dir).display().to_string(),
        "config": config,
    }))
    .map_err(|error| format!("render config failed: {error}"))?;
    println!("{rendered}");
    Ok(())
}

fn assistants(system_prompt: Option<&str>) -> StaticAssistantRegistry {
    let prompt = system_prompt.unwrap_or("You are a concise, helpful assistant.");
    StaticAssistantRegistry::new([
        AssistantProfile::new(DEFAULT_ASSISTANT_ID, prompt),
        AssistantProfile::new(RESTRICTED_ASSISTANT_ID, prompt).with_allowed_tool_aliases(vec![]),
    ])
}

fn build_controller(
    args: &ChatArgs,
    config: OrchestratorConfig,
) -> Result<(ChatController, Arc<InMemoryHistoryStore>), String> {
    let assistant = assistants(args.system_prompt.as_deref())
        .get(&args.assistant)
        .ok_or_else(|| format!("unknown assistant '{}'", args.assistant))?;

    let transport: ChatTransportRef = match &args.script {
        Some(path) => Arc::new(ScriptedTransport::load(path)?),
        None => Arc::new(ScriptedTransport::default()),
    };
    let history = Arc::new(InMemoryHistoryStore::new());
    let store: Arc<dyn HistoryStore> = history.clone();
    let deps = TurnDeps::reliable(transport, store, config);

    let mut settings = ChatSettings::new(assistant, &args.provider, &args.model);
    if !args.no_tools {
        settings = settings.with_registry(demo_tools::demo_registry());
    }
    if let Some(retries) = args.retries {
        settings = settings.with_transport_retry_count(retries);
    }
    Ok((ChatController::new(Arc::new(deps), settings), history))
}

async fn run_chat(args: ChatArgs, conf_dir: Option<&Path>) -> Result<(), String> {
    let config = load_config(conf_dir)?;
    let (controller, _history) = build_controller(&args, config)?;
    controller
        .switch_session(Some(args.session.clone()))
        .await
        .map_err(|error| error.to_string())?;
    info!(
        session = args.session.as_str(),
        provider = args.provider.as_str(),
        model = args.model.as_str(),
        "chat started"
    );

    if !args.prompts.is_empty() {
        for prompt in &args.prompts {
            handle_line(&controller, prompt).await?;
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|error| format!("read stdin failed: {error}"))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        handle_line(&controller, line).await?;
    }
    Ok(())
}

/// Runs one input line. Lines starting with `/` are controller commands.
async fn handle_line(controller: &ChatController, line: &str) -> Result<(), String> {
    if let Some(session) = line.strip_prefix("/session ") {
        controller
            .switch_session(Some(session.trim().to_string()))
            .await
            .map_err(|error| error.to_string())?;
        for message in controller.state().messages {
            print_message(&message)?;
        }
        return Ok(());
    }

    match line {
        "/retry" => match controller.retry().await {
            Ok(outcome) => print_outcome(&outcome),
            Err(error) => print_json(&json!({ "error": error })),
        },
        "/dismiss" => {
            controller.dismiss_error();
            Ok(())
        }
        "/state" => {
            let state = controller.state();
            print_json(&json!({
                "session": state.session.as_ref().map(|epoch| epoch.session_id()),
                "messages": state.messages.len(),
                "isStreaming": state.is_streaming,
                "queued": state.queued,
                "error": state.error,
            }))
        }
        _ => match controller.submit_text(line).await {
            Ok(SubmitOutcome::Finished(outcome)) => print_outcome(&outcome),
            Ok(SubmitOutcome::Queued { position }) => print_json(&json!({ "queued": position })),
            Err(error) => print_json(&json!({ "error": error })),
        },
    }
}

fn print_outcome(outcome: &TurnOutcome) -> Result<(), String> {
    for message in outcome.persisted() {
        print_message(message)?;
    }
    match outcome {
        TurnOutcome::Completed { .. } => Ok(()),
        TurnOutcome::Failed { error, partial, .. } => {
            if let Some(partial) = partial {
                print_message(partial)?;
            }
            print_json(&json!({ "turnError": error }))
        }
        TurnOutcome::Cancelled {
            acknowledgement, ..
        } => print_message(acknowledgement),
    }
}

fn print_message(message: &Message) -> Result<(), String> {
    print_json(&serde_json::to_value(message).map_err(|error| error.to_string())?)
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    let line = serde_json::to_string(value).map_err(|error| error.to_string())?;
    println!("{line}");
    Ok(())
}
