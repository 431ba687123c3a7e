use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;

use triage_core::{
    dotted_patch, parse_config_value, redact_config_secrets, resolve_shared_paths,
    shared_paths_from_root, ArtifactStore, ConfigStore, EngineConfig, EngineError, EventBus,
    Orchestrator, RateLimiter, RequestEngine, Session, SharedPaths, TurnOutcome,
};
use triage_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use triage_providers::ProviderRegistry;
use triage_tools::ToolRegistry;
use triage_types::EngineEvent;

const SUPPORTED_PROVIDER_IDS: [&str; 4] = ["openai", "openrouter", "ollama", "azure"];

const DEFAULT_SYSTEM_PROMPT: &str = "You are a diagnostic assistant for running systems. \
Use the available tools to gather evidence before answering, prefer read-only commands, \
and explain the root cause and a concrete next step once you have enough information.";

#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(about = "Tool-using diagnostic assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct ModelArgs {
    #[arg(long, env = "TRIAGE_API_KEY")]
    api_key: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Project config file layered over the global config.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    max_iterations: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a single question and exit.
    Run {
        prompt: String,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Interactive session; Ctrl-C cancels the running turn.
    Chat {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Execute one tool directly: `{"tool": "...", "args": {...}}`, `-` for stdin or `@file`.
    Tool {
        #[arg(long)]
        json: String,
    },
    /// Inspect or edit the project config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
        #[arg(long, global = true)]
        config: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective config, or each layer with `--layers`. API keys are masked.
    Show {
        #[arg(long)]
        layers: bool,
    },
    /// Set a dotted key in the project file, e.g. `tool_loop.max_iterations 12`.
    Set { key: String, value: String },
}

struct Runtime {
    config: EngineConfig,
    orchestrator: Orchestrator,
    events: EventBus,
    paths: SharedPaths,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_shared_paths()
        .unwrap_or_else(|_| shared_paths_from_root(PathBuf::from(".triage")));
    let logs_dir = canonical_logs_dir_from_root(&paths.root);
    let (_log_guard, log_info) = init_process_logging(ProcessKind::Cli, &logs_dir, 14)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "cli.main",
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("cli logging initialized: {:?}", log_info);

    match cli.command {
        Command::Run { prompt, model } => {
            let runtime = build_runtime(paths, &model).await?;
            let printer = spawn_progress_printer(&runtime.events);
            let mut session = Session::new(system_prompt(&runtime.config));
            let cancel = CancellationToken::new();
            let watcher = watch_ctrl_c(cancel.clone());
            let result = runtime
                .orchestrator
                .run_session_turn(&mut session, &prompt, &cancel)
                .await;
            watcher.abort();
            match result {
                Ok(outcome) => print_answer(&outcome),
                Err(err) if err.is_cancelled() => eprintln!("cancelled"),
                Err(err) => {
                    report_turn_error(&err);
                    return Err(err.into());
                }
            }
            save_session(&runtime.paths, &session).await;
            printer.abort();
        }
        Command::Chat { model } => {
            let runtime = build_runtime(paths, &model).await?;
            let printer = spawn_progress_printer(&runtime.events);
            run_chat(&runtime).await?;
            printer.abort();
        }
        Command::Tool { json } => {
            let config = load_config(&paths, &ModelArgs::default()).await?;
            let tools = ToolRegistry::new(config.tools);
            let payload = read_tool_json(&json)?;
            let tool = payload
                .get("tool")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = payload
                .get("args")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            let result = tools
                .execute_with_cancel(&tool, args, CancellationToken::new())
                .await?;
            let output = serde_json::json!({
                "output": result.output,
                "metadata": result.metadata
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Config { action, config } => {
            let args = ModelArgs {
                config,
                ..ModelArgs::default()
            };
            let store = open_config_store(&paths, &args).await?;
            let mut output = match action {
                ConfigAction::Show { layers: false } => store.get_effective_value().await,
                ConfigAction::Show { layers: true } => serde_json::json!({
                    "paths": {
                        "global": store.global_path().display().to_string(),
                        "project": store.project_path().display().to_string(),
                    },
                    "layers": store.get_layers_value().await,
                }),
                ConfigAction::Set { key, value } => {
                    let patch = dotted_patch(&key, parse_config_value(&value))?;
                    let effective = store.patch_project(patch).await?;
                    eprintln!("updated {} in {}", key, store.project_path().display());
                    effective
                }
            };
            redact_config_secrets(&mut output);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn run_chat(runtime: &Runtime) -> anyhow::Result<()> {
    let mut session = Session::new(system_prompt(&runtime.config));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("triage chat: type a question, `/exit` to quit. Ctrl-C cancels a running turn.");
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if matches!(prompt, "/exit" | "/quit") {
            break;
        }
        let cancel = CancellationToken::new();
        let watcher = watch_ctrl_c(cancel.clone());
        let result = runtime
            .orchestrator
            .run_session_turn(&mut session, prompt, &cancel)
            .await;
        watcher.abort();
        match result {
            Ok(outcome) => print_answer(&outcome),
            Err(err) if err.is_cancelled() => eprintln!("cancelled"),
            Err(err) => {
                report_turn_error(&err);
                eprintln!("error: {err}");
            }
        }
    }
    save_session(&runtime.paths, &session).await;
    Ok(())
}

async fn open_config_store(paths: &SharedPaths, args: &ModelArgs) -> anyhow::Result<ConfigStore> {
    let overrides = build_cli_overrides(
        args.api_key.clone(),
        args.provider.clone(),
        args.model.clone(),
        args.max_iterations,
    )?;
    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.config_path.clone());
    ConfigStore::new(config_path, overrides).await
}

async fn load_config(paths: &SharedPaths, args: &ModelArgs) -> anyhow::Result<EngineConfig> {
    open_config_store(paths, args).await?.get().await
}

async fn build_runtime(paths: SharedPaths, args: &ModelArgs) -> anyhow::Result<Runtime> {
    let config = load_config(&paths, args).await?;
    let provider = normalize_and_validate_provider(args.provider.clone())?;
    let providers = ProviderRegistry::new(config.providers_config());
    let client = providers.select_provider(provider.as_deref())?;
    let client_info = client.info();
    let tools = Arc::new(ToolRegistry::new(config.tools.clone()));
    let events = EventBus::new();

    let requests = RequestEngine::new(
        client,
        Arc::new(RateLimiter::new(config.throttle.policy())),
        config.retry.policy(),
    )
    .with_events(events.clone());
    let artifacts = ArtifactStore::new(config.artifacts.settings(&paths.tool_output_dir));
    let orchestrator = Orchestrator::new(
        requests,
        tools,
        artifacts,
        config.tool_loop.clone(),
        config.generation.options(),
    )
    .with_events(events.clone());

    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "runtime.ready",
            component: "cli.main",
            provider_id: Some(client_info.id.as_str()),
            model_id: config.generation.model.as_deref(),
            status: Some("ok"),
            ..Default::default()
        },
    );

    Ok(Runtime {
        config,
        orchestrator,
        events,
        paths,
    })
}

fn system_prompt(config: &EngineConfig) -> Option<&str> {
    Some(
        config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT),
    )
}

fn report_turn_error(err: &EngineError) {
    let detail = err.to_string();
    emit_event(
        tracing::Level::ERROR,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "turn.error",
            component: "cli.main",
            status: Some("failed"),
            error_code: Some(err.code()),
            detail: Some(detail.as_str()),
            ..Default::default()
        },
    );
}

fn watch_ctrl_c(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

fn print_answer(outcome: &TurnOutcome) {
    if !outcome.answer_already_shown() {
        println!("{}", outcome.answer);
    }
    tracing::debug!(metrics = ?outcome.metrics, "turn finished");
}

async fn save_session(paths: &SharedPaths, session: &Session) {
    if session.events().is_empty() {
        return;
    }
    let path = paths
        .root
        .join("sessions")
        .join(format!("{}.json", session.id));
    if let Err(err) = session.save(&path).await {
        tracing::warn!(error = %err, path = %path.display(), "failed to save session");
    }
}

fn spawn_progress_printer(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.event_type == "message.prose" => {
                    if let Some(text) = event.properties.get("text").and_then(|v| v.as_str()) {
                        println!("{text}");
                    }
                }
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        eprintln!("{line}");
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn describe_event(event: &EngineEvent) -> Option<String> {
    let props = &event.properties;
    let tool = props.get("tool").and_then(|v| v.as_str()).unwrap_or("tool");
    match event.event_type.as_str() {
        "tool.started" => Some(format!(
            "-> {tool} {}",
            props.get("args").map(|v| v.to_string()).unwrap_or_default()
        )),
        "tool.completed" => {
            let bytes = props.get("bytes").and_then(|v| v.as_u64()).unwrap_or(0);
            let cached = if props.get("cacheHit").and_then(|v| v.as_bool()) == Some(true) {
                ", cached"
            } else {
                ""
            };
            let saved = props
                .get("artifactPath")
                .and_then(|v| v.as_str())
                .map(|path| format!(", saved to {path}"))
                .unwrap_or_default();
            Some(format!("   {tool} done ({bytes} bytes{cached}{saved})"))
        }
        "tool.failed" => Some(format!(
            "   {tool} failed: {}",
            props.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error")
        )),
        "provider.retry" if props.get("rateLimited").and_then(|v| v.as_bool()) == Some(true) => {
            None
        }
        "provider.retry" | "loop.stopped" => props
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    max_iterations: Option<usize>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() && max_iterations.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // api key and model land on the selected provider, openai when none was given
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    if let Some(max_iterations) = max_iterations {
        root.insert(
            "tool_loop".to_string(),
            serde_json::json!({ "max_iterations": max_iterations }),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn read_tool_json(input: &str) -> anyhow::Result<serde_json::Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}
