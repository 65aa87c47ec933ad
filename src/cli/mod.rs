//! CLI entry point for skiff.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{
    AgenticLoop, ApprovalRequest, ApprovalResponse, ApprovalTeardown, ChannelPermissionGate,
    EventSink, JsonlSessionLog, LoopContext, LoopEvent, LoopOptions, PermissionGate,
    PermissionMode,
};
use crate::config::SkiffConfig;
use crate::error::Result;
use crate::provider::retry::RetryingChatService;
use crate::provider::{create_chat_service, ChatService, ProviderKind};
use crate::subagent::{SubagentDefinition, TaskTool};
use crate::tools::ToolRegistry;
use crate::util::retry::RetryPolicy;

const TOOL_PREVIEW_CHARS: usize = 200;

/// Coding agent over many LLM vendors
#[derive(Parser, Debug)]
#[command(name = "skiff", version, about = "skiff: a tool-using coding agent")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task to completion
    Run(RunArgs),
    /// List the available subagents
    Agents,
}

/// Arguments for `skiff run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// The task for the agent
    pub prompt: String,

    /// Vendor to use (openai, anthropic, gemini, code-assist, azure)
    #[arg(short, long)]
    pub provider: Option<ProviderKind>,

    /// Model id
    #[arg(short, long)]
    pub model: Option<String>,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Model calls allowed before giving up
    #[arg(long)]
    pub max_turns: Option<usize>,

    /// How tool calls are approved
    #[arg(long, value_enum)]
    pub permission_mode: Option<PermissionMode>,

    /// Wait for whole responses instead of streaming
    #[arg(long)]
    pub no_stream: bool,

    /// Temperature (0.0 - 2.0)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Max output tokens per model call
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Config file (defaults to the platform config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append the session to this JSONL file, resuming it if it exists
    #[arg(long)]
    pub session_log: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Install the stderr log subscriber. `SKIFF_LOG` takes precedence over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "warn,skiff=debug",
        _ => "warn,skiff=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("SKIFF_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `skiff agents`
pub fn handle_agents() {
    for definition in SubagentDefinition::builtins() {
        println!("{:<10} {}", definition.name, definition.description);
        println!("{:<10} tools: {}", "", definition.tools.join(", "));
    }
}

/// Fold command-line overrides into the loaded config.
pub fn apply_overrides(config: &mut SkiffConfig, args: &RunArgs) {
    if let Some(provider) = args.provider {
        if provider != config.provider {
            // The configured model belongs to the other vendor.
            config.model = None;
        }
        config.provider = provider;
    }
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    if let Some(t) = args.temperature {
        config.temperature = Some(t);
    }
    if let Some(max) = args.max_tokens {
        config.max_output_tokens = Some(max);
    }
    if let Some(turns) = args.max_turns {
        config.max_turns = turns;
    }
    if let Some(mode) = args.permission_mode {
        config.permission_mode = mode;
    }
    if args.no_stream {
        config.stream = false;
    }
}

/// `skiff run`. Returns whether the task succeeded.
pub async fn handle_run(args: RunArgs) -> Result<bool> {
    let mut config = SkiffConfig::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    let mut chat: Arc<dyn ChatService> = create_chat_service(config.provider, config.chat_config()?)?;
    if config.max_retries > 0 {
        chat = Arc::new(RetryingChatService::new(
            chat,
            RetryPolicy::with_max_retries(config.max_retries),
        ));
    }

    let (channel_gate, approvals) = ChannelPermissionGate::new();
    let approver = tokio::spawn(answer_approvals(approvals, channel_gate.clone()));
    let gate: Arc<dyn PermissionGate> = Arc::new(channel_gate);

    let base = Arc::new(ToolRegistry::with_builtins());
    let mut registry = (*base).clone();
    registry.register(Arc::new(TaskTool::new(
        chat.clone(),
        base,
        gate.clone(),
        config.permission_mode,
    )));

    let working_dir = std::env::current_dir()?;
    let options = LoopOptions::builder()
        .max_turns(config.max_turns)
        .stream(config.stream)
        .permission_mode(config.permission_mode)
        .maybe_system_prompt(args.system.clone())
        .working_dir(working_dir)
        .build();

    let (events, event_rx) = EventSink::channel();
    let printer = tokio::spawn(print_events(event_rx));

    let mut ctx = LoopContext::new(chat, Arc::new(registry), gate.clone()).with_events(events);
    let mut history = Vec::new();
    if let Some(path) = &args.session_log {
        history = resume(path)?;
        ctx = ctx.with_session_log(Arc::new(JsonlSessionLog::open(path)?));
    }

    let mut agent = AgenticLoop::new(ctx, options).with_history(history);
    let _teardown = ApprovalTeardown::new(gate, agent.session_id());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = agent.run(args.prompt, cancel).await;
    drop(agent);
    let _ = printer.await;
    approver.abort();

    println!();
    if let Some(err) = &result.error {
        eprintln!("error: {}", err.user_message());
    }
    eprintln!("{}", result.summary());
    Ok(result.success)
}

fn resume(path: &Path) -> Result<Vec<crate::types::Message>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let history = JsonlSessionLog::replay(path)?;
    tracing::info!(path = %path.display(), messages = history.len(), "resuming session");
    Ok(history)
}

/// Prompt on stdin for each approval request.
async fn answer_approvals(
    mut requests: mpsc::UnboundedReceiver<ApprovalRequest>,
    gate: ChannelPermissionGate,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(request) = requests.recv().await {
        eprint!("\nAllow {}? [y]es / [a]lways / [N]o: ", request.description);
        let _ = std::io::stderr().flush();
        let answer = match lines.next_line().await {
            Ok(Some(line)) => parse_answer(&line),
            _ => ApprovalResponse::deny(),
        };
        if !gate.resolve(&request.session_id, &request.id, answer) {
            tracing::debug!(request_id = %request.id, "approval no longer pending");
        }
    }
}

fn parse_answer(line: &str) -> ApprovalResponse {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalResponse::approve(),
        "a" | "always" => ApprovalResponse::approve_always(),
        _ => ApprovalResponse::deny(),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<LoopEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LoopEvent::TextDelta { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            LoopEvent::ToolCallStarted { name, arguments, .. } => {
                eprintln!("\n> {name} {}", preview(&arguments.to_string()));
            }
            LoopEvent::ToolCallFinished {
                success, content, ..
            } => {
                let mark = if success { "ok" } else { "error" };
                eprintln!("  [{mark}] {}", preview(&content));
            }
            _ => {}
        }
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(TOOL_PREVIEW_CHARS).collect();
    if line.chars().count() > TOOL_PREVIEW_CHARS || text.lines().nth(1).is_some() {
        out.push_str("...");
    }
    out
}
