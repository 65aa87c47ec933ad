//! Subagents: restricted, stateless nested loops.
//!
//! A [`SubagentDefinition`] names a tool whitelist and a system prompt. A
//! [`SubagentDelegate`] turns one into a fresh [`AgenticLoop`] with its own
//! window, and [`TaskTool`] exposes delegation to a parent loop as the
//! `Task` tool. Subagents never receive `Task`, so nesting stops at one level.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{
    AgenticLoop, LoopContext, LoopOptions, LoopResult, PermissionGate, PermissionMode,
};
use crate::error::{Result, SkiffError};
use crate::provider::ChatService;
use crate::tools::builtin::{BASH, GREP, LS, READ, WRITE};
use crate::tools::{
    FilteredExecutor, Tool, ToolArguments, ToolExecutionContext, ToolExecutor, ToolOutcome,
    ToolParameters,
};

pub const TASK: &str = "Task";

const EXPLORE_PROMPT: &str = "You are a read-only exploration agent working inside a code repository. \
Use LS, Read and Grep to answer the task below. Do not guess: cite file paths and line numbers. \
Finish with a concise answer.\n\nTask: {task}";

const GENERAL_PROMPT: &str = "You are a focused coding agent handling one delegated task. \
Use the available tools to complete it, then reply with a short report of what you found or changed.\n\n\
Task: {task}";

/// A named, restricted loop configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentDefinition {
    pub name: String,
    pub description: String,
    /// Tools the subagent may see and call.
    pub tools: Vec<String>,
    /// System prompt; `{task}` is replaced with the delegated task.
    pub prompt_template: String,
    pub max_turns: usize,
}

impl SubagentDefinition {
    /// Read-only code exploration.
    pub fn explore() -> Self {
        Self {
            name: "explore".into(),
            description: "Read-only search of the workspace; answers questions about the code".into(),
            tools: vec![LS.into(), READ.into(), GREP.into()],
            prompt_template: EXPLORE_PROMPT.into(),
            max_turns: 15,
        }
    }

    /// Every built-in tool except `Task`.
    pub fn general() -> Self {
        Self {
            name: "general".into(),
            description: "General-purpose agent for self-contained multi-step tasks".into(),
            tools: vec![LS.into(), READ.into(), WRITE.into(), GREP.into(), BASH.into()],
            prompt_template: GENERAL_PROMPT.into(),
            max_turns: 25,
        }
    }

    pub fn builtins() -> Vec<Self> {
        vec![Self::explore(), Self::general()]
    }

    pub fn find(name: &str) -> Option<Self> {
        Self::builtins().into_iter().find(|d| d.name == name)
    }

    pub fn system_prompt(&self, task: &str) -> String {
        self.prompt_template.replace("{task}", task)
    }
}

/// Everything a subagent inherits from its parent at creation.
#[derive(Clone)]
pub struct SubagentDelegate {
    definition: SubagentDefinition,
    chat: Arc<dyn ChatService>,
    tools: Arc<dyn ToolExecutor>,
    gate: Arc<dyn PermissionGate>,
    permission_mode: PermissionMode,
    working_dir: PathBuf,
    parent_session: String,
    stream: bool,
}

impl SubagentDelegate {
    pub fn new(
        definition: SubagentDefinition,
        chat: Arc<dyn ChatService>,
        tools: Arc<dyn ToolExecutor>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            definition,
            chat,
            tools,
            gate,
            permission_mode: PermissionMode::default(),
            working_dir: PathBuf::from("."),
            parent_session: String::new(),
            stream: false,
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_parent_session(mut self, session_id: impl Into<String>) -> Self {
        self.parent_session = session_id.into();
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn definition(&self) -> &SubagentDefinition {
        &self.definition
    }

    /// Run `task` in a fresh loop and return its compact result.
    pub async fn run(&self, task: &str, cancel: CancellationToken) -> LoopResult {
        let definition = &self.definition;
        let allowed = definition.tools.iter().filter(|name| name.as_str() != TASK);
        let tools: Arc<dyn ToolExecutor> =
            Arc::new(FilteredExecutor::new(self.tools.clone(), allowed.cloned()));

        let session_id = format!(
            "{}/{}-{}",
            self.parent_session,
            definition.name,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let options = LoopOptions::builder()
            .max_turns(definition.max_turns)
            .stream(self.stream)
            .permission_mode(self.permission_mode)
            .system_prompt(definition.system_prompt(task))
            .working_dir(self.working_dir.clone())
            .session_id(session_id.clone())
            .build();

        tracing::info!(subagent = %definition.name, %session_id, "starting subagent");
        let ctx = LoopContext::new(self.chat.clone(), tools, self.gate.clone());
        let result = AgenticLoop::new(ctx, options).run(task, cancel).await;
        self.gate.cancel_pending(&session_id);
        result
    }
}

/// The `Task` tool: delegate a self-contained task to a subagent.
pub struct TaskTool {
    chat: Arc<dyn ChatService>,
    tools: Arc<dyn ToolExecutor>,
    gate: Arc<dyn PermissionGate>,
    permission_mode: PermissionMode,
    definitions: Vec<SubagentDefinition>,
    parameters: ToolParameters,
    description: String,
}

impl TaskTool {
    /// `tools` is what subagents draw from; it must not contain `Task`.
    pub fn new(
        chat: Arc<dyn ChatService>,
        tools: Arc<dyn ToolExecutor>,
        gate: Arc<dyn PermissionGate>,
        permission_mode: PermissionMode,
    ) -> Self {
        Self::with_definitions(chat, tools, gate, permission_mode, SubagentDefinition::builtins())
    }

    pub fn with_definitions(
        chat: Arc<dyn ChatService>,
        tools: Arc<dyn ToolExecutor>,
        gate: Arc<dyn PermissionGate>,
        permission_mode: PermissionMode,
        definitions: Vec<SubagentDefinition>,
    ) -> Self {
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        let parameters = ToolParameters::object()
            .string_enum("subagent_type", "Which subagent to use", &names, true)
            .string("prompt", "The complete task for the subagent", true)
            .string("description", "A short (3-5 word) label for the task", false)
            .build();
        let mut description =
            String::from("Delegate a self-contained task to a subagent with its own context. Available subagents:");
        for d in &definitions {
            description.push_str(&format!("\n- {}: {}", d.name, d.description));
        }
        Self {
            chat,
            tools,
            gate,
            permission_mode,
            definitions,
            parameters,
            description,
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        TASK
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolExecutionContext) -> Result<ToolOutcome> {
        let kind = args.get_str("subagent_type")?;
        let prompt = args.get_str("prompt")?;
        let definition = self
            .definitions
            .iter()
            .find(|d| d.name == kind)
            .cloned()
            .ok_or_else(|| SkiffError::tool(TASK, format!("unknown subagent type: {kind}")))?;

        let delegate = SubagentDelegate::new(
            definition,
            self.chat.clone(),
            self.tools.clone(),
            self.gate.clone(),
        )
        .with_permission_mode(self.permission_mode)
        .with_working_dir(ctx.working_dir.clone())
        .with_parent_session(ctx.session_id.clone());

        let result = delegate.run(prompt, ctx.cancel.clone()).await;
        if result.is_cancelled() {
            return Err(SkiffError::Cancelled);
        }
        if let Some(err) = &result.error {
            return Err(SkiffError::tool(
                TASK,
                format!("subagent {kind} failed: {}", err.user_message()),
            ));
        }
        Ok(ToolOutcome::success(result.message.clone())
            .with_metadata("subagent", kind)
            .with_metadata("turns", result.stats.turns)
            .with_metadata("tool_calls", result.stats.tool_calls)
            .with_metadata("tokens", result.stats.tokens.total_tokens)
            .with_usage(result.stats.tokens))
    }
}
