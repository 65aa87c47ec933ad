//! Tool executor seam used by the agentic loop.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolExecutionContext, ToolOutcome};
use crate::error::{Result, SkiffError};
use crate::provider::ToolDefinition;
use crate::types::ToolCall;

/// Runs model-issued tool calls. The loop never retries a failed call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions offered to the model, in registration order.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Whether `name` is known and never mutates the workspace.
    fn is_read_only(&self, name: &str) -> bool;

    async fn execute(&self, call: &ToolCall, ctx: &ToolExecutionContext) -> Result<ToolOutcome>;
}

/// Ordered collection of tools; the default [`ToolExecutor`].
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in coding tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tool in super::builtin::all_tools() {
            registry.register(tool);
        }
        registry
    }

    /// Add a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(slot) => *slot = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters().schema.clone(),
            })
            .collect()
    }

    fn is_read_only(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.is_read_only())
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolExecutionContext) -> Result<ToolOutcome> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| SkiffError::tool(&call.name, format!("unknown tool: {}", call.name)))?;
        let args = ToolArguments::new(call.parsed_arguments()?);

        tracing::debug!(tool = %call.name, id = %call.id, "executing tool");
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(SkiffError::Cancelled),
            result = tool.execute(&args, ctx) => result,
        };

        result.map_err(|e| match e {
            SkiffError::ToolExecution { .. } | SkiffError::Cancelled => e,
            other => SkiffError::tool(&call.name, other.to_string()),
        })
    }
}

/// Exposes only a whitelisted subset of another executor's tools.
pub struct FilteredExecutor {
    inner: Arc<dyn ToolExecutor>,
    allowed: HashSet<String>,
}

impl FilteredExecutor {
    pub fn new<I, S>(inner: Arc<dyn ToolExecutor>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner,
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    fn permits(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }
}

#[async_trait]
impl ToolExecutor for FilteredExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.inner
            .definitions()
            .into_iter()
            .filter(|d| self.permits(&d.name))
            .collect()
    }

    fn is_read_only(&self, name: &str) -> bool {
        self.permits(name) && self.inner.is_read_only(name)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolExecutionContext) -> Result<ToolOutcome> {
        if !self.permits(&call.name) {
            return Err(SkiffError::tool(
                &call.name,
                format!("tool {} is not available here", call.name),
            ));
        }
        self.inner.execute(call, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::AgentTool;
    use crate::tools::types::ToolParameters;
    use tokio_util::sync::CancellationToken;

    fn echo() -> Arc<dyn Tool> {
        Arc::new(
            AgentTool::new(
                "echo",
                "Echo text",
                ToolParameters::object().string("text", "Text", true).build(),
                |args, _ctx| async move { Ok(ToolOutcome::success(args.get_str("text")?)) },
            )
            .read_only(),
        )
    }

    fn failing() -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            "fail",
            "Always fails",
            ToolParameters::object().build(),
            |_args, _ctx| async move { Err(SkiffError::Configuration("broken".into())) },
        ))
    }

    fn stalled() -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            "stall",
            "Never finishes",
            ToolParameters::object().build(),
            |_args, _ctx| async move {
                std::future::pending::<()>().await;
                Ok(ToolOutcome::success(""))
            },
        ))
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(echo());
        registry.register(failing());
        registry.register(stalled());
        registry
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let call = ToolCall::new("c1", "echo", r#"{"text":"hi"}"#);
        let out = registry()
            .execute(&call, &ToolExecutionContext::default())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error() {
        let call = ToolCall::new("c1", "nope", "{}");
        let err = registry()
            .execute(&call, &ToolExecutionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::ToolExecution { ref tool_name, .. } if tool_name == "nope"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_tool_error() {
        let call = ToolCall::new("c1", "echo", "{not json");
        let err = registry()
            .execute(&call, &ToolExecutionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn other_errors_become_tool_errors() {
        let call = ToolCall::new("c1", "fail", "{}");
        let err = registry()
            .execute(&call, &ToolExecutionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::ToolExecution { ref message, .. } if message.contains("broken")));
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_tool() {
        let cancel = CancellationToken::new();
        let ctx = ToolExecutionContext::new(".", cancel.clone());
        let call = ToolCall::new("c1", "stall", "{}");
        let registry = registry();
        let handle = tokio::spawn(async move { registry.execute(&call, &ctx).await });
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn register_replaces_by_name() {
        let mut registry = registry();
        registry.register(echo());
        assert_eq!(registry.names(), vec!["echo", "fail", "stall"]);
    }

    #[tokio::test]
    async fn filtered_executor_hides_other_tools() {
        let filtered = FilteredExecutor::new(Arc::new(registry()), ["echo"]);
        let names: Vec<_> = filtered.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo"]);
        assert!(filtered.is_read_only("echo"));
        assert!(!filtered.is_read_only("fail"));

        let call = ToolCall::new("c1", "fail", "{}");
        let err = filtered
            .execute(&call, &ToolExecutionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::ToolExecution { ref message, .. } if message.contains("not available")));
    }
}
