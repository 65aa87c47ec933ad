//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    AgenticLoop, AutoApproveGate, LoopContext, LoopOptions, LoopResult, LoopState, PermissionGate,
    PermissionMode,
};
pub use crate::config::{ChatConfig, ChatConfigUpdate, SkiffConfig};
pub use crate::error::{Result, SkiffError};
pub use crate::provider::{create_chat_service, ChatRequest, ChatService, ProviderKind, ToolDefinition};
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolExecutor, ToolOutcome, ToolParameters, ToolRegistry};
pub use crate::types::{
    ChatResponse, ChatStream, ContentPart, FinishReason, Message, Role, StreamChunk, ToolCall, Usage,
};
