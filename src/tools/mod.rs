//! Tool system: the tool trait, the executor seam and built-in coding tools.

pub mod arguments;
pub mod builtin;
pub mod executor;
pub mod tool;
pub mod types;

pub use arguments::ToolArguments;
pub use executor::{FilteredExecutor, ToolExecutor, ToolRegistry};
pub use tool::{AgentTool, Tool, ToolExecutionContext, ToolOutcome};
pub use types::{ParameterBuilder, ToolParameters};
