//! skiff: a coding agent over many LLM vendors.
//!
//! One canonical conversation model ([`types`]) is translated by a
//! [`ChatService`](provider::ChatService) adapter per vendor family, and an
//! [`AgenticLoop`](agent_loop::AgenticLoop) drives tool-using turns against it
//! under a permission policy.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use skiff::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> skiff::error::Result<()> {
//! let chat = create_chat_service(ProviderKind::Anthropic, ChatConfig::new("claude-sonnet-4-20250514"))?;
//! let ctx = LoopContext::new(chat, Arc::new(ToolRegistry::with_builtins()), Arc::new(AutoApproveGate));
//! let mut agent = AgenticLoop::new(ctx, LoopOptions::default());
//! let result = agent.run("List the files here", CancellationToken::new()).await;
//! println!("{}", result.message);
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod subagent;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
