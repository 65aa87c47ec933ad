//! Core run types for the agent loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SkiffError;
use crate::types::Usage;

/// Where the loop is in its turn cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LoopState {
    AwaitingModel,
    ModelResponded,
    AwaitingToolApproval,
    ExecutingTools,
    Done,
    Failed,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Failed | LoopState::Cancelled)
    }
}

/// Accounting for one task, across every model call it made.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopStats {
    pub tokens: Usage,
    pub tool_calls: usize,
    pub turns: usize,
    pub duration: Duration,
}

/// Result of running a task to a terminal state.
#[derive(Debug)]
pub struct LoopResult {
    pub success: bool,
    pub state: LoopState,
    /// Final assistant text, or whatever partial text the last turn produced.
    pub message: String,
    pub stats: LoopStats,
    pub error: Option<SkiffError>,
}

impl LoopResult {
    pub fn done(message: impl Into<String>, stats: LoopStats) -> Self {
        Self {
            success: true,
            state: LoopState::Done,
            message: message.into(),
            stats,
            error: None,
        }
    }

    pub fn failed(error: SkiffError, message: impl Into<String>, stats: LoopStats) -> Self {
        Self {
            success: false,
            state: LoopState::Failed,
            message: message.into(),
            stats,
            error: Some(error),
        }
    }

    pub fn cancelled(message: impl Into<String>, stats: LoopStats) -> Self {
        Self {
            success: false,
            state: LoopState::Cancelled,
            message: message.into(),
            stats,
            error: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == LoopState::Cancelled
    }

    /// One-line summary: outcome, turns, tool calls, tokens and wall time.
    pub fn summary(&self) -> String {
        let outcome = match (&self.error, self.state) {
            (Some(err), _) => format!("failed: {}", err.user_message()),
            (None, state) => state.to_string(),
        };
        format!(
            "{outcome} ({} turns, {} tool calls, {} tokens, {:.1}s)",
            self.stats.turns,
            self.stats.tool_calls,
            self.stats.tokens.total_tokens,
            self.stats.duration.as_secs_f64()
        )
    }
}
