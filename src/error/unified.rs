//! Error classification.

use serde::{Deserialize, Serialize};

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Permission,
    RateLimit,
    Transport,
    MalformedResponse,
    Server,
    Api,
    ToolExecution,
    MaxTurns,
    Cancelled,
    Configuration,
    Serialization,
    Unknown,
}
