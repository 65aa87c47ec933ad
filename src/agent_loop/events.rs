//! Loop lifecycle notifications.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::Usage;

use super::types::LoopState;

/// Notifications a running loop publishes for UIs and telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Started {
        session_id: String,
    },
    TurnStarted {
        turn: usize,
    },
    TextDelta {
        text: String,
    },
    ToolCallStarted {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallFinished {
        id: String,
        name: String,
        success: bool,
        content: String,
    },
    TurnFinished {
        turn: usize,
        usage: Usage,
    },
    Finished {
        state: LoopState,
        message: String,
    },
}

/// Write side of the loop's event channel.
///
/// Emitting never blocks and never fails the loop; a closed receiver is
/// logged once.
#[derive(Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<LoopEvent>>,
    closed_logged: AtomicBool,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            tx: Some(tx),
            closed_logged: AtomicBool::new(false),
        }
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: LoopEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.send(event).is_err() && !self.closed_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!("event receiver dropped; further loop events are discarded");
        }
    }
}
