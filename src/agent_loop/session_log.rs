//! Append-only session event log.
//!
//! Each session is a newline-delimited JSON file; the conversation is
//! rebuilt by replaying its `message` events in order.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Message, Usage};

use super::types::LoopState;

/// One line of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: String,
        at: DateTime<Utc>,
    },
    Message {
        message: Message,
    },
    Finished {
        state: LoopState,
        usage: Usage,
        at: DateTime<Utc>,
    },
}

/// Sink for session events. The loop only ever appends.
pub trait SessionLog: Send + Sync {
    fn append(&self, event: &SessionEvent) -> Result<()>;
}

/// Session log backed by a `.jsonl` file.
#[derive(Debug)]
pub struct JsonlSessionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSessionLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every event of a log file. A torn trailing line is skipped.
    pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<SessionEvent>> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), line = index + 1, error = %e, "skipping unreadable session event");
                }
            }
        }
        Ok(events)
    }

    /// Rebuild the conversation recorded in a log file.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<Message>> {
        Ok(messages_of(Self::read_events(path)?))
    }
}

impl SessionLog for JsonlSessionLog {
    fn append(&self, event: &SessionEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory session log, mostly for tests.
#[derive(Debug, Default)]
pub struct MemorySessionLog {
    events: Mutex<Vec<SessionEvent>>,
}

impl MemorySessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replay(&self) -> Vec<Message> {
        messages_of(self.events())
    }
}

impl SessionLog for MemorySessionLog {
    fn append(&self, event: &SessionEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

fn messages_of(events: Vec<SessionEvent>) -> Vec<Message> {
    events
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Message { message } => Some(message),
            _ => None,
        })
        .collect()
}
