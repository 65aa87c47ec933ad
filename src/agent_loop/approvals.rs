//! Tool approval: permission modes, the gate seam and its implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::types::ToolCall;

/// How tool calls are approved for a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PermissionMode {
    /// Read-only tools run freely; everything else asks the gate.
    #[default]
    Ask,
    /// Every tool runs without asking.
    Auto,
    /// Read-only tools run; mutating tools are denied.
    ReadOnly,
}

/// Outcome of the policy step for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Ask,
    Deny,
}

impl PermissionMode {
    pub fn decide(self, read_only_tool: bool) -> ApprovalDecision {
        match (self, read_only_tool) {
            (_, true) | (PermissionMode::Auto, false) => ApprovalDecision::Allow,
            (PermissionMode::Ask, false) => ApprovalDecision::Ask,
            (PermissionMode::ReadOnly, false) => ApprovalDecision::Deny,
        }
    }
}

/// A pending question to the user about one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    /// One-line human summary of the call.
    pub description: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ApprovalRequest {
    pub fn for_call(session_id: impl Into<String>, call: &ToolCall) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tool_name: call.name.clone(),
            description: describe_call(call),
            arguments: call.arguments_value(),
        }
    }
}

const DESCRIPTION_MAX_CHARS: usize = 200;

fn describe_call(call: &ToolCall) -> String {
    let args = call.arguments.trim();
    if args.is_empty() || args == "{}" {
        return call.name.clone();
    }
    let mut summary: String = args.chars().take(DESCRIPTION_MAX_CHARS).collect();
    if args.chars().count() > DESCRIPTION_MAX_CHARS {
        summary.push_str("...");
    }
    format!("{} {summary}", call.name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    /// Allow this tool for the rest of the loop without asking again.
    #[serde(default)]
    pub remember: bool,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            remember: false,
        }
    }

    pub fn approve_always() -> Self {
        Self {
            approved: true,
            remember: true,
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }
}

/// External broker that approves or denies tool calls.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalResponse;

    /// Resolve every outstanding request of `session_id` as denied.
    fn cancel_pending(&self, session_id: &str);
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApproveGate;

#[async_trait]
impl PermissionGate for AutoApproveGate {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalResponse {
        ApprovalResponse::approve()
    }

    fn cancel_pending(&self, _session_id: &str) {}
}

/// Denies everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllGate;

#[async_trait]
impl PermissionGate for DenyAllGate {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalResponse {
        ApprovalResponse::deny()
    }

    fn cancel_pending(&self, _session_id: &str) {}
}

type PendingKey = (String, String);

/// Unresolved approvals keyed by `(session_id, request_id)`.
#[derive(Debug, Default)]
pub struct PendingApprovals {
    slots: Mutex<HashMap<PendingKey, oneshot::Sender<ApprovalResponse>>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PendingKey, oneshot::Sender<ApprovalResponse>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, session_id: &str, request_id: &str) -> oneshot::Receiver<ApprovalResponse> {
        let (tx, rx) = oneshot::channel();
        self.slots()
            .insert((session_id.to_string(), request_id.to_string()), tx);
        rx
    }

    /// Deliver a response. Returns false when no such request is pending.
    pub fn resolve(&self, session_id: &str, request_id: &str, response: ApprovalResponse) -> bool {
        let sender = self
            .slots()
            .remove(&(session_id.to_string(), request_id.to_string()));
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Deny and drop every request of one session. Returns how many were pending.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let drained: Vec<_> = {
            let mut slots = self.slots();
            let keys: Vec<PendingKey> = slots
                .keys()
                .filter(|(session, _)| session == session_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| slots.remove(&k)).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(ApprovalResponse::deny());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes requests on a channel; a UI answers through [`resolve`](Self::resolve).
#[derive(Debug, Clone)]
pub struct ChannelPermissionGate {
    pending: Arc<PendingApprovals>,
    requests: mpsc::UnboundedSender<ApprovalRequest>,
}

impl ChannelPermissionGate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(PendingApprovals::new()),
                requests,
            },
            rx,
        )
    }

    pub fn resolve(&self, session_id: &str, request_id: &str, response: ApprovalResponse) -> bool {
        self.pending.resolve(session_id, request_id, response)
    }

    pub fn pending(&self) -> &PendingApprovals {
        &self.pending
    }
}

#[async_trait]
impl PermissionGate for ChannelPermissionGate {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalResponse {
        let session_id = request.session_id.clone();
        let request_id = request.id.clone();
        let rx = self.pending.insert(&session_id, &request_id);

        if self.requests.send(request).is_err() {
            tracing::warn!(%session_id, "approval channel closed, denying");
            self.pending
                .resolve(&session_id, &request_id, ApprovalResponse::deny());
        }
        rx.await.unwrap_or_else(|_| ApprovalResponse::deny())
    }

    fn cancel_pending(&self, session_id: &str) {
        let count = self.pending.cancel_session(session_id);
        if count > 0 {
            tracing::debug!(session_id, count, "denied outstanding approvals");
        }
    }
}

/// Denies a session's outstanding approvals when dropped.
pub struct ApprovalTeardown {
    gate: Arc<dyn PermissionGate>,
    session_id: String,
}

impl ApprovalTeardown {
    pub fn new(gate: Arc<dyn PermissionGate>, session_id: impl Into<String>) -> Self {
        Self {
            gate,
            session_id: session_id.into(),
        }
    }
}

impl Drop for ApprovalTeardown {
    fn drop(&mut self) {
        self.gate.cancel_pending(&self.session_id);
    }
}
