// Approval bus
//
// Out-of-band user approvals for gated tool calls. Every wait goes through
// the ApprovalBus trait so the in-memory implementation and the
// distributed (kv pub/sub) implementation share one code path. A request
// is resolved exactly once: the first resolution wins, later resolutions
// are dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use podex_core::{ActionType, Result};

/// Approval request surfaced to the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub action_type: ActionType,
    pub arguments: Value,
    pub can_add_to_allowlist: bool,
}

/// Resolution of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub add_to_allowlist: bool,
}

impl ApprovalDecision {
    pub fn denied() -> Self {
        Self {
            approved: false,
            add_to_allowlist: false,
        }
    }
}

/// Bus that carries approval resolutions back to the waiting executor.
///
/// Distributed implementations may receive the resolution in a different
/// process than the one that registered the wait.
#[async_trait]
pub trait ApprovalBus: Send + Sync {
    /// Register a pending wait. The returned receiver resolves with the
    /// decision, or is dropped if the bus shuts down.
    async fn register(&self, approval_id: &str) -> Result<oneshot::Receiver<ApprovalDecision>>;

    /// Resolve a pending wait. Returns true if a waiter was resolved;
    /// a second resolution for the same id returns false.
    async fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> Result<bool>;

    /// Drop a pending wait (timeout or executor teardown)
    async fn unregister(&self, approval_id: &str);
}

/// In-memory approval bus for tests and single-process deployments
#[derive(Default)]
pub struct InMemoryApprovalBus {
    waiters: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl InMemoryApprovalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of waits currently registered
    pub fn pending(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[async_trait]
impl ApprovalBus for InMemoryApprovalBus {
    async fn register(&self, approval_id: &str) -> Result<oneshot::Receiver<ApprovalDecision>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(approval_id.to_string(), tx);
        Ok(rx)
    }

    async fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> Result<bool> {
        let sender = self.waiters.lock().unwrap().remove(approval_id);
        match sender {
            Some(tx) => Ok(tx.send(decision).is_ok()),
            None => {
                debug!(approval_id = %approval_id, "Late or unknown approval resolution dropped");
                Ok(false)
            }
        }
    }

    async fn unregister(&self, approval_id: &str) {
        self.waiters.lock().unwrap().remove(approval_id);
    }
}
