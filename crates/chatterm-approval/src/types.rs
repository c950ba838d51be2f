use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Default time a request stays pending before it is auto-interrupted.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// The answer to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Run this tool call once.
    Allow,
    /// Refuse this tool call.
    Deny,
    /// Run this tool call and stop asking for this tool.
    Always,
    /// Abandon the query; also the outcome of a timeout or bulk interrupt.
    Interrupt,
}

/// Snapshot of a pending approval, used to rebuild UI state after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub session_id: String,
    pub created_at: SystemTime,
    /// `None` when the request never times out.
    pub timeout: Option<Duration>,
}
