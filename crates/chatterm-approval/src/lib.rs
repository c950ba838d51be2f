//! chatterm-approval: Human-in-the-loop approval of agent tool calls.
//!
//! The agent engine registers a pending approval and awaits it; the chat UI
//! resolves it, a bulk interrupt abandons it, or a timer gives up on it and
//! interrupts the running query.

pub mod coordinator;
pub mod interrupt;
pub mod types;

pub use coordinator::{ApprovalCoordinator, ApprovalWaiter};
pub use interrupt::QueryInterrupter;
pub use types::{ApprovalDecision, ApprovalRequest, DEFAULT_APPROVAL_TIMEOUT};
