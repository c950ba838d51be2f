//! The query-interrupt capability consumed by the timeout path.

use std::future::Future;
use std::pin::Pin;

/// Stops the agent query running for a chat session.
///
/// Implemented by the agent execution engine. Only the approval timeout
/// calls this; bulk interrupts assume the caller is already stopping the
/// session.
pub trait QueryInterrupter: Send + Sync {
    /// Interrupt the query of `session_id`. Returns whether a running query
    /// was found and interrupted.
    fn interrupt_query<'a>(
        &'a self,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}
