//! Remote chat service access
//!
//! `ChatBackend` is the single seam between the core and the remote service;
//! `RetryPipeline` wraps it with the backoff and cancellation policy.

mod claude;
mod error;
pub mod retry;
mod types;

pub use claude::ClaudeBackend;
pub use error::{parse_retry_after, LlmError};
pub use retry::{AttemptOutcome, RetryAttempt, RetryNotice, RetryPipeline, RetryPolicy, RetryReport};
pub use types::{ChatReply, ChatRequest};

use async_trait::async_trait;

/// Trait for remote chat services
///
/// One call is one attempt: implementations must not retry internally and
/// must classify every failure as an [`LlmError`].
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Send the context and return the assistant reply
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, LlmError>;
}
