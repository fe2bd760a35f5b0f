//! Retry pipeline for chat backends
//!
//! Wraps exactly one logical outbound call with exponential backoff and
//! jitter. Transient failures are absorbed here and only ever leave as
//! [`ChatError::RetryExhausted`]; fatal failures and cancellation propagate
//! immediately.

use super::{ChatBackend, ChatReply, ChatRequest, LlmError};
use crate::config::RetryConfig;
use crate::core::errors::{ChatError, ChatResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound of the random jitter, as a fraction of the computed delay
const JITTER_FRACTION: f64 = 0.25;

/// Backoff and deadline settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for the computed delay
    pub max_delay: Duration,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
    /// Deadline for a single attempt
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
            request_timeout: config.request_timeout(),
        }
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: enable/disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Builder: set per-attempt deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff before retry `n` (1-based), without jitter
    ///
    /// `base * 2^(n-1)`, capped at `max_delay`. Non-decreasing in `n`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Delay to wait after `error` ended attempt `retry`
    ///
    /// Jitter adds up to 25% but never pushes past `max_delay`. A server wait
    /// hint wins whenever it is longer than the computed delay.
    pub fn delay_for_retry(&self, retry: u32, error: &LlmError) -> Duration {
        let backoff = self.backoff(retry);
        let computed = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
            backoff.mul_f64(1.0 + factor).min(self.max_delay)
        } else {
            backoff
        };

        match error.retry_after() {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

/// Result classification of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

/// Record of one attempt; lives only as long as the request
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Backoff waited before this attempt started
    pub elapsed_wait: Duration,
    pub outcome: AttemptOutcome,
}

/// Progress notification emitted before each backoff wait
#[derive(Debug, Clone)]
pub struct RetryNotice<'a> {
    /// The attempt that just failed
    pub attempt: u32,
    pub max_attempts: u32,
    /// Wait before the next attempt
    pub delay: Duration,
    pub error: &'a LlmError,
}

/// Successful pipeline run
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub reply: ChatReply,
    pub attempts: Vec<RetryAttempt>,
}

/// A backend wrapped with a retry policy
pub struct RetryPipeline {
    backend: Arc<dyn ChatBackend>,
    policy: RetryPolicy,
}

impl RetryPipeline {
    pub fn new(backend: Arc<dyn ChatBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Execute one logical call
    ///
    /// Both the call and the backoff wait race against `cancel`; cancellation
    /// returns [`ChatError::Cancelled`] and is never retried. Expiry of the
    /// per-attempt deadline counts as a transient failure.
    pub async fn execute<F>(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        mut on_retry: F,
    ) -> ChatResult<RetryReport>
    where
        F: FnMut(&RetryNotice<'_>),
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempts = Vec::new();
        let mut attempt = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(session_id = %request.session_id, attempt, "Request cancelled mid-call");
                    return Err(ChatError::Cancelled);
                }
                result = tokio::time::timeout(self.policy.request_timeout, self.backend.complete(request)) => {
                    result.unwrap_or(Err(LlmError::Timeout(self.policy.request_timeout)))
                }
            };

            let error = match result {
                Ok(reply) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        elapsed_wait: waited,
                        outcome: AttemptOutcome::Success,
                    });
                    if attempt > 1 {
                        tracing::info!(session_id = %request.session_id, attempt, "Request succeeded after retry");
                    }
                    return Ok(RetryReport { reply, attempts });
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                tracing::warn!(
                    session_id = %request.session_id,
                    attempt,
                    backend = self.backend.name(),
                    "Fatal service error: {}",
                    error
                );
                return Err(ChatError::FatalService(error));
            }

            attempts.push(RetryAttempt {
                attempt,
                elapsed_wait: waited,
                outcome: AttemptOutcome::TransientFailure,
            });

            if attempt >= max_attempts {
                tracing::warn!(
                    session_id = %request.session_id,
                    attempts = attempt,
                    "Retries exhausted: {}",
                    error
                );
                return Err(ChatError::RetryExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.delay_for_retry(attempt, &error);
            tracing::info!(
                session_id = %request.session_id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Transient service error, retrying: {}",
                error
            );
            on_retry(&RetryNotice {
                attempt,
                max_attempts,
                delay,
                error: &error,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(session_id = %request.session_id, attempt, "Request cancelled during backoff");
                    return Err(ChatError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            waited = delay;
        }
    }
}
