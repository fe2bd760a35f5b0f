//! Domain error types
//!
//! These errors represent the failures callers of the core can observe.
//! Every kind stays distinguishable all the way up to the caller: nothing is
//! collapsed into a string on the way.

use crate::llm::LlmError;
use crate::secure_store::VaultError;
use serde::Serialize;
use thiserror::Error;

/// Closed set of error kinds, as carried by [`CoreEvent::ErrorOccurred`].
///
/// [`CoreEvent::ErrorOccurred`]: crate::core::events::CoreEvent::ErrorOccurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientService,
    FatalService,
    RetryExhausted,
    Cancelled,
    Integrity,
    MalformedBlob,
    SessionNotFound,
    SessionBusy,
    SessionDetached,
    PromptTooLarge,
    InvalidParameters,
    Storage,
    Serialization,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientService => "transient_service",
            Self::FatalService => "fatal_service",
            Self::RetryExhausted => "retry_exhausted",
            Self::Cancelled => "cancelled",
            Self::Integrity => "integrity",
            Self::MalformedBlob => "malformed_blob",
            Self::SessionNotFound => "session_not_found",
            Self::SessionBusy => "session_busy",
            Self::SessionDetached => "session_detached",
            Self::PromptTooLarge => "prompt_too_large",
            Self::InvalidParameters => "invalid_parameters",
            Self::Storage => "storage",
            Self::Serialization => "serialization",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by sessions, the retry pipeline and the conversation manager
#[derive(Debug, Error)]
pub enum ChatError {
    /// A retryable remote failure that was not absorbed by a retry loop
    ///
    /// The retry pipeline never returns this; it is only produced when a
    /// backend is called directly.
    #[error("Transient service error: {0}")]
    TransientService(LlmError),

    /// The remote service rejected the request in a way retrying cannot fix
    #[error("Fatal service error: {0}")]
    FatalService(LlmError),

    /// Every attempt failed with a transient error
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: LlmError },

    /// The caller aborted the exchange
    #[error("Operation cancelled")]
    Cancelled,

    /// Authentication tag did not verify (tampered blob or wrong key)
    #[error("Integrity check failed for session {session_id}")]
    Integrity { session_id: String },

    /// The stored blob (or its decrypted payload) is structurally invalid
    #[error("Malformed blob for session {session_id}: {reason}")]
    MalformedBlob { session_id: String, reason: String },

    /// No active session and no stored blob for this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Another exchange is already in flight on this session
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// The handle was evicted from memory; load the session again to use it
    #[error("Session {0} is no longer active")]
    SessionDetached(String),

    /// The system prompt exceeds its ceiling, or the newest message alone
    /// exceeds the conversation budget
    #[error("Prompt too large: {tokens}/{ceiling} tokens")]
    PromptTooLarge { tokens: usize, ceiling: usize },

    /// Generation parameters or preset operations out of range
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Filesystem failure while reading or writing blobs
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A session record could not be encoded for persistence
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration or secret material is unusable
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientService(_) => ErrorKind::TransientService,
            Self::FatalService(_) => ErrorKind::FatalService,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::MalformedBlob { .. } => ErrorKind::MalformedBlob,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::SessionBusy(_) => ErrorKind::SessionBusy,
            Self::SessionDetached(_) => ErrorKind::SessionDetached,
            Self::PromptTooLarge { .. } => ErrorKind::PromptTooLarge,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Map a vault failure for a specific session onto the storage-corruption kinds
    pub fn from_vault(session_id: &str, err: VaultError) -> Self {
        match err {
            VaultError::Integrity => ChatError::Integrity {
                session_id: session_id.to_string(),
            },
            VaultError::Malformed(reason) => ChatError::MalformedBlob {
                session_id: session_id.to_string(),
                reason,
            },
            VaultError::InvalidKey(reason) => ChatError::Config(reason),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_errors_keep_their_kind() {
        let err = ChatError::from_vault("s1", VaultError::Integrity);
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.to_string(), "Integrity check failed for session s1");

        let err = ChatError::from_vault("s1", VaultError::Malformed("short".into()));
        assert_eq!(err.kind(), ErrorKind::MalformedBlob);
    }

    #[test]
    fn test_retry_exhausted_display_carries_last_failure() {
        let err = ChatError::RetryExhausted {
            attempts: 3,
            last: LlmError::ServiceError("502 bad gateway".into()),
        };
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert!(err.to_string().contains("502 bad gateway"));
    }

    #[test]
    fn test_prompt_too_large_names_no_particular_limit() {
        let err = ChatError::PromptTooLarge {
            tokens: 900,
            ceiling: 500,
        };
        assert_eq!(err.kind(), ErrorKind::PromptTooLarge);
        assert_eq!(err.to_string(), "Prompt too large: 900/500 tokens");
    }
}
