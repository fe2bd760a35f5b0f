//! Core traits for the domain layer
//!
//! These traits define the interfaces that domain components depend on,
//! allowing infrastructure to be injected and tests to use doubles.

use super::types::Role;
use std::io;

/// Tokenizer for estimating tokens in text and messages
///
/// Client-side estimates only need to be deterministic and monotonic in
/// content size; exact accounting is done by the remote service.
pub trait Tokenizer: Send + Sync {
    /// Estimate tokens in a text string
    fn count_tokens(&self, text: &str) -> usize;

    /// Estimate tokens for a message (includes role/formatting overhead)
    fn count_message_tokens(&self, _role: Role, content: &str, attachments: usize) -> usize {
        let overhead = 4;
        overhead + self.count_tokens(content) + attachments * self.attachment_tokens()
    }

    /// Flat estimate charged per attachment reference
    fn attachment_tokens(&self) -> usize {
        0
    }
}

/// Blob storage abstraction: one opaque byte payload per session id
///
/// Implementations must replace blobs atomically so a crash mid-write leaves
/// the previous payload intact.
pub trait SessionStore: Send + Sync {
    /// Read a blob, `Ok(None)` if none is stored for this id
    fn read(&self, id: &str) -> io::Result<Option<Vec<u8>>>;

    /// Atomically replace the blob for this id
    fn write(&self, id: &str, bytes: &[u8]) -> io::Result<()>;

    /// Remove the blob; succeeds if it was already absent
    fn delete(&self, id: &str) -> io::Result<()>;

    /// List all stored ids
    fn list_ids(&self) -> io::Result<Vec<String>>;
}
