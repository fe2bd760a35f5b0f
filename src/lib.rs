//! vaultchat: encrypted multi-session chat client core
//!
//! This library provides:
//! - Concurrent chat sessions against a remote conversational service
//! - Recency-based context trimming within a token budget
//! - A retrying, cancellable request pipeline
//! - At-rest encryption of every session as one atomically replaced blob

pub mod config;
pub mod core;
pub mod llm;
pub mod secure_store;
pub mod storage;

pub use config::{Config, Secrets};
pub use core::{ChatError, ConversationManager, CoreEvent, EventBus};
pub use secure_store::Vault;
pub use storage::FileBlobStore;
