//! Core domain modules
//!
//! Sessions, context budgeting, events and the error taxonomy. Presentation
//! layers consume this through `ConversationManager` and `CoreEvent`.

pub mod chat_session;
pub mod context_manager;
pub mod conversation_manager;
pub mod errors;
pub mod events;
pub mod prompts;
pub mod tokenizer;
pub mod traits;
pub mod types;

// Re-export main types for convenience
pub use chat_session::ChatSession;
pub use context_manager::{ContextManager, ContextWindow};
pub use conversation_manager::ConversationManager;
pub use errors::{ChatError, ChatResult, ErrorKind};
pub use events::{CoreEvent, EventBus};
pub use prompts::PromptLibrary;
pub use tokenizer::ApproximateTokenizer;
pub use traits::{SessionStore, Tokenizer};
pub use types::{
    AttachmentRef, GenerationParams, Message, Role, SessionHealth, SessionMeta, SessionRecord,
    Usage,
};
