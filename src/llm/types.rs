//! Request and reply types exchanged with a chat backend

use crate::core::context_manager::ContextWindow;
use crate::core::types::{GenerationParams, Message, Usage};

/// One outbound exchange: the trimmed context plus generation settings
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Owning session, for log correlation only
    pub session_id: String,
    /// Pinned system prompt
    pub system: String,
    /// Chronological context suffix; the last entry is the message being answered
    pub messages: Vec<Message>,
    pub params: GenerationParams,
}

impl ChatRequest {
    pub fn from_window(
        session_id: impl Into<String>,
        window: ContextWindow,
        params: GenerationParams,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            system: window.system_prompt,
            messages: window.messages,
            params,
        }
    }
}

/// Assistant text plus the service's token accounting for the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub usage: Usage,
}

impl ChatReply {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}
