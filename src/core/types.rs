//! Canonical type definitions for the core domain
//!
//! `SessionRecord` is the stable persisted schema: it is what gets serialized,
//! encrypted and written as one blob per session id.

use super::traits::Tokenizer;
use crate::config::GenerationConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current version of the persisted `SessionRecord` layout
pub const SCHEMA_VERSION: u32 = 1;

/// Longest auto-derived session title, in characters
const TITLE_MAX_CHARS: usize = 50;

/// Role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Reference to an attachment kept outside the session log
///
/// Only the reference is stored; the payload is resolved by the backend at
/// request time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRef {
    pub name: String,
    pub media_type: String,
    pub path: String,
}

impl AttachmentRef {
    pub fn new(
        name: impl Into<String>,
        media_type: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            path: path.into(),
        }
    }

    /// Reference a local file, guessing the media type from its extension
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let media_type = match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "txt" | "md" => "text/plain",
            "pdf" => "application/pdf",
            _ => "application/octet-stream",
        };
        Self::new(name, media_type, path.to_string_lossy())
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// One entry of a session log. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    pub timestamp: DateTime<Utc>,
    pub estimated_tokens: usize,
}

impl Message {
    pub fn new(
        role: Role,
        content: impl Into<String>,
        attachments: Vec<AttachmentRef>,
        tokenizer: &dyn Tokenizer,
    ) -> Self {
        let content = content.into();
        let estimated_tokens = tokenizer.count_message_tokens(role, &content, attachments.len());
        Self {
            role,
            content,
            attachments,
            timestamp: Utc::now(),
            estimated_tokens,
        }
    }

    pub fn user(content: impl Into<String>, tokenizer: &dyn Tokenizer) -> Self {
        Self::new(Role::User, content, Vec::new(), tokenizer)
    }

    pub fn assistant(content: impl Into<String>, tokenizer: &dyn Tokenizer) -> Self {
        Self::new(Role::Assistant, content, Vec::new(), tokenizer)
    }
}

/// Per-session generation settings, bounded by [`GenerationConfig`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl GenerationParams {
    pub fn defaults(limits: &GenerationConfig) -> Self {
        Self {
            max_output_tokens: limits.default_max_output_tokens,
            temperature: limits.default_temperature,
        }
    }

    pub fn validate(&self, limits: &GenerationConfig) -> Result<(), String> {
        if self.max_output_tokens == 0 || self.max_output_tokens > limits.max_output_tokens_ceiling
        {
            return Err(format!(
                "max_output_tokens must be in 1..={}, got {}",
                limits.max_output_tokens_ceiling, self.max_output_tokens
            ));
        }
        if !self.temperature.is_finite()
            || self.temperature < limits.min_temperature
            || self.temperature > limits.max_temperature
        {
            return Err(format!(
                "temperature must be in {}..={}, got {}",
                limits.min_temperature, limits.max_temperature, self.temperature
            ));
        }
        Ok(())
    }
}

/// Cumulative token usage reported by the remote service
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A change of prompt preset, kept for history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetSwitch {
    pub preset: String,
    pub at: DateTime<Utc>,
}

/// Everything persisted for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub schema_version: u32,
    pub id: String,
    /// Session title (derived from first prompt unless set explicitly)
    pub title: String,
    pub system_prompt: String,
    #[serde(default)]
    pub active_preset: Option<String>,
    #[serde(default)]
    pub preset_history: Vec<PresetSwitch>,
    pub params: GenerationParams,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(system_prompt: impl Into<String>, params: GenerationParams) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            // UUID v4 for collision-free ids across processes
            id: format!("session_{}", uuid::Uuid::new_v4()),
            title: String::new(),
            system_prompt: system_prompt.into(),
            active_preset: None,
            preset_history: Vec::new(),
            params,
            messages: Vec::new(),
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the title from the first prompt if none was given
    pub fn set_title_from_prompt(&mut self, prompt: &str) {
        if !self.title.is_empty() {
            return;
        }
        let first_line = prompt.trim().lines().next().unwrap_or_default().trim();
        let name = first_line
            .chars()
            .take(TITLE_MAX_CHARS)
            .collect::<String>()
            .trim_end()
            .to_string();
        self.title = if name.is_empty() {
            format!("Session {}", self.created_at.format("%H:%M"))
        } else if first_line.chars().count() > TITLE_MAX_CHARS {
            format!("{}...", name)
        } else {
            name
        };
    }

    pub fn push(&mut self, message: Message) {
        self.updated_at = message.timestamp;
        self.messages.push(message);
    }
}

/// Just the listing fields of a persisted record; message bodies are skipped
#[derive(Debug, Deserialize)]
pub(crate) struct SessionHeader {
    pub id: String,
    pub title: String,
    pub messages: Vec<serde::de::IgnoredAny>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a listed session can be hydrated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum SessionHealth {
    Ok,
    Unreadable(super::errors::ErrorKind),
}

/// Session metadata for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    /// Hydrated in memory
    pub is_active: bool,
    /// The designated foreground session
    pub is_foreground: bool,
    pub health: SessionHealth,
}

impl From<&SessionRecord> for SessionMeta {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            updated_at: Some(record.updated_at),
            message_count: record.messages.len(),
            is_active: false,     // Will be set by caller
            is_foreground: false, // Will be set by caller
            health: SessionHealth::Ok,
        }
    }
}

impl From<SessionHeader> for SessionMeta {
    fn from(header: SessionHeader) -> Self {
        Self {
            id: header.id,
            title: header.title,
            updated_at: Some(header.updated_at),
            message_count: header.messages.len(),
            is_active: false,
            is_foreground: false,
            health: SessionHealth::Ok,
        }
    }
}
