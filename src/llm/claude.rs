//! Claude (Anthropic) chat backend
//!
//! SECURITY: the API credential is ONLY sent to the configured Anthropic
//! endpoint and is never logged.

use super::{parse_retry_after, ChatBackend, ChatReply, ChatRequest, LlmError};
use crate::config::LlmConfig;
use crate::core::types::{AttachmentRef, Message, Role, Usage};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Largest image accepted for inlining
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Image media types the service accepts inline
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

pub struct ClaudeBackend {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl ClaudeBackend {
    pub fn new(api_key: impl Into<String>, config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    async fn build_request(&self, request: &ChatRequest) -> Result<ClaudeRequest, LlmError> {
        let mut messages = Vec::with_capacity(request.messages.len());
        for msg in &request.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                // The pinned prompt travels in `system`; stray system entries are skipped
                Role::System => continue,
            };
            messages.push(ClaudeMessage {
                role: role.to_string(),
                content: convert_content(msg).await?,
            });
        }

        Ok(ClaudeRequest {
            model: self.model.clone(),
            max_tokens: request.params.max_output_tokens,
            temperature: request.params.temperature,
            system: (!request.system.is_empty()).then(|| request.system.clone()),
            messages,
        })
    }

    async fn send_request(&self, request: &ClaudeRequest) -> Result<ClaudeResponse, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(LlmError::from_network_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_http_status(status, error_text, retry_after));
        }

        response
            .json::<ClaudeResponse>()
            .await
            .map_err(|e| LlmError::ServiceError(format!("Failed to parse Anthropic response: {}", e)))
    }
}

#[async_trait]
impl ChatBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, LlmError> {
        let claude_request = self.build_request(request).await?;
        tracing::debug!(
            session_id = %request.session_id,
            model = %self.model,
            messages = claude_request.messages.len(),
            "Sending request to Anthropic"
        );

        let response = self.send_request(&claude_request).await?;

        let text = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ClaudeContentBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let usage = response
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        Ok(ChatReply { text, usage })
    }
}

async fn convert_content(msg: &Message) -> Result<ClaudeContent, LlmError> {
    if msg.attachments.is_empty() {
        return Ok(ClaudeContent::Text(msg.content.clone()));
    }

    let mut blocks = Vec::with_capacity(msg.attachments.len() + 1);
    for attachment in &msg.attachments {
        blocks.push(load_image(attachment).await?);
    }
    if !msg.content.is_empty() {
        blocks.push(ClaudeContentBlock::Text {
            text: msg.content.clone(),
        });
    }
    Ok(ClaudeContent::Blocks(blocks))
}

/// Read an image attachment and inline it as base64
async fn load_image(attachment: &AttachmentRef) -> Result<ClaudeContentBlock, LlmError> {
    if !SUPPORTED_IMAGE_TYPES.contains(&attachment.media_type.as_str()) {
        return Err(LlmError::BadRequest(format!(
            "Unsupported attachment type {} for {}",
            attachment.media_type, attachment.name
        )));
    }

    let size = tokio::fs::metadata(&attachment.path)
        .await
        .map_err(|e| LlmError::BadRequest(format!("Cannot read {}: {}", attachment.name, e)))?
        .len();
    if size > MAX_IMAGE_BYTES {
        return Err(LlmError::BadRequest(format!(
            "Attachment {} is {} bytes, limit is {}",
            attachment.name, size, MAX_IMAGE_BYTES
        )));
    }

    let bytes = tokio::fs::read(&attachment.path)
        .await
        .map_err(|e| LlmError::BadRequest(format!("Cannot read {}: {}", attachment.name, e)))?;

    Ok(ClaudeContentBlock::Image {
        source: ImageSource {
            source_type: "base64".to_string(),
            media_type: attachment.media_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        },
    })
}

// Claude API request/response types

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ClaudeMessage>,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: String,
    content: ClaudeContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ClaudeContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContentBlock>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: u64,
    output_tokens: u64,
}
