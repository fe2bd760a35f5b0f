//! Chat Session - One conversation thread
//!
//! Owns a session's log and settings and drives one exchange at a time:
//! the user message is appended before the remote call so it survives any
//! failure, the context is trimmed, and the retry pipeline produces the reply.

use super::context_manager::ContextManager;
use super::errors::{ChatError, ChatResult};
use super::events::{CoreEvent, EventBus};
use super::prompts::{PromptLibrary, PRESET_HISTORY_LIMIT};
use super::types::{AttachmentRef, GenerationParams, Message, PresetSwitch, Role, SessionRecord, Usage};
use crate::config::GenerationConfig;
use crate::llm::{ChatRequest, RetryPipeline, RetryReport};
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every session of a manager
pub struct SessionServices {
    pub pipeline: RetryPipeline,
    pub context: ContextManager,
    pub limits: GenerationConfig,
    pub events: EventBus,
}

/// A hydrated, mutable session
pub struct ChatSession {
    id: String,
    record: RwLock<SessionRecord>,
    /// Held for the whole exchange; a second sender is rejected, not queued
    send_lock: tokio::sync::Mutex<()>,
    inflight: Mutex<Option<CancellationToken>>,
    /// Bumped on every mutation of `record`
    revision: AtomicU64,
    persisted_revision: AtomicU64,
    last_used: AtomicU64,
    /// Set once the session is deleted; it must never be written again
    deleted: AtomicBool,
    /// Set when eviction persisted this copy and dropped it from the manager
    evicted: AtomicBool,
    services: Arc<SessionServices>,
}

impl ChatSession {
    /// Wrap a freshly created record; it counts as unsaved
    pub fn new(record: SessionRecord, services: Arc<SessionServices>) -> Self {
        Self::build(record, services, 1, 0)
    }

    /// Wrap a record that was just read back from storage
    pub fn hydrated(record: SessionRecord, services: Arc<SessionServices>) -> Self {
        Self::build(record, services, 0, 0)
    }

    fn build(
        record: SessionRecord,
        services: Arc<SessionServices>,
        revision: u64,
        persisted: u64,
    ) -> Self {
        Self {
            id: record.id.clone(),
            record: RwLock::new(record),
            send_lock: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(None),
            revision: AtomicU64::new(revision),
            persisted_revision: AtomicU64::new(persisted),
            last_used: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> String {
        self.read_record().title.clone()
    }

    pub fn system_prompt(&self) -> String {
        self.read_record().system_prompt.clone()
    }

    pub fn params(&self) -> GenerationParams {
        self.read_record().params
    }

    pub fn message_count(&self) -> usize {
        self.read_record().messages.len()
    }

    /// Cumulative token usage reported by the service
    pub fn usage(&self) -> Usage {
        self.read_record().usage
    }

    /// Copy of the full record, including messages trimmed from context
    pub fn snapshot(&self) -> SessionRecord {
        self.read_record().clone()
    }

    /// Snapshot plus the revision it reflects, taken atomically
    pub(crate) fn snapshot_for_persist(&self) -> (SessionRecord, u64) {
        let record = self.read_record();
        (record.clone(), self.revision.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_persisted(&self, revision: u64) {
        self.persisted_revision.fetch_max(revision, Ordering::SeqCst);
    }

    /// In-memory state has changes not yet written to storage
    pub fn is_dirty(&self) -> bool {
        self.revision.load(Ordering::SeqCst) > self.persisted_revision.load(Ordering::SeqCst)
    }

    // Flags flip under the record lock so no mutation lands after them

    pub(crate) fn mark_deleted(&self) {
        let _record = self.write_record();
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_evicted(&self) {
        let _record = self.write_record();
        self.evicted.store(true, Ordering::SeqCst);
    }

    /// Undo `mark_evicted` when the eviction could not persist
    pub(crate) fn clear_evicted(&self) {
        self.evicted.store(false, Ordering::SeqCst);
    }

    /// Deleted or evicted: the manager no longer owns this copy
    pub fn is_detached(&self) -> bool {
        self.is_deleted() || self.evicted.load(Ordering::SeqCst)
    }

    /// Mutations are refused once the manager let go of this copy
    fn ensure_attached(&self) -> ChatResult<()> {
        if self.is_deleted() {
            return Err(ChatError::SessionNotFound(self.id.clone()));
        }
        if self.evicted.load(Ordering::SeqCst) {
            return Err(ChatError::SessionDetached(self.id.clone()));
        }
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.send_lock.try_lock().is_err()
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::SeqCst);
    }

    /// Exclusive access without waiting, `None` while an exchange is running
    pub(crate) fn try_exclusive(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.send_lock.try_lock().ok()
    }

    /// Wait until no exchange is running and keep others out
    pub(crate) async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    /// Abort the running exchange, if any
    pub fn cancel_inflight(&self) {
        if let Some(token) = self.lock_inflight().as_ref() {
            tracing::debug!(session_id = %self.id, "Cancelling in-flight request");
            token.cancel();
        }
    }

    /// Send a text message and wait for the reply
    pub async fn send(&self, text: &str) -> ChatResult<RetryReport> {
        self.send_with_attachments(text, Vec::new(), CancellationToken::new())
            .await
    }

    /// Send a message with attachment references
    ///
    /// Fails with [`ChatError::SessionBusy`] if another exchange is running on
    /// this session. On any failure after the user message was appended, the
    /// message stays in the log.
    pub async fn send_with_attachments(
        &self,
        text: &str,
        attachments: Vec<AttachmentRef>,
        cancel: CancellationToken,
    ) -> ChatResult<RetryReport> {
        let _guard = match self.send_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(session_id = %self.id, "Rejected send on busy session");
                return Err(ChatError::SessionBusy(self.id.clone()));
            }
        };
        // Eviction holds this lock while marking, so the check cannot go stale
        self.ensure_attached()?;

        let token = cancel.child_token();
        *self.lock_inflight() = Some(token.clone());
        let result = self.exchange(text, attachments, &token).await;
        *self.lock_inflight() = None;

        if let Err(e) = &result {
            self.services.events.emit(CoreEvent::ErrorOccurred {
                session_id: Some(self.id.clone()),
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        result
    }

    async fn exchange(
        &self,
        text: &str,
        attachments: Vec<AttachmentRef>,
        cancel: &CancellationToken,
    ) -> ChatResult<RetryReport> {
        let services = &self.services;
        let tokenizer = services.context.tokenizer().clone();
        let message = Message::new(Role::User, text, attachments, tokenizer.as_ref());

        let (index, built) = {
            let mut record = self.write_record();
            self.ensure_attached()?;
            record.set_title_from_prompt(text);
            record.push(message);
            self.bump();
            let index = record.messages.len() - 1;
            let built = services
                .context
                .build_context(&record)
                .map(|window| ChatRequest::from_window(self.id.clone(), window, record.params));
            (index, built)
        };
        services.events.emit(CoreEvent::MessageAppended {
            session_id: self.id.clone(),
            role: Role::User,
            index,
        });
        let request = built?;

        let session_id = self.id.clone();
        let report = services
            .pipeline
            .execute(&request, cancel, |notice| {
                services.events.emit(CoreEvent::RetryAttempted {
                    session_id: session_id.clone(),
                    attempt: notice.attempt,
                    max_attempts: notice.max_attempts,
                    delay: notice.delay,
                });
            })
            .await?;

        let reply = Message::assistant(report.reply.text.clone(), tokenizer.as_ref());
        let index = {
            let mut record = self.write_record();
            record.push(reply);
            record.usage.add(report.reply.usage);
            self.bump();
            record.messages.len() - 1
        };
        services.events.emit(CoreEvent::MessageAppended {
            session_id: self.id.clone(),
            role: Role::Assistant,
            index,
        });

        tracing::debug!(
            session_id = %self.id,
            attempts = report.attempts.len(),
            input_tokens = report.reply.usage.input_tokens,
            output_tokens = report.reply.usage.output_tokens,
            "Exchange completed"
        );
        Ok(report)
    }

    /// Replace the system prompt, effective from the next send
    pub fn switch_system_prompt(&self, prompt: &str) -> ChatResult<()> {
        self.services.context.check_system_prompt(prompt)?;
        let mut record = self.write_record();
        self.ensure_attached()?;
        record.system_prompt = prompt.to_string();
        record.active_preset = None;
        self.bump();
        Ok(())
    }

    /// Replace generation parameters, effective from the next send
    pub fn update_parameters(&self, params: GenerationParams) -> ChatResult<()> {
        params
            .validate(&self.services.limits)
            .map_err(ChatError::InvalidParameters)?;
        let mut record = self.write_record();
        self.ensure_attached()?;
        record.params = params;
        self.bump();
        Ok(())
    }

    /// Adopt a named preset as the system prompt
    pub fn apply_preset(&self, name: &str, library: &PromptLibrary) -> ChatResult<()> {
        let prompt = library
            .get(name)
            .ok_or_else(|| ChatError::InvalidParameters(format!("unknown preset '{}'", name)))?;
        self.services.context.check_system_prompt(prompt)?;

        let mut record = self.write_record();
        self.ensure_attached()?;
        record.system_prompt = prompt.to_string();
        record.active_preset = Some(name.to_string());
        record.preset_history.push(PresetSwitch {
            preset: name.to_string(),
            at: Utc::now(),
        });
        let excess = record.preset_history.len().saturating_sub(PRESET_HISTORY_LIMIT);
        record.preset_history.drain(..excess);
        self.bump();

        tracing::info!(session_id = %self.id, preset = name, "Preset applied");
        Ok(())
    }

    pub fn set_title(&self, title: &str) -> ChatResult<()> {
        let mut record = self.write_record();
        self.ensure_attached()?;
        record.title = title.trim().to_string();
        record.updated_at = Utc::now();
        self.bump();
        Ok(())
    }

    /// Render the full log as Markdown
    pub fn export_markdown(&self) -> String {
        let record = self.read_record();
        let mut out = String::new();

        let title = if record.title.is_empty() {
            "Untitled session"
        } else {
            record.title.as_str()
        };
        let _ = writeln!(out, "# {}\n", title);
        let _ = writeln!(
            out,
            "_Session `{}`, created {}_\n",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if !record.system_prompt.is_empty() {
            let _ = writeln!(out, "> **System:** {}\n", record.system_prompt);
        }

        for message in &record.messages {
            let speaker = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            let _ = writeln!(
                out,
                "## {} ({})\n",
                speaker,
                message.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
            for attachment in &message.attachments {
                let _ = writeln!(out, "- attachment: {} ({})", attachment.name, attachment.media_type);
            }
            if !message.attachments.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "{}\n", message.content);
        }

        if record.usage.total() > 0 {
            let _ = writeln!(
                out,
                "---\n\nTokens used: {} input, {} output",
                record.usage.input_tokens, record.usage.output_tokens
            );
        }
        out
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn read_record(&self) -> RwLockReadGuard<'_, SessionRecord> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_record(&self) -> RwLockWriteGuard<'_, SessionRecord> {
        self.record.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }
}
