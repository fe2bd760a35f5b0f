//! Conversation Manager - Session lifecycle and encrypted persistence
//!
//! Handles:
//! - Creating, hydrating, listing and deleting sessions
//! - Serializing, encrypting and atomically storing each session as one blob
//! - Foreground designation and LRU eviction of hydrated sessions
//!
//! Persistence is serialized per session id; different ids never wait on each
//! other. Loading, evicting and deleting an id take the same per-id lock, so a
//! copy is never hydrated from a blob that is about to change or vanish.
//! Eviction persists first and never touches a session with a send in flight
//! or the foreground session. An evicted or deleted copy refuses changes.

use super::chat_session::{ChatSession, SessionServices};
use super::context_manager::ContextManager;
use super::errors::{ChatError, ChatResult};
use super::events::{CoreEvent, EventBus};
use super::prompts::PromptLibrary;
use super::tokenizer::ApproximateTokenizer;
use super::traits::SessionStore;
use super::types::{
    AttachmentRef, GenerationParams, SessionHeader, SessionHealth, SessionMeta, SessionRecord,
    SCHEMA_VERSION,
};
use crate::config::Config;
use crate::llm::{ChatBackend, RetryPipeline, RetryPolicy, RetryReport};
use crate::secure_store::{EncryptedBlob, Vault};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Reloads attempted when a fetched copy was evicted before it could be used
const DETACHED_RELOADS: usize = 3;

/// Owner of every session in one storage root
pub struct ConversationManager {
    vault: Arc<Vault>,
    store: Arc<dyn SessionStore>,
    services: Arc<SessionServices>,
    prompts: RwLock<PromptLibrary>,
    active: DashMap<String, Arc<ChatSession>>,
    persist_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Ids with a delete in progress; they cannot be loaded
    deleting: DashSet<String>,
    foreground: Mutex<Option<String>>,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    max_active: usize,
    events: EventBus,
}

impl ConversationManager {
    pub fn new(
        config: &Config,
        vault: Arc<Vault>,
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn ChatBackend>,
        events: EventBus,
    ) -> Self {
        let tokenizer = Arc::new(ApproximateTokenizer::new(config.context.attachment_tokens));
        let services = Arc::new(SessionServices {
            pipeline: RetryPipeline::new(backend, RetryPolicy::from_config(&config.retry)),
            context: ContextManager::new(
                tokenizer,
                config.context.budget_tokens,
                config.context.system_prompt_ceiling,
            ),
            limits: config.generation.clone(),
            events: events.clone(),
        });

        Self {
            vault,
            store,
            services,
            prompts: RwLock::new(PromptLibrary::new()),
            active: DashMap::new(),
            persist_locks: DashMap::new(),
            deleting: DashSet::new(),
            foreground: Mutex::new(None),
            clock: AtomicU64::new(0),
            max_active: config.sessions.max_active.max(1),
            events,
        }
    }

    /// Create an empty session with the default preset and persist it
    pub fn create_session(&self, title: Option<&str>) -> ChatResult<String> {
        let system_prompt = self.read_prompts().default_prompt().to_string();
        let mut record = SessionRecord::new(
            system_prompt,
            GenerationParams::defaults(&self.services.limits),
        );
        if let Some(title) = title {
            record.title = title.trim().to_string();
        }
        let id = record.id.clone();

        let session = Arc::new(ChatSession::new(record, self.services.clone()));
        self.touch(&session);
        self.active.insert(id.clone(), session.clone());
        self.persist_session(&session)?;

        tracing::info!(session_id = %id, "Session created");
        self.events.emit(CoreEvent::SessionCreated {
            session_id: id.clone(),
        });
        self.evict_if_needed(&id);
        Ok(id)
    }

    /// Return the active session or hydrate it from its stored blob
    pub fn get_or_load(&self, id: &str) -> ChatResult<Arc<ChatSession>> {
        if self.deleting.contains(id) {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }
        if let Some(session) = self.attached(id) {
            self.touch(&session);
            return Ok(session);
        }

        let session = {
            let lock = self.persist_lock(id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            if self.deleting.contains(id) {
                return Err(ChatError::SessionNotFound(id.to_string()));
            }
            // Another load may have won while this one waited for the lock
            match self.attached(id) {
                Some(session) => session,
                None => {
                    let record = self.load_record(id)?;
                    let session = Arc::new(ChatSession::hydrated(record, self.services.clone()));
                    // Replaces any evicted copy still in the map
                    self.active.insert(id.to_string(), session.clone());
                    tracing::info!(session_id = %id, messages = session.message_count(), "Session loaded");
                    session
                }
            }
        };

        self.touch(&session);
        self.evict_if_needed(id);
        Ok(session)
    }

    /// Metadata for every known session, newest first
    ///
    /// Dormant sessions are decrypted but only their header fields are parsed.
    /// A blob that cannot be read is listed with its error instead of failing
    /// the whole listing.
    pub fn list_sessions(&self) -> ChatResult<Vec<SessionMeta>> {
        let foreground = self.foreground();
        let mut ids = self.store.list_ids()?;
        for entry in self.active.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids.retain(|id| !self.deleting.contains(id));

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let active = self.attached(&id);
            let mut meta = match &active {
                Some(session) => SessionMeta::from(&session.snapshot()),
                None => match self.load_header(&id) {
                    Ok(header) => SessionMeta::from(header),
                    Err(e) => {
                        tracing::warn!(session_id = %id, kind = %e.kind(), "Unreadable session blob");
                        SessionMeta {
                            id: id.clone(),
                            title: String::new(),
                            updated_at: None,
                            message_count: 0,
                            is_active: false,
                            is_foreground: false,
                            health: SessionHealth::Unreadable(e.kind()),
                        }
                    }
                },
            };
            meta.is_active = active.is_some();
            meta.is_foreground = foreground.as_deref() == Some(meta.id.as_str());
            sessions.push(meta);
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Remove a session from memory and storage; succeeds if it never existed
    ///
    /// A running exchange on the session is cancelled and awaited first.
    pub async fn delete_session(&self, id: &str) -> ChatResult<()> {
        let first = self.deleting.insert(id.to_string());
        let result = self.remove_everywhere(id).await;
        if first {
            self.deleting.remove(id);
        }
        result?;

        {
            let mut foreground = self.lock_foreground();
            if foreground.as_deref() == Some(id) {
                *foreground = None;
            }
        }

        tracing::info!(session_id = %id, "Session deleted");
        self.events.emit(CoreEvent::SessionDeleted {
            session_id: id.to_string(),
        });
        Ok(())
    }

    async fn remove_everywhere(&self, id: &str) -> ChatResult<()> {
        if let Some((_, session)) = self.active.remove(id) {
            session.mark_deleted();
            session.cancel_inflight();
            let _exclusive = session.exclusive().await;
        }

        let straggler = {
            let lock = self.persist_lock(id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            // Hydrated before the id was marked as deleting
            let straggler = self.active.remove(id).map(|(_, session)| session);
            if let Some(session) = &straggler {
                session.mark_deleted();
                session.cancel_inflight();
            }
            match self.store.delete(id) {
                Ok(()) => {}
                // Ids that cannot name a blob have nothing to delete
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => return Err(e.into()),
            }
            straggler
        };
        if let Some(session) = straggler {
            let _exclusive = session.exclusive().await;
        }
        self.persist_locks.remove(id);
        Ok(())
    }

    /// Write the session's current state to storage if it changed
    ///
    /// Dormant sessions are already durable and need nothing.
    pub fn persist(&self, id: &str) -> ChatResult<()> {
        if self.deleting.contains(id) {
            return Err(ChatError::SessionNotFound(id.to_string()));
        }
        match self.attached(id) {
            Some(session) => self.persist_session(&session),
            None => match self.store.read(id) {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(ChatError::SessionNotFound(id.to_string())),
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                    Err(ChatError::SessionNotFound(id.to_string()))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Designate the foreground session, hydrating it if needed
    ///
    /// Other sessions stay hydrated; only the eviction policy drops them.
    pub fn switch_active(&self, id: &str) -> ChatResult<Arc<ChatSession>> {
        let session = self.get_or_load(id)?;
        *self.lock_foreground() = Some(id.to_string());
        tracing::info!(session_id = %id, "Switched foreground session");
        self.events.emit(CoreEvent::SessionSwitched {
            session_id: id.to_string(),
        });
        Ok(session)
    }

    pub fn foreground(&self) -> Option<String> {
        self.lock_foreground().clone()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.attached(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn rename_session(&self, id: &str, title: &str) -> ChatResult<()> {
        self.with_session(id, |session| {
            session.set_title(title)?;
            self.persist_session(session)
        })
    }

    /// Send a text message on a session and persist the result
    pub async fn send(&self, id: &str, text: &str) -> ChatResult<RetryReport> {
        self.send_with_attachments(id, text, Vec::new(), CancellationToken::new())
            .await
    }

    /// Send with attachments and a caller cancellation token
    ///
    /// The log is persisted whether or not the exchange succeeded, so an
    /// appended user message is never lost.
    pub async fn send_with_attachments(
        &self,
        id: &str,
        text: &str,
        attachments: Vec<AttachmentRef>,
        cancel: CancellationToken,
    ) -> ChatResult<RetryReport> {
        let mut reloads = 0;
        let (session, result) = loop {
            let session = self.get_or_load(id)?;
            // Only a copy evicted before the send took its lock ends up here,
            // and that copy was left untouched
            match session
                .send_with_attachments(text, attachments.clone(), cancel.clone())
                .await
            {
                Err(ChatError::SessionDetached(_)) if reloads < DETACHED_RELOADS => reloads += 1,
                result => break (session, result),
            }
        };
        self.touch(&session);

        if let Err(e) = self.persist_session(&session) {
            tracing::error!(session_id = %id, "Failed to persist session: {}", e);
            self.events.emit(CoreEvent::ErrorOccurred {
                session_id: Some(id.to_string()),
                kind: e.kind(),
                message: e.to_string(),
            });
            // The exchange error, if any, is the more specific one
            result?;
            return Err(e);
        }
        result
    }

    /// Apply a named preset to a session
    pub fn apply_preset(&self, id: &str, preset: &str) -> ChatResult<()> {
        self.with_session(id, |session| {
            session.apply_preset(preset, &self.read_prompts())?;
            self.persist_session(session)
        })
    }

    pub fn add_custom_preset(&self, name: &str, prompt: &str) -> ChatResult<()> {
        self.write_prompts().add_custom(name, prompt)
    }

    pub fn remove_custom_preset(&self, name: &str) -> ChatResult<()> {
        self.write_prompts().remove_custom(name)
    }

    pub fn preset_names(&self) -> Vec<String> {
        self.read_prompts()
            .names()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Persist every dirty hydrated session
    ///
    /// Keeps going after a failure and returns the first error.
    pub fn flush_all(&self) -> ChatResult<()> {
        let sessions: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        let mut first_error = None;
        for session in sessions {
            if let Err(e) = self.persist_session(&session) {
                tracing::error!(session_id = %session.id(), "Flush failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Cancel running exchanges, wait for them to settle and flush everything
    pub async fn shutdown(&self) -> ChatResult<()> {
        let sessions: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        for session in &sessions {
            session.cancel_inflight();
        }
        // Guards are dropped right away; this only waits for running exchanges
        futures::future::join_all(sessions.iter().map(|s| s.exclusive())).await;
        let result = self.flush_all();
        tracing::info!(sessions = sessions.len(), "Conversation manager shut down");
        result
    }

    /// Evict least recently used sessions above the active bound
    ///
    /// `keep` is the session the caller is about to use.
    fn evict_if_needed(&self, keep: &str) {
        while self.active.len() > self.max_active {
            let foreground = self.foreground();
            let mut candidates: Vec<Arc<ChatSession>> = self
                .active
                .iter()
                .map(|e| e.value().clone())
                .filter(|s| s.id() != keep && foreground.as_deref() != Some(s.id()))
                .collect();
            candidates.sort_by_key(|s| s.last_used());

            let mut evicted = false;
            for session in candidates {
                // Same lock as `send`: a session mid-exchange is skipped
                let Some(_exclusive) = session.try_exclusive() else {
                    continue;
                };
                if let Err(e) = self.evict_persist(&session) {
                    tracing::error!(session_id = %session.id(), "Not evicting, persist failed: {}", e);
                    continue;
                }
                // A reload may already have replaced this copy
                self.active
                    .remove_if(session.id(), |_, current| Arc::ptr_eq(current, &session));
                tracing::debug!(session_id = %session.id(), "Session evicted");
                self.events.emit(CoreEvent::SessionEvicted {
                    session_id: session.id().to_string(),
                });
                evicted = true;
                break;
            }

            if !evicted {
                tracing::debug!(
                    active = self.active.len(),
                    max_active = self.max_active,
                    "No session can be evicted right now"
                );
                break;
            }
        }
    }

    /// Detach and persist under the id's lock; a load waits for both
    fn evict_persist(&self, session: &ChatSession) -> ChatResult<()> {
        let lock = self.persist_lock(session.id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        session.mark_evicted();
        let result = self.write_blob(session);
        if result.is_err() {
            session.clear_evicted();
        }
        result
    }

    fn persist_session(&self, session: &ChatSession) -> ChatResult<()> {
        let lock = self.persist_lock(session.id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_blob(session)
    }

    /// Caller holds the id's persist lock
    fn write_blob(&self, session: &ChatSession) -> ChatResult<()> {
        let id = session.id();
        if session.is_deleted() || !session.is_dirty() {
            return Ok(());
        }

        let (record, revision) = session.snapshot_for_persist();
        let plaintext = serde_json::to_vec(&record)?;
        let blob = self
            .vault
            .encrypt_bound(&plaintext, id.as_bytes())
            .map_err(|e| ChatError::from_vault(id, e))?;
        let bytes = blob.to_bytes();
        self.store.write(id, &bytes)?;
        session.mark_persisted(revision);

        tracing::debug!(
            session_id = %id,
            messages = record.messages.len(),
            bytes = bytes.len(),
            "Session persisted"
        );
        Ok(())
    }

    fn read_plaintext(&self, id: &str) -> ChatResult<Vec<u8>> {
        let bytes = match self.store.read(id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(ChatError::SessionNotFound(id.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                return Err(ChatError::SessionNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let blob = EncryptedBlob::from_bytes(&bytes).map_err(|e| ChatError::from_vault(id, e))?;
        self.vault
            .decrypt_bound(&blob, id.as_bytes())
            .map_err(|e| ChatError::from_vault(id, e))
    }

    fn load_record(&self, id: &str) -> ChatResult<SessionRecord> {
        let plaintext = self.read_plaintext(id)?;
        let record: SessionRecord =
            serde_json::from_slice(&plaintext).map_err(|e| ChatError::MalformedBlob {
                session_id: id.to_string(),
                reason: e.to_string(),
            })?;

        if record.schema_version > SCHEMA_VERSION {
            return Err(ChatError::MalformedBlob {
                session_id: id.to_string(),
                reason: format!("unsupported schema version {}", record.schema_version),
            });
        }
        if record.id != id {
            return Err(ChatError::MalformedBlob {
                session_id: id.to_string(),
                reason: "stored id does not match".to_string(),
            });
        }
        Ok(record)
    }

    fn load_header(&self, id: &str) -> ChatResult<SessionHeader> {
        let plaintext = self.read_plaintext(id)?;
        serde_json::from_slice(&plaintext).map_err(|e| ChatError::MalformedBlob {
            session_id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// The mapped copy for `id`, unless it was already evicted
    fn attached(&self, id: &str) -> Option<Arc<ChatSession>> {
        self.active
            .get(id)
            .map(|s| s.value().clone())
            .filter(|s| !s.is_detached())
    }

    /// Run a synchronous change, reloading once more if eviction raced it
    fn with_session<T>(
        &self,
        id: &str,
        change: impl Fn(&Arc<ChatSession>) -> ChatResult<T>,
    ) -> ChatResult<T> {
        let mut reloads = 0;
        loop {
            let session = self.get_or_load(id)?;
            match change(&session) {
                Err(ChatError::SessionDetached(_)) if reloads < DETACHED_RELOADS => reloads += 1,
                result => return result,
            }
        }
    }

    fn touch(&self, session: &ChatSession) {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        session.touch(tick);
    }

    fn persist_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.persist_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn lock_foreground(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.foreground.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_prompts(&self) -> std::sync::RwLockReadGuard<'_, PromptLibrary> {
        self.prompts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_prompts(&self) -> std::sync::RwLockWriteGuard<'_, PromptLibrary> {
        self.prompts.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ConversationManager {
    fn drop(&mut self) {
        // Last chance for sessions nobody flushed explicitly
        if let Err(e) = self.flush_all() {
            tracing::error!("Flush on drop failed: {}", e);
        }
    }
}
