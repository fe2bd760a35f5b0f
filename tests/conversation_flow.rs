//! Conversation flow tests - full manager stack against a scripted backend
//!
//! Everything below the backend is real: context trimming, retry pipeline,
//! encryption and file storage in a temporary directory.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use vaultchat::core::{ErrorKind, Role, SessionHealth, SessionStore, Usage};
use vaultchat::llm::{ChatBackend, ChatReply, ChatRequest, LlmError};
use vaultchat::{ChatError, Config, ConversationManager, CoreEvent, EventBus, FileBlobStore, Vault};

/// Backend double: pops scripted outcomes, records every request
struct ScriptedBackend {
    outcomes: Mutex<VecDeque<Result<ChatReply, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl ScriptedBackend {
    fn new(outcomes: Vec<Result<ChatReply, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(reply("ok")))
    }
}

fn reply(text: &str) -> ChatReply {
    ChatReply::new(
        text,
        Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    )
}

/// Storage root and key shared by successive managers
struct Harness {
    _temp: TempDir,
    store: Arc<FileBlobStore>,
    key: String,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileBlobStore::new(temp.path().join("sessions")).unwrap());
        Self {
            _temp: temp,
            store,
            key: Vault::generate_key(),
        }
    }

    fn manager(&self, config: &Config, backend: Arc<dyn ChatBackend>) -> ConversationManager {
        self.manager_with_events(config, backend, EventBus::disabled())
    }

    fn manager_with_events(
        &self,
        config: &Config,
        backend: Arc<dyn ChatBackend>,
        events: EventBus,
    ) -> ConversationManager {
        let vault = Arc::new(Vault::from_base64(&self.key).unwrap());
        ConversationManager::new(config, vault, self.store.clone(), backend, events)
    }
}

fn fast_retry_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 500;
    config
}

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_message_context_is_system_plus_hello() {
        let harness = Harness::new();
        let backend = ScriptedBackend::new(vec![Ok(reply("Hi!"))]);
        let manager = harness.manager(&Config::default(), backend.clone());

        let id = manager.create_session(None).unwrap();
        let default_prompt = manager.get_or_load(&id).unwrap().system_prompt();
        manager.send(&id, "hello").await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system, default_prompt);
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::User);
        assert_eq!(requests[0].messages[0].content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success_records_two_attempts() {
        let harness = Harness::new();
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::ServiceError("HTTP 503: unavailable".into())),
            Ok(reply("recovered")),
        ]);
        let manager = harness.manager(&fast_retry_config(), backend.clone());

        let id = manager.create_session(None).unwrap();
        let report = manager.send(&id, "hello").await.unwrap();

        assert_eq!(report.attempts.len(), 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        let record = manager.get_or_load(&id).unwrap().snapshot();
        let roles: Vec<_> = record.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(record.messages[1].content, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_user_message_persisted() {
        let harness = Harness::new();
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Network("reset".into())),
            Err(LlmError::Network("reset".into())),
            Err(LlmError::Network("still down".into())),
        ]);
        let config = fast_retry_config();
        let id = {
            let manager = harness.manager(&config, backend.clone());
            let id = manager.create_session(None).unwrap();
            let err = manager.send(&id, "are you there?").await.unwrap_err();
            assert!(matches!(err, ChatError::RetryExhausted { attempts: 3, .. }));
            id
        };

        // A fresh manager sees the user message on disk
        let manager = harness.manager(&config, ScriptedBackend::new(Vec::new()));
        let record = manager.get_or_load(&id).unwrap().snapshot();
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].content, "are you there?");
    }

    #[tokio::test]
    async fn test_oldest_three_of_ten_trimmed_but_stored() {
        let harness = Harness::new();
        // 396 chars -> 99 tokens + 4 overhead = 103 per message; 7 * 103 = 721
        let long = "x".repeat(396);
        let mut config = Config::default();
        config.context.budget_tokens = 721;

        let mut outcomes: Vec<_> = (0..4).map(|_| Ok(reply(&long))).collect();
        outcomes.push(Err(LlmError::BadRequest("rejected".into())));
        outcomes.push(Err(LlmError::BadRequest("rejected".into())));
        let backend = ScriptedBackend::new(outcomes);

        let id = {
            let manager = harness.manager(&config, backend.clone());
            let id = manager.create_session(None).unwrap();
            for _ in 0..4 {
                manager.send(&id, &long).await.unwrap();
            }
            // Two failed sends leave their user messages: 10 in total
            for _ in 0..2 {
                let err = manager.send(&id, &long).await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::FatalService);
            }
            assert_eq!(manager.get_or_load(&id).unwrap().message_count(), 10);
            id
        };

        let last = backend.requests().pop().unwrap();
        assert_eq!(last.messages.len(), 7);
        let sent: usize = last.messages.iter().map(|m| m.estimated_tokens).sum();
        assert!(sent <= 721);

        let manager = harness.manager(&config, ScriptedBackend::new(Vec::new()));
        let record = manager.get_or_load(&id).unwrap().snapshot();
        assert_eq!(record.messages.len(), 10);
        assert_eq!(&record.messages[3..], &last.messages[..]);
    }

    #[tokio::test]
    async fn test_usage_accumulates_and_persists() {
        let harness = Harness::new();
        let backend = ScriptedBackend::new(vec![Ok(reply("a")), Ok(reply("b"))]);
        let manager = harness.manager(&Config::default(), backend);

        let id = manager.create_session(None).unwrap();
        manager.send(&id, "one").await.unwrap();
        manager.send(&id, "two").await.unwrap();

        let usage = manager.get_or_load(&id).unwrap().usage();
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 10);
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let harness = Harness::new();
        let (events, mut rx) = EventBus::channel();
        let manager = harness.manager_with_events(
            &Config::default(),
            ScriptedBackend::new(vec![Ok(reply("hi"))]),
            events,
        );

        let id = manager.create_session(None).unwrap();
        manager.switch_active(&id).unwrap();
        manager.send(&id, "hello").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                CoreEvent::SessionCreated {
                    session_id: id.clone()
                },
                CoreEvent::SessionSwitched {
                    session_id: id.clone()
                },
                CoreEvent::MessageAppended {
                    session_id: id.clone(),
                    role: Role::User,
                    index: 0
                },
                CoreEvent::MessageAppended {
                    session_id: id.clone(),
                    role: Role::Assistant,
                    index: 1
                },
            ]
        );
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_distinct_sessions_send_concurrently() {
        let harness = Harness::new();
        let backend = ScriptedBackend::new(Vec::new());
        let manager = harness.manager(&Config::default(), backend.clone());

        let a = manager.create_session(None).unwrap();
        let b = manager.create_session(None).unwrap();
        let (ra, rb) = tokio::join!(manager.send(&a, "to a"), manager.send(&b, "to b"));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(manager.get_or_load(&a).unwrap().message_count(), 2);
        assert_eq!(manager.get_or_load(&b).unwrap().message_count(), 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_session_second_send_rejected() {
        let harness = Harness::new();
        let gate = Arc::new(Notify::new());
        let backend = ScriptedBackend::gated(gate.clone());
        let manager = Arc::new(harness.manager(&Config::default(), backend.clone()));

        let id = manager.create_session(None).unwrap();
        let first = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.send(&id, "first").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = manager.send(&id, "second").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionBusy);

        gate.notify_one();
        first.await.unwrap().unwrap();

        let record = manager.get_or_load(&id).unwrap().snapshot();
        let contents: Vec<_> = record.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "ok"]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_cancels_inflight_and_stays_deleted() {
        let harness = Harness::new();
        let gate = Arc::new(Notify::new());
        let backend = ScriptedBackend::gated(gate);
        let manager = Arc::new(harness.manager(&Config::default(), backend.clone()));

        let id = manager.create_session(None).unwrap();
        let pending = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.send(&id, "hello").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        manager.delete_session(&id).await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ChatError::Cancelled));

        assert!(harness.store.read(&id).unwrap().is_none());
        let err = manager.get_or_load(&id).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }
}

mod lifecycle_race_tests {
    use super::*;

    #[tokio::test]
    async fn test_load_while_delete_waits_is_not_found() {
        let harness = Harness::new();
        let gate = Arc::new(Notify::new());
        let backend = ScriptedBackend::gated(gate);
        let manager = Arc::new(harness.manager(&Config::default(), backend.clone()));

        let id = manager.create_session(None).unwrap();
        let pending = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.send(&id, "hello").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Parked on the running exchange, blob still on disk
        let mut delete = Box::pin(manager.delete_session(&id));
        assert!(futures::poll!(delete.as_mut()).is_pending());
        assert!(harness.store.read(&id).unwrap().is_some());

        let err = manager.get_or_load(&id).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        let err = manager.send(&id, "again").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        assert!(manager.switch_active(&id).is_err());
        assert!(manager.list_sessions().unwrap().is_empty());

        delete.await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(ChatError::Cancelled)));

        assert!(harness.store.read(&id).unwrap().is_none());
        assert!(!manager.is_active(&id));
        manager.flush_all().unwrap();
        assert!(harness.store.read(&id).unwrap().is_none());
        let err = manager.get_or_load(&id).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn test_handle_kept_after_eviction_refuses_send() {
        let harness = Harness::new();
        let mut config = Config::default();
        config.sessions.max_active = 1;
        let backend = ScriptedBackend::new(Vec::new());

        let a = {
            let manager = harness.manager(&config, backend.clone());
            let a = manager.create_session(None).unwrap();
            let handle = manager.get_or_load(&a).unwrap();
            manager.create_session(None).unwrap();
            assert!(!manager.is_active(&a));
            assert!(handle.is_detached());

            let err = handle.send("orphaned message").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SessionDetached);
            assert_eq!(handle.message_count(), 0);
            assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

            // Going through the manager reloads the session
            manager.send(&a, "kept message").await.unwrap();
            manager.shutdown().await.unwrap();
            a
        };

        let manager = harness.manager(&config, ScriptedBackend::new(Vec::new()));
        let record = manager.get_or_load(&a).unwrap().snapshot();
        let contents: Vec<_> = record.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["kept message", "ok"]);
    }

    #[tokio::test]
    async fn test_busy_session_survives_eviction_pressure() {
        let harness = Harness::new();
        let mut config = Config::default();
        config.sessions.max_active = 1;
        let gate = Arc::new(Notify::new());
        let backend = ScriptedBackend::gated(gate.clone());
        let manager = Arc::new(harness.manager(&config, backend.clone()));

        let a = manager.create_session(None).unwrap();
        let pending = {
            let manager = manager.clone();
            let a = a.clone();
            tokio::spawn(async move { manager.send(&a, "mid-flight").await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Cannot evict a session with a send in flight
        let b = manager.create_session(None).unwrap();
        assert!(manager.is_active(&a));
        assert_eq!(manager.active_count(), 2);

        gate.notify_one();
        pending.await.unwrap().unwrap();

        // Once idle both older sessions give way to a new one
        let c = manager.create_session(None).unwrap();
        assert_eq!(manager.active_count(), 1);
        assert!(manager.is_active(&c));
        assert!(!manager.is_active(&a));
        assert!(!manager.is_active(&b));
        let record = manager.get_or_load(&a).unwrap().snapshot();
        assert_eq!(record.messages.len(), 2);
    }
}

mod storage_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_then_load_is_not_found() {
        let harness = Harness::new();
        let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));

        let id = manager.create_session(None).unwrap();
        manager.send(&id, "hello").await.unwrap();
        manager.delete_session(&id).await.unwrap();

        assert!(harness.store.read(&id).unwrap().is_none());
        let err = manager.get_or_load(&id).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);

        // Idempotent
        manager.delete_session(&id).await.unwrap();
        manager.delete_session("session_never_existed").await.unwrap();
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let harness = Harness::new();
        let id = harness
            .manager(&Config::default(), ScriptedBackend::new(Vec::new()))
            .create_session(Some("private"))
            .unwrap();

        let other_vault = Arc::new(Vault::from_base64(&Vault::generate_key()).unwrap());
        let manager = ConversationManager::new(
            &Config::default(),
            other_vault,
            harness.store.clone(),
            ScriptedBackend::new(Vec::new()),
            EventBus::disabled(),
        );
        let err = manager.get_or_load(&id).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_corrupt_blob_does_not_block_others() {
        let harness = Harness::new();
        let (good, bad) = {
            let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));
            let good = manager.create_session(Some("good")).unwrap();
            let bad = manager.create_session(Some("bad")).unwrap();
            (good, bad)
        };

        let mut bytes = harness.store.read(&bad).unwrap().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        harness.store.write(&bad, &bytes).unwrap();

        let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));
        let sessions = manager.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let bad_meta = sessions.iter().find(|m| m.id == bad).unwrap();
        assert_eq!(bad_meta.health, SessionHealth::Unreadable(ErrorKind::Integrity));
        let good_meta = sessions.iter().find(|m| m.id == good).unwrap();
        assert_eq!(good_meta.health, SessionHealth::Ok);
        assert_eq!(good_meta.title, "good");

        assert_eq!(
            manager.get_or_load(&bad).err().unwrap().kind(),
            ErrorKind::Integrity
        );
        assert_eq!(manager.get_or_load(&good).unwrap().title(), "good");
    }

    #[test]
    fn test_eviction_persists_dirty_session_first() {
        let harness = Harness::new();
        let mut config = Config::default();
        config.sessions.max_active = 1;
        let (events, mut rx) = EventBus::channel();

        let first = {
            let manager =
                harness.manager_with_events(&config, ScriptedBackend::new(Vec::new()), events);
            let first = manager.create_session(None).unwrap();
            // Unsaved change, only held in memory
            manager
                .get_or_load(&first)
                .unwrap()
                .switch_system_prompt("Remember this.")
                .unwrap();

            manager.create_session(None).unwrap();
            assert!(!manager.is_active(&first));
            assert_eq!(manager.active_count(), 1);
            first
        };

        let evicted = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| {
            e == CoreEvent::SessionEvicted {
                session_id: first.clone(),
            }
        });
        assert!(evicted);

        let manager = harness.manager(&config, ScriptedBackend::new(Vec::new()));
        assert_eq!(
            manager.get_or_load(&first).unwrap().system_prompt(),
            "Remember this."
        );
    }

    #[tokio::test]
    async fn test_shutdown_flushes_dirty_sessions() {
        let harness = Harness::new();
        let id = {
            let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));
            let id = manager.create_session(None).unwrap();
            manager
                .get_or_load(&id)
                .unwrap()
                .switch_system_prompt("Flushed at shutdown.")
                .unwrap();
            manager.shutdown().await.unwrap();
            id
        };

        let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));
        assert_eq!(
            manager.get_or_load(&id).unwrap().system_prompt(),
            "Flushed at shutdown."
        );
    }

    #[test]
    fn test_list_sessions_without_hydration() {
        let harness = Harness::new();
        let id = {
            let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));
            manager.create_session(Some("Dormant")).unwrap()
        };

        let manager = harness.manager(&Config::default(), ScriptedBackend::new(Vec::new()));
        let sessions = manager.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].title, "Dormant");
        assert!(!sessions[0].is_active);
        assert!(!manager.is_active(&id));
    }
}
