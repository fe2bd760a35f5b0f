//! One-way notifications from the core to its consumers
//!
//! Events are delivered through an unbounded channel in emission order. The
//! consumer reads them on its own task; nothing is ever called back into the
//! core during delivery.

use super::errors::ErrorKind;
use super::types::Role;
use std::time::Duration;
use tokio::sync::mpsc;

/// Closed set of notifications exposed to presentation layers
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    SessionCreated {
        session_id: String,
    },
    SessionSwitched {
        session_id: String,
    },
    SessionDeleted {
        session_id: String,
    },
    /// Persisted and dropped from memory; still loadable
    SessionEvicted {
        session_id: String,
    },
    MessageAppended {
        session_id: String,
        role: Role,
        /// Position in the session log
        index: usize,
    },
    ErrorOccurred {
        session_id: Option<String>,
        kind: ErrorKind,
        message: String,
    },
    /// A transient failure is about to be retried after `delay`
    RetryAttempted {
        session_id: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
}

/// Sending half shared by the manager and its sessions
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    tx: Option<mpsc::UnboundedSender<CoreEvent>>,
}

impl EventBus {
    /// Create a bus and the receiver the consumer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A bus that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: CoreEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening anymore
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let (bus, mut rx) = EventBus::channel();
        bus.emit(CoreEvent::SessionCreated {
            session_id: "a".into(),
        });
        bus.clone().emit(CoreEvent::SessionSwitched {
            session_id: "a".into(),
        });

        assert_eq!(
            rx.recv().await,
            Some(CoreEvent::SessionCreated {
                session_id: "a".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(CoreEvent::SessionSwitched {
                session_id: "a".into()
            })
        );
    }

    #[test]
    fn test_emit_without_receiver() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        bus.emit(CoreEvent::SessionDeleted {
            session_id: "a".into(),
        });
        EventBus::disabled().emit(CoreEvent::SessionDeleted {
            session_id: "b".into(),
        });
    }
}
