use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::SecurityEvent;
use crate::storage::{run_blocking, SharedStore};

/// Totals reported by the writer task when the queue closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitterStats {
    pub written: u64,
    pub failed: u64,
}

/// Fire-and-forget event ingestion.
///
/// `emit` never blocks and never fails the caller: events go into a bounded
/// queue drained by a background writer. A full queue drops the event with
/// a warning. Dropping every clone of the emitter closes the queue and lets
/// the writer finish.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<SecurityEvent>,
}

impl EventEmitter {
    /// Start the writer task. Returns the emitter and a handle that
    /// resolves once every queued event has been written.
    pub fn start(store: SharedStore, capacity: usize) -> (Self, JoinHandle<EmitterStats>) {
        let (tx, mut rx) = mpsc::channel::<SecurityEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            let mut stats = EmitterStats::default();
            while let Some(event) = rx.recv().await {
                let id = event.id;
                let event_type = event.event_type;
                match run_blocking(&store, move |s| s.insert_event(&event)).await {
                    Ok(()) => stats.written += 1,
                    Err(e) => {
                        stats.failed += 1;
                        error!(event = %id, %event_type, error = %e, "failed to persist security event");
                    }
                }
            }
            debug!(written = stats.written, failed = stats.failed, "event writer stopped");
            stats
        });

        (Self { tx }, handle)
    }

    /// Queue an event for persistence. Returns whether it was accepted.
    pub fn emit(&self, event: SecurityEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(event = %event.id, event_type = %event.event_type, "event queue full; dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event = %event.id, event_type = %event.event_type, "event writer stopped; dropping event");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActorType, SecurityEventType};
    use crate::storage::open_store;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_emitted_events_are_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path().join("events.db").to_str().unwrap()).unwrap();
        let (emitter, writer) = EventEmitter::start(store.clone(), 16);

        let now = Utc::now();
        for actor in ["u1", "u2", "u3"] {
            let event = SecurityEvent::new(SecurityEventType::LoginFailed, ActorType::TenantUser, now)
                .with_actor_id(actor);
            assert!(emitter.emit(event));
        }
        drop(emitter);

        let stats = writer.await.unwrap();
        assert_eq!(stats, EmitterStats { written: 3, failed: 0 });

        let since = now - Duration::seconds(1);
        let stored = run_blocking(&store, move |s| s.events_since(SecurityEventType::LoginFailed, since))
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let emitter = EventEmitter { tx };
        let event = || SecurityEvent::new(SecurityEventType::AiRequest, ActorType::System, Utc::now());

        assert!(emitter.emit(event()));
        assert!(!emitter.emit(event()));
    }

    #[tokio::test]
    async fn test_closed_queue_drops() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let emitter = EventEmitter { tx };
        assert!(emitter.is_closed());
        assert!(!emitter.emit(SecurityEvent::new(
            SecurityEventType::LoginSuccess,
            ActorType::TenantUser,
            Utc::now()
        )));
    }
}
