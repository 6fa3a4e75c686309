//! Append-only run event stream: persisted through the store for audit, and
//! fanned out on an in-process broadcast channel for live observers inside
//! the runtime. This keeps the wiring flexible while collaborators decide on
//! an external transport.

use std::fmt;
use std::sync::Arc;

use tabula_model::RunEvent;
use tokio::sync::broadcast;

use crate::store::RunStore;

pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

pub struct EventSink<S> {
    store: Arc<S>,
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl<S> Clone for EventSink<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

impl<S> fmt::Debug for EventSink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<S: RunStore> EventSink<S> {
    pub fn new(store: Arc<S>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            store,
            sender,
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Persist the event and fan it out. Persistence failures are logged
    /// rather than propagated: the event stream is observational and must not
    /// fail the state transition it describes.
    pub async fn publish(&self, event: RunEvent) {
        if let Err(err) = self.store.append_event(&event).await {
            tracing::warn!(
                target: "engine::events",
                run = %event.run_id,
                kind = %event.kind,
                error = %err,
                "failed to persist run event"
            );
        }
        let _ = self.sender.send(event);
    }
}
