//! Outbound event plumbing.
//!
//! All types in [`events`] derive `serde::Serialize` + `serde::Deserialize` so
//! a host can forward them over whatever bus it uses.

pub mod events;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::RollcapError;
use events::{RecorderEvent, RecorderStatus, RecorderStatusEvent};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Cloneable handle shared by the session actor, the merge worker and the
/// public recorder.
#[derive(Clone)]
pub struct EventSink {
    events_tx: broadcast::Sender<RecorderEvent>,
    status_tx: broadcast::Sender<RecorderStatusEvent>,
    status: Arc<Mutex<RecorderStatus>>,
}

impl EventSink {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            events_tx,
            status_tx,
            status: Arc::new(Mutex::new(RecorderStatus::Idle)),
        }
    }

    pub fn emit(&self, event: RecorderEvent) {
        debug!(?event, "event");
        let _ = self.events_tx.send(event);
    }

    /// Report an error. Non-fatal errors are warnings the session recovered from.
    pub fn error(&self, error: &RollcapError) {
        self.emit(RecorderEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    pub fn set_status(&self, status: RecorderStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(RecorderStatusEvent { status, detail });
    }

    pub fn status(&self) -> RecorderStatus {
        *self.status.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatusEvent> {
        self.status_tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
