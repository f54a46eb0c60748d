// Upward notifications to the host bridge.
//
// The bridge implements `LinkObserver`; the link holds it in an
// `ObserverSlot` so it can be swapped or cleared at runtime while sessions
// keep delivering through the same slot.

use crate::{LinkError, Role};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback interface for link events.
///
/// Calls are made synchronously from the link's single event loop, in the
/// order the events happened.
pub trait LinkObserver: Send + Sync {
    /// A channel opened and is writable
    fn on_opened(&self, role: Role);
    /// A complete message was reassembled
    fn on_message(&self, role: Role, message: String);
    /// The channel closed; any partial message was discarded
    fn on_closed(&self, role: Role);
    /// A connection attempt failed terminally
    fn on_error(&self, role: Role, error: &LinkError) {
        let _ = (role, error);
    }
}

/// Event record with the same names the host bridge uses on its event channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LinkEvent {
    #[serde(rename = "connected")]
    Opened { role: Role },
    #[serde(rename = "onmessage")]
    Message { role: Role, data: String },
    Closed { role: Role },
    Error { role: Role, message: String },
}

impl LinkObserver for mpsc::UnboundedSender<LinkEvent> {
    fn on_opened(&self, role: Role) {
        let _ = self.send(LinkEvent::Opened { role });
    }

    fn on_message(&self, role: Role, message: String) {
        let _ = self.send(LinkEvent::Message { role, data: message });
    }

    fn on_closed(&self, role: Role) {
        let _ = self.send(LinkEvent::Closed { role });
    }

    fn on_error(&self, role: Role, error: &LinkError) {
        let _ = self.send(LinkEvent::Error {
            role,
            message: error.to_string(),
        });
    }
}

/// Shared, replaceable observer reference
#[derive(Clone, Default)]
pub struct ObserverSlot(Arc<RwLock<Option<Arc<dyn LinkObserver>>>>);

impl ObserverSlot {
    pub fn new(observer: Arc<dyn LinkObserver>) -> Self {
        Self(Arc::new(RwLock::new(Some(observer))))
    }

    /// An empty slot; events are dropped until an observer is set
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, observer: Option<Arc<dyn LinkObserver>>) {
        *self.0.write() = observer;
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }

    pub(crate) fn opened(&self, role: Role) {
        if let Some(observer) = self.current() {
            observer.on_opened(role);
        }
    }

    pub(crate) fn message(&self, role: Role, message: String) {
        if let Some(observer) = self.current() {
            observer.on_message(role, message);
        }
    }

    pub(crate) fn closed(&self, role: Role) {
        if let Some(observer) = self.current() {
            observer.on_closed(role);
        }
    }

    pub(crate) fn error(&self, role: Role, error: &LinkError) {
        if let Some(observer) = self.current() {
            observer.on_error(role, error);
        }
    }

    // Clone out so the observer may call back into the slot
    fn current(&self) -> Option<Arc<dyn LinkObserver>> {
        self.0.read().clone()
    }
}

/// Observer that keeps every event, for tests and demos
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LinkEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().clone()
    }

    /// Drain and return all events so far
    pub fn take(&self) -> Vec<LinkEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Messages received for `role`, in order
    pub fn messages(&self, role: Role) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Message { role: r, data } if *r == role => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: LinkEvent) {
        self.events.lock().push(event);
    }
}

impl LinkObserver for RecordingObserver {
    fn on_opened(&self, role: Role) {
        self.push(LinkEvent::Opened { role });
    }

    fn on_message(&self, role: Role, message: String) {
        self.push(LinkEvent::Message { role, data: message });
    }

    fn on_closed(&self, role: Role) {
        self.push(LinkEvent::Closed { role });
    }

    fn on_error(&self, role: Role, error: &LinkError) {
        self.push(LinkEvent::Error {
            role,
            message: error.to_string(),
        });
    }
}
