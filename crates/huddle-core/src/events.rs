use std::sync::{Arc, RwLock};

use crate::devices::{Device, DeviceKind};
use crate::errors::ClassifiedError;
use crate::roster::{Attendee, TileId};
use crate::session::{Session, SessionState};

/// Events emitted by the core to application listeners.
#[derive(Debug, Clone)]
pub enum HuddleEvent {
    StateChanged(SessionState),
    SessionStarted {
        session_id: String,
        local_attendee_id: String,
    },
    SessionFailed(ClassifiedError),
    SessionReconnecting { attempt: u32 },
    SessionReconnected,
    /// Final session record, with `ended_at` set.
    SessionEnded(Session),
    RosterChanged(Vec<Attendee>),
    VideoTileBound { attendee_id: String, tile_id: TileId },
    VideoTileReleased { attendee_id: String, tile_id: TileId },
    DeviceSetChanged { kind: DeviceKind, devices: Vec<Device> },
    /// A device failed or vanished; the application should re-select.
    DeviceUnavailable(ClassifiedError),
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn HuddleEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn emit(&self, event: HuddleEvent) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
