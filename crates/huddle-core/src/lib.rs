//! Huddle core: client-side conferencing session management.
//!
//! Sits between an application UI and a conferencing transport. Owns the
//! session lifecycle, local devices, the attendee roster and connection
//! recovery, and reports failures through a small closed error taxonomy.

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod devices;
pub mod errors;
pub mod events;
pub mod health;
pub mod roster;
pub mod session;
pub mod sim;
pub mod transport;

#[cfg(feature = "cpal")]
pub mod cpal_devices;
#[cfg(feature = "livekit")]
pub mod livekit_transport;

pub use classifier::classify;
pub use config::{ConfigStore, ControllerConfig, SessionConfig};
pub use devices::{Device, DeviceKind, DeviceManager, DevicePlatform};
pub use errors::{ClassifiedError, ConfigError, ErrorKind, RecoveryAction};
pub use events::{HuddleEvent, HuddleEventListener};
pub use health::{ConnectionHealthMonitor, ConnectionQualitySample, HealthVerdict};
pub use roster::{Attendee, ParticipantRoster, RosterDelta};
pub use session::{Session, SessionController, SessionState};
pub use transport::{RawError, Transport, TransportEvent};
