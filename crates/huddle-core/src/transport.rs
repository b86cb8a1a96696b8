use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::health::ConnectionQualitySample;
use crate::roster::RosterDelta;

/// An unclassified failure reported by the transport SDK or the device platform.
///
/// Shapes vary by source: platform capture errors carry a `name`
/// (`NotAllowedError`, `NotFoundError`, ...), SDK session failures carry a
/// status `code`, and signaling failures may carry an HTTP status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", self.describe())]
pub struct RawError {
    pub name: Option<String>,
    pub code: Option<String>,
    pub http_status: Option<u16>,
    pub message: String,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    fn describe(&self) -> String {
        let tag = self.code.as_deref().or(self.name.as_deref());
        match (tag, self.message.is_empty()) {
            (Some(tag), true) => tag.to_string(),
            (Some(tag), false) => format!("{tag}: {}", self.message),
            (None, _) => self.message.clone(),
        }
    }
}

/// Events delivered by the transport, in order, for one open session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    RosterDelta(RosterDelta),
    ActiveSpeaker(Option<String>),
    QualitySample(ConnectionQualitySample),
    Error(RawError),
}

/// Result of a successful `open_session`.
#[derive(Debug)]
pub struct OpenedSession {
    pub session_id: String,
    pub local_attendee_id: String,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The public surface of the conferencing SDK consumed by the session controller.
pub trait Transport: Send + Sync + 'static {
    fn open_session(
        &self,
        config: &SessionConfig,
    ) -> impl Future<Output = Result<OpenedSession, RawError>> + Send;

    /// Best-effort teardown. Failures are logged by the caller, never propagated.
    fn close_session(&self, session_id: &str) -> impl Future<Output = Result<(), RawError>> + Send;

    /// Run one reconnection cycle for a degraded session.
    fn reconnect(&self, session_id: &str) -> impl Future<Output = Result<(), RawError>> + Send;
}
