use std::fmt;

use thiserror::Error;

/// Closed taxonomy of failures surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    NetworkDegraded,
    NetworkUnrecoverable,
    TransportRejected,
    InvalidState,
    Unknown,
}

impl ErrorKind {
    /// Whether the session can continue after an error of this kind.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::DeviceUnavailable | ErrorKind::NetworkDegraded)
    }

    /// What the application (or the controller) should do next.
    pub fn recommended_action(self) -> RecoveryAction {
        match self {
            ErrorKind::PermissionDenied => RecoveryAction::GrantPermission,
            ErrorKind::DeviceUnavailable => RecoveryAction::SelectDevice,
            ErrorKind::NetworkDegraded => RecoveryAction::Retry,
            ErrorKind::NetworkUnrecoverable => RecoveryAction::Rejoin,
            ErrorKind::TransportRejected | ErrorKind::Unknown => RecoveryAction::Abort,
            ErrorKind::InvalidState => RecoveryAction::None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::DeviceUnavailable => "device unavailable",
            ErrorKind::NetworkDegraded => "network degraded",
            ErrorKind::NetworkUnrecoverable => "network unrecoverable",
            ErrorKind::TransportRejected => "transport rejected",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// Retry the operation or reconnect with backoff.
    Retry,
    /// Ask the user to pick another device.
    SelectDevice,
    /// Ask the user to grant capture permission.
    GrantPermission,
    /// The session is gone; a new one must be joined.
    Rejoin,
    /// Give up and report the failure.
    Abort,
    /// Nothing to do; the call was rejected without side effects.
    None,
}

/// A transport or platform failure normalized into [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub recommended_action: RecoveryAction,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.is_recoverable(),
            recommended_action: kind.recommended_action(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceUnavailable, message)
    }

    pub fn network_unrecoverable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkUnrecoverable, message)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
