use crate::errors::{ClassifiedError, ErrorKind};
use crate::transport::RawError;

/// Platform (DOMException-style) error names raised by capture APIs.
const KNOWN_NAMES: &[(&str, ErrorKind)] = &[
    ("NotAllowedError", ErrorKind::PermissionDenied),
    ("PermissionDeniedError", ErrorKind::PermissionDenied),
    ("SecurityError", ErrorKind::PermissionDenied),
    ("NotFoundError", ErrorKind::DeviceUnavailable),
    ("DevicesNotFoundError", ErrorKind::DeviceUnavailable),
    ("NotReadableError", ErrorKind::DeviceUnavailable),
    ("TrackStartError", ErrorKind::DeviceUnavailable),
    ("OverconstrainedError", ErrorKind::DeviceUnavailable),
];

/// Session status codes reported by the conferencing SDK.
const KNOWN_CODES: &[(&str, ErrorKind)] = &[
    ("ConnectionHealthReconnect", ErrorKind::NetworkDegraded),
    ("NetworkBecamePoor", ErrorKind::NetworkDegraded),
    ("SignalingChannelClosedUnexpectedly", ErrorKind::NetworkDegraded),
    ("SignalingInternalServerError", ErrorKind::NetworkDegraded),
    ("ICEGatheringTimeout", ErrorKind::NetworkDegraded),
    ("ConnectionLost", ErrorKind::NetworkUnrecoverable),
    ("ReconnectionTimedOut", ErrorKind::NetworkUnrecoverable),
    ("AudioAuthenticationRejected", ErrorKind::TransportRejected),
    ("AudioCallAtCapacity", ErrorKind::TransportRejected),
    ("AudioJoinedFromAnotherDevice", ErrorKind::TransportRejected),
    ("MeetingEnded", ErrorKind::TransportRejected),
    ("SignalingBadRequest", ErrorKind::TransportRejected),
];

/// Lowercase message fragments, checked last.
const KNOWN_MESSAGES: &[(&str, ErrorKind)] = &[
    ("permission denied", ErrorKind::PermissionDenied),
    ("requested device not found", ErrorKind::DeviceUnavailable),
    ("could not start audio source", ErrorKind::DeviceUnavailable),
    ("could not start video source", ErrorKind::DeviceUnavailable),
];

/// Map a raw transport or platform failure into the closed taxonomy.
///
/// Pure and deterministic. Anything unrecognized is `Unknown` and not
/// recoverable, so the controller never retries a condition it cannot name.
pub fn classify(raw: &RawError) -> ClassifiedError {
    let kind = classify_kind(raw);
    let message = if raw.message.is_empty() {
        raw.to_string()
    } else {
        raw.message.clone()
    };
    ClassifiedError::new(kind, message)
}

fn classify_kind(raw: &RawError) -> ErrorKind {
    if let Some(kind) = raw.name.as_deref().and_then(|n| lookup(KNOWN_NAMES, n)) {
        return kind;
    }
    if let Some(kind) = raw.code.as_deref().and_then(|c| lookup(KNOWN_CODES, c)) {
        return kind;
    }
    match raw.http_status {
        Some(401 | 403 | 404 | 409 | 410) => return ErrorKind::TransportRejected,
        Some(408 | 429) => return ErrorKind::NetworkDegraded,
        Some(500..=599) => return ErrorKind::NetworkDegraded,
        _ => {}
    }
    let message = raw.message.to_lowercase();
    KNOWN_MESSAGES
        .iter()
        .find(|(fragment, _)| message.contains(fragment))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

fn lookup(table: &[(&str, ErrorKind)], key: &str) -> Option<ErrorKind> {
    table.iter().find(|(k, _)| *k == key).map(|(_, kind)| *kind)
}
