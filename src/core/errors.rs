//! Error Taxonomy
//!
//! Typed errors for every stage of a measurement session. Transport and
//! decode errors stay local to the session engine; `FailureKind` is the
//! serializable reason a session ended in `Failed`.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// The scale did not advertise within the scan window.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("device unreachable: not seen within {0:?}")]
    Timeout(Duration),

    #[error("scan failed: {0}")]
    Adapter(String),
}

/// Why a GATT connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    Unreachable,
    Rejected,
    Timeout,
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectFailure::Unreachable => "unreachable",
            ConnectFailure::Rejected => "rejected",
            ConnectFailure::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("connect failed ({reason}): {detail}")]
pub struct ConnectError {
    pub reason: ConnectFailure,
    pub detail: String,
}

impl ConnectError {
    pub fn new(reason: ConnectFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscribeError {
    #[error("characteristic {0} not offered by the scale")]
    MissingCharacteristic(uuid::Uuid),

    #[error("subscribe failed: {0}")]
    Transport(String),
}

/// Raised while tearing a connection down. Never surfaces to callers.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("disconnect failed: {0}")]
pub struct DisconnectError(pub String);

/// Flags the decoder recognises but refuses to turn into a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFlag {
    WeightRemoved,
    ConflictingUnits,
}

impl std::fmt::Display for UnsupportedFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsupportedFlag::WeightRemoved => f.write_str("weight removed"),
            UnsupportedFlag::ConflictingUnits => f.write_str("conflicting unit bits"),
        }
    }
}

/// Frame decoding failure. Always non-fatal to a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },

    #[error("unsupported flag: {0}")]
    UnsupportedFlag(UnsupportedFlag),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode measurements: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

/// Errors returned by the control surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("a measurement session is already running")]
    AlreadyRunning,

    #[error("no measurement session is running")]
    NotRunning,

    #[error("invalid scale address {0:?}")]
    InvalidAddress(String),
}

/// Terminal failure reason recorded on a failed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    ScanTimeout,
    Scan { detail: String },
    Connect { reason: ConnectFailure },
    Subscribe { detail: String },
    ConnectionLost,
    OverallTimeout,
    /// The driving task ended without reporting an outcome.
    Aborted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ScanTimeout => write!(f, "unreachable (scan timed out)"),
            FailureKind::Scan { detail } => write!(f, "scan failed: {}", detail),
            FailureKind::Connect { reason } => write!(f, "{}", reason),
            FailureKind::Subscribe { detail } => write!(f, "subscribe failed: {}", detail),
            FailureKind::ConnectionLost => write!(f, "connection lost"),
            FailureKind::OverallTimeout => write!(f, "overall timeout"),
            FailureKind::Aborted => write!(f, "session task aborted"),
        }
    }
}

impl From<ScanError> for FailureKind {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Timeout(_) => FailureKind::ScanTimeout,
            ScanError::Adapter(detail) => FailureKind::Scan { detail },
        }
    }
}

impl From<ConnectError> for FailureKind {
    fn from(e: ConnectError) -> Self {
        FailureKind::Connect { reason: e.reason }
    }
}

impl From<SubscribeError> for FailureKind {
    fn from(e: SubscribeError) -> Self {
        FailureKind::Subscribe {
            detail: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::Malformed {
            expected: 13,
            actual: 4,
        };
        assert_eq!(err.to_string(), "malformed frame: expected 13 bytes, got 4");

        let err = ConnectError::new(ConnectFailure::Rejected, "gatt error");
        assert_eq!(err.to_string(), "connect failed (rejected): gatt error");

        assert_eq!(
            ControlError::AlreadyRunning.to_string(),
            "a measurement session is already running"
        );
    }

    #[test]
    fn test_failure_kind_from_errors() {
        assert_eq!(
            FailureKind::from(ScanError::Timeout(Duration::from_secs(1))),
            FailureKind::ScanTimeout
        );
        assert_eq!(
            FailureKind::from(ConnectError::new(ConnectFailure::Timeout, "slow")),
            FailureKind::Connect {
                reason: ConnectFailure::Timeout
            }
        );
        assert_eq!(FailureKind::ScanTimeout.to_string(), "unreachable (scan timed out)");
    }

    #[test]
    fn test_failure_kind_serializes_tagged() {
        let json = serde_json::to_string(&FailureKind::Connect {
            reason: ConnectFailure::Unreachable,
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"connect","reason":"unreachable"}"#);
    }
}
