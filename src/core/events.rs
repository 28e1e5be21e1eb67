//! Core Events
//!
//! This module defines the events emitted while a measurement session runs.
//! Events are timestamped, ordered and immutable once emitted; the controller
//! fans them out to every subscriber attached at emission time.
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::session::SessionState;

/// Severity of a session event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<EventLevel> for log::Level {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Debug => log::Level::Debug,
            EventLevel::Info => log::Level::Info,
            EventLevel::Warn => log::Level::Warn,
            EventLevel::Error => log::Level::Error,
        }
    }
}

/// A single entry of a session's live log.
///
/// `state` is set exactly when the event records a state transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub level: EventLevel,
    pub message: String,
    pub state: Option<SessionState>,
    pub session_id: Option<Uuid>,
}

impl SessionEvent {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            level,
            message: message.into(),
            state: None,
            session_id: None,
        }
    }

    /// An event recording the transition into `state`.
    pub fn transition(state: SessionState, message: impl Into<String>) -> Self {
        let level = match state {
            SessionState::Failed => EventLevel::Error,
            _ => EventLevel::Info,
        };
        Self {
            state: Some(state),
            ..Self::new(level, message)
        }
    }

    pub fn with_session(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(state) = self.state {
            write!(f, "[{}] {}", state, self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}
