//! Session Model
//!
//! Lifecycle states of a measurement session, the transition table that
//! guards them, and the read-only snapshot handed to status queries.

use crate::core::errors::FailureKind;
use crate::core::events::SessionEvent;
use crate::math::body::BodyComposition;
use crate::model::reading::Reading;
use rust_fsm::{state_machine, StateMachineImpl};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

state_machine! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    session_fsm(Idle)

    Idle(Start) => Scanning,
    Scanning => {
        DeviceFound => Connecting,
        Fail => Failed,
        Stop => Cancelled
    },
    Connecting => {
        Ready => Subscribed,
        Fail => Failed,
        Stop => Cancelled
    },
    Subscribed => {
        Progress => Collecting,
        Settled => Completed,
        DecodeFailed => Subscribed,
        Fail => Failed,
        Stop => Cancelled
    },
    Collecting => {
        Progress => Collecting,
        Settled => Completed,
        DecodeFailed => Collecting,
        Fail => Failed,
        Stop => Cancelled
    }
}

/// Lifecycle state of a measurement session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Subscribed,
    Collecting,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Collecting => "collecting",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl From<session_fsm::State> for SessionState {
    fn from(state: session_fsm::State) -> Self {
        match state {
            session_fsm::State::Idle => SessionState::Idle,
            session_fsm::State::Scanning => SessionState::Scanning,
            session_fsm::State::Connecting => SessionState::Connecting,
            session_fsm::State::Subscribed => SessionState::Subscribed,
            session_fsm::State::Collecting => SessionState::Collecting,
            session_fsm::State::Completed => SessionState::Completed,
            session_fsm::State::Failed => SessionState::Failed,
            session_fsm::State::Cancelled => SessionState::Cancelled,
        }
    }
}

impl From<SessionState> for session_fsm::State {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Idle => session_fsm::State::Idle,
            SessionState::Scanning => session_fsm::State::Scanning,
            SessionState::Connecting => session_fsm::State::Connecting,
            SessionState::Subscribed => session_fsm::State::Subscribed,
            SessionState::Collecting => session_fsm::State::Collecting,
            SessionState::Completed => session_fsm::State::Completed,
            SessionState::Failed => session_fsm::State::Failed,
            SessionState::Cancelled => session_fsm::State::Cancelled,
        }
    }
}

/// Inputs driving the session state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Start,
    DeviceFound,
    /// Connected and subscribed to the measurement characteristic.
    Ready,
    /// A reading arrived that is not final yet.
    Progress,
    /// A final reading arrived.
    Settled,
    DecodeFailed,
    Fail,
    Stop,
}

impl Transition {
    pub const ALL: [Transition; 8] = [
        Transition::Start,
        Transition::DeviceFound,
        Transition::Ready,
        Transition::Progress,
        Transition::Settled,
        Transition::DecodeFailed,
        Transition::Fail,
        Transition::Stop,
    ];
}

impl From<Transition> for session_fsm::Input {
    fn from(input: Transition) -> Self {
        match input {
            Transition::Start => session_fsm::Input::Start,
            Transition::DeviceFound => session_fsm::Input::DeviceFound,
            Transition::Ready => session_fsm::Input::Ready,
            Transition::Progress => session_fsm::Input::Progress,
            Transition::Settled => session_fsm::Input::Settled,
            Transition::DecodeFailed => session_fsm::Input::DecodeFailed,
            Transition::Fail => session_fsm::Input::Fail,
            Transition::Stop => session_fsm::Input::Stop,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal transition {input:?} from {from}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub input: Transition,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no transition leads from {from} to {to}")]
pub struct InvalidPath {
    pub from: SessionState,
    pub to: SessionState,
}

/// Guards the lifecycle of a single session.
pub struct SessionMachine {
    inner: session_fsm::StateMachine,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            inner: session_fsm::StateMachine::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        (*self.inner.state()).into()
    }

    /// Applies `input`, returning the state reached.
    pub fn apply(&mut self, input: Transition) -> Result<SessionState, IllegalTransition> {
        let from = self.state();
        self.inner
            .consume(&input.into())
            .map_err(|_| IllegalTransition { from, input })?;
        Ok(self.state())
    }

    /// Checks that `states`, starting from `Idle`, is a path through the
    /// transition table. Repeated states are valid only where a self
    /// transition exists.
    pub fn validate_path<I>(states: I) -> Result<(), InvalidPath>
    where
        I: IntoIterator<Item = SessionState>,
    {
        let mut current = SessionState::Idle;
        for next in states {
            let reachable = Transition::ALL.iter().any(|input| {
                <session_fsm::Impl as StateMachineImpl>::transition(
                    &current.into(),
                    &(*input).into(),
                )
                .map(SessionState::from)
                    == Some(next)
            });
            if !reachable {
                return Err(InvalidPath {
                    from: current,
                    to: next,
                });
            }
            current = next;
        }
        Ok(())
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    Completed(Reading),
    Failed(FailureKind),
    Cancelled,
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed(_) => SessionState::Completed,
            SessionOutcome::Failed(_) => SessionState::Failed,
            SessionOutcome::Cancelled => SessionState::Cancelled,
        }
    }
}

/// Read-only view of the active or most recently finished session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub target_address: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub last_event: Option<SessionEvent>,
    pub result: Option<Reading>,
    pub composition: Option<BodyComposition>,
    pub failure: Option<FailureKind>,
}

impl SessionSnapshot {
    /// Snapshot reported before any session was started.
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            target_address: None,
            started_at: None,
            finished_at: None,
            last_event: None,
            result: None,
            composition: None,
            failure: None,
        }
    }

    /// `address` is `None` until scanning discovers the scale.
    pub fn started(id: Uuid, address: Option<String>) -> Self {
        Self {
            session_id: Some(id),
            target_address: address,
            started_at: Some(OffsetDateTime::now_utc()),
            ..Self::idle()
        }
    }

    pub fn is_running(&self) -> bool {
        self.session_id.is_some() && !self.state.is_terminal()
    }

    /// Records the outcome. Does not touch `composition`; a finish time set
    /// earlier is kept.
    pub fn finish(&mut self, outcome: &SessionOutcome) {
        self.state = outcome.state();
        self.finished_at.get_or_insert_with(OffsetDateTime::now_utc);
        match outcome {
            SessionOutcome::Completed(reading) => self.result = Some(*reading),
            SessionOutcome::Failed(kind) => self.failure = Some(kind.clone()),
            SessionOutcome::Cancelled => {}
        }
    }
}
