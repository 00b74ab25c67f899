//! Session state machine.

use thiserror::Error;

use super::SessionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Completed,
    Disconnected,
    Crashed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid session transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self {
            Self::Completed => Some(SessionOutcome::Completed),
            Self::Disconnected => Some(SessionOutcome::Disconnected),
            Self::Crashed => Some(SessionOutcome::Crashed),
            Self::TimedOut => Some(SessionOutcome::TimedOut),
            Self::Cancelled => Some(SessionOutcome::Cancelled),
            Self::Idle | Self::Starting | Self::Running => None,
        }
    }

    pub fn from_outcome(outcome: SessionOutcome) -> Self {
        match outcome {
            SessionOutcome::Completed => Self::Completed,
            SessionOutcome::Disconnected => Self::Disconnected,
            SessionOutcome::Crashed => Self::Crashed,
            SessionOutcome::TimedOut => Self::TimedOut,
            SessionOutcome::Cancelled => Self::Cancelled,
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Running) => true,
            // The worker may fail to start, or be cancelled while starting.
            (Starting, Disconnected | Crashed | Cancelled) => true,
            (Running, next) => next.is_terminal(),
            (from, Idle) => from.is_terminal(),
            _ => false,
        }
    }
}

/// Tracks the state of the supervisor's single active session.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), StateError> {
        if !self.state.can_transition_to(next) {
            return Err(StateError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
        Ok(())
    }

    /// Return to idle from wherever the session ended up.
    pub fn reset(&mut self) {
        if self.state != SessionState::Idle {
            tracing::debug!(from = ?self.state, "session state reset");
        }
        self.state = SessionState::Idle;
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
