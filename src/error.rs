//! Call negotiation error types.

use thiserror::Error;

use crate::session::CallId;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("event for superseded call {0}")]
    NegotiationStale(CallId),

    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("peer engine error: {0}")]
    Engine(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Which setup sequence a failure interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    Start,
    Accept,
}

impl CallError {
    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine(err.to_string())
    }

    pub fn directory(err: impl std::fmt::Display) -> Self {
        Self::DirectoryUnavailable(err.to_string())
    }

    /// Text shown to the operator when a setup sequence aborts.
    pub fn user_message(&self, phase: SetupPhase) -> String {
        let what = match phase {
            SetupPhase::Start => "could not start call",
            SetupPhase::Accept => "could not accept call",
        };
        match self {
            Self::MediaAccessDenied(_) => format!("{what}: microphone/camera access denied"),
            Self::MediaUnavailable(_) => format!("{what}: no capture device available"),
            Self::DirectoryUnavailable(_) => format!("{what}: call service unreachable"),
            _ => what.to_string(),
        }
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
