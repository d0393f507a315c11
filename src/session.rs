use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::peer::types::{IceCandidate, SessionDescription};

/// Directory-assigned handle correlating every message of one negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Role {
    #[default]
    Unset,
    Caller,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LifecycleState {
    #[default]
    Idle,
    Calling,
    Ringing,
    Active,
    Ended,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// A call exists and owns (or is about to own) resources.
    pub fn in_progress(self) -> bool {
        matches!(self, Self::Calling | Self::Ringing | Self::Active)
    }

    fn allows(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Idle, Calling | Ringing) => true,
            (Calling | Ringing, Active) => true,
            (Calling | Ringing | Active, Ended) => true,
            (Idle | Calling | Ringing | Active, Failed) => true,
            (_, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Remote candidates that arrived before the remote description was set.
/// Order of arrival is preserved; draining empties it.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The single call record a negotiation machine owns.
#[derive(Debug, Default)]
pub struct Call {
    pub call_id: Option<CallId>,
    pub role: Role,
    pub state: LifecycleState,
    pub remote_identity: Option<String>,
    /// Offer carried by `incomingCall`, consumed on accept.
    pub pending_offer: Option<SessionDescription>,
    pub remote_candidates: CandidateBuffer,
    pub started_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn transition(
        &mut self,
        operation: &'static str,
        next: LifecycleState,
    ) -> Result<(), CallError> {
        if !self.state.allows(next) {
            return Err(CallError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// True when `id` names the current call.
    pub fn is_current(&self, id: &CallId) -> bool {
        self.call_id.as_ref() == Some(id)
    }

    pub fn check_current(&self, id: &CallId) -> Result<(), CallError> {
        if self.is_current(id) {
            Ok(())
        } else {
            Err(CallError::NegotiationStale(id.clone()))
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.started_at
            .map(|t| Utc::now().signed_duration_since(t).num_seconds())
    }

    /// Forgets everything about the call and returns to `Idle`.
    pub fn reset(&mut self) {
        *self = Call::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_lifecycle() {
        let mut call = Call::default();
        call.transition("start", LifecycleState::Calling).unwrap();
        call.transition("offer sent", LifecycleState::Active).unwrap();
        call.transition("remote end", LifecycleState::Ended).unwrap();
        assert!(call.state.is_terminal());
    }

    #[test]
    fn terminal_states_only_leave_through_idle() {
        let mut call = Call {
            state: LifecycleState::Failed,
            ..Default::default()
        };
        assert!(matches!(
            call.transition("start", LifecycleState::Calling),
            Err(CallError::InvalidState { .. })
        ));
        call.transition("reset", LifecycleState::Idle).unwrap();
        call.transition("start", LifecycleState::Calling).unwrap();
    }

    #[test]
    fn ringing_cannot_be_reentered_while_active() {
        let mut call = Call {
            state: LifecycleState::Active,
            ..Default::default()
        };
        assert!(call.transition("incoming", LifecycleState::Ringing).is_err());
    }

    #[test]
    fn stale_ids_are_reported() {
        let call = Call {
            call_id: Some("55".into()),
            ..Default::default()
        };
        assert!(call.check_current(&"55".into()).is_ok());
        assert!(matches!(
            call.check_current(&"99".into()),
            Err(CallError::NegotiationStale(id)) if id.as_str() == "99"
        ));
    }

    #[test]
    fn buffer_keeps_arrival_order() {
        let mut buf = CandidateBuffer::default();
        for n in 0..3 {
            buf.push(IceCandidate::new(format!("candidate:{n}")));
        }
        let drained: Vec<_> = buf.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, ["candidate:0", "candidate:1", "candidate:2"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut call = Call {
            call_id: Some("1".into()),
            role: Role::Caller,
            state: LifecycleState::Active,
            ..Default::default()
        };
        call.remote_candidates.push(IceCandidate::new("candidate:x"));
        call.reset();
        assert_eq!(call.state, LifecycleState::Idle);
        assert_eq!(call.role, Role::Unset);
        assert!(call.call_id.is_none());
        assert!(call.remote_candidates.is_empty());
    }
}
