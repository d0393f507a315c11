//! Outcome events for the presentation side.

use std::fmt;

use tokio::sync::mpsc;

use crate::peer::RemoteTrack;
use crate::session::{CallId, LifecycleState, Role};

/// Point-in-time view of the call record.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: LifecycleState,
    pub role: Role,
    pub call_id: Option<CallId>,
    pub remote_identity: Option<String>,
    pub buffered_candidates: usize,
    pub engine_live: bool,
    pub media_held: bool,
    pub duration_secs: Option<i64>,
}

impl fmt::Display for CallSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state={} role={:?}", self.state, self.role)?;
        if let Some(id) = &self.call_id {
            write!(f, " call={id}")?;
        }
        if let Some(peer) = &self.remote_identity {
            write!(f, " peer={peer}")?;
        }
        if let Some(secs) = self.duration_secs {
            write!(f, " duration={secs}s")?;
        }
        write!(
            f,
            " buffered={} engine={} media={}",
            self.buffered_candidates, self.engine_live, self.media_held
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(LifecycleState),
    IncomingCall { call_id: CallId, caller: String },
    Connected,
    RemoteTrack(RemoteTrack),
    /// "could not start call" / "could not accept call"
    SetupFailed { reason: String },
    ConnectionLost,
    RemoteHangup { duration_secs: Option<i64> },
    Rejected,
    Ended { duration_secs: Option<i64> },
    Status(CallSnapshot),
    CommandRejected(String),
}

/// Fire-and-forget sender; a dropped receiver is not an error.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }
}
