//! Call negotiation state machine.
//!
//! Owns the single call record, the peer engine and the local media, and
//! reacts to operator commands, signaling events and engine callbacks. It is
//! driven from one task (see `controller`), so a reaction always runs to
//! completion before the next event is looked at; events that arrive during a
//! multi-step flow wait in their channels and are validated against the call
//! record when they are dispatched.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::error::{CallError, Result, SetupPhase};
use crate::events::{CallEvent, CallSnapshot, EventSink};
use crate::media::LocalMediaSource;
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};
use crate::peer::{
    EngineConfig, EngineEvent, EngineEventKind, EngineEventSender, PeerSession,
    PeerSessionFactory,
};
use crate::session::{Call, CallId, LifecycleState, Role};
use crate::signaling::SignalEvent;

pub struct NegotiationMachine {
    local_identity: String,
    engine_config: EngineConfig,
    directory: Arc<dyn Directory>,
    media: LocalMediaSource,
    factory: Arc<dyn PeerSessionFactory>,
    engine: Option<Box<dyn PeerSession>>,
    generation: u64,
    engine_tx: EngineEventSender,
    call: Call,
    events: EventSink,
    submissions: JoinSet<()>,
}

impl NegotiationMachine {
    /// Returns the machine and the receiver its engines report on.
    pub fn new(
        local_identity: impl Into<String>,
        engine_config: EngineConfig,
        directory: Arc<dyn Directory>,
        media: LocalMediaSource,
        factory: Arc<dyn PeerSessionFactory>,
        events: EventSink,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let machine = Self {
            local_identity: local_identity.into(),
            engine_config,
            directory,
            media,
            factory,
            engine: None,
            generation: 0,
            engine_tx,
            call: Call::default(),
            events,
            submissions: JoinSet::new(),
        };
        (machine, engine_rx)
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn state(&self) -> LifecycleState {
        self.call.state
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.call.call_id.as_ref()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.call.remote_candidates.len()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.call.state,
            role: self.call.role,
            call_id: self.call.call_id.clone(),
            remote_identity: self.call.remote_identity.clone(),
            buffered_candidates: self.call.remote_candidates.len(),
            engine_live: self.engine.is_some(),
            media_held: self.media.is_held(),
            duration_secs: self.call.duration_secs(),
        }
    }

    // ---------- caller ----------

    /// Places a call to `target`. Any call in progress is ended and torn
    /// down first.
    pub async fn start_call(&mut self, target: &str) -> Result<CallId> {
        if self.call.state.in_progress() {
            info!(previous = ?self.call.call_id, "replacing call in progress");
            self.notify_abandon().await;
        }
        if self.call.state != LifecycleState::Idle {
            self.teardown().await;
        }

        self.call.transition("start call", LifecycleState::Calling)?;
        self.call.role = Role::Caller;
        self.call.remote_identity = Some(target.to_owned());
        self.events.emit(CallEvent::StateChanged(LifecycleState::Calling));
        info!(target, "starting call");

        match self.run_caller_setup(target).await {
            Ok(call_id) => {
                self.call.transition("offer sent", LifecycleState::Active)?;
                self.call.started_at = Some(Utc::now());
                self.events.emit(CallEvent::StateChanged(LifecycleState::Active));
                info!(%call_id, "offer submitted, call active");
                Ok(call_id)
            }
            Err(e) => Err(self.fail_setup(e, SetupPhase::Start).await),
        }
    }

    async fn run_caller_setup(&mut self, target: &str) -> Result<CallId> {
        let call_id = self.directory.create_call(target).await?;
        debug!(%call_id, "call record created");
        self.call.call_id = Some(call_id.clone());

        let stream = self.media.acquire().await?;
        let engine = self.replace_engine().await?;
        engine.attach_local_tracks(&stream).await?;

        let offer = engine.create_offer().await?;
        engine.set_local_description(offer.clone()).await?;
        self.directory.submit_offer(&call_id, &offer).await?;
        Ok(call_id)
    }

    // ---------- receiver ----------

    /// Accepts the ringing call.
    pub async fn accept(&mut self) -> Result<()> {
        if self.call.state != LifecycleState::Ringing {
            return Err(CallError::InvalidState {
                operation: "accept",
                state: self.call.state.to_string(),
            });
        }
        match self.run_receiver_setup().await {
            Ok(call_id) => {
                self.call.transition("answer sent", LifecycleState::Active)?;
                self.call.started_at = Some(Utc::now());
                self.events.emit(CallEvent::StateChanged(LifecycleState::Active));
                info!(%call_id, "answer submitted, call active");
                Ok(())
            }
            Err(e) => Err(self.fail_setup(e, SetupPhase::Accept).await),
        }
    }

    async fn run_receiver_setup(&mut self) -> Result<CallId> {
        let (Some(call_id), Some(offer)) =
            (self.call.call_id.clone(), self.call.pending_offer.take())
        else {
            return Err(CallError::InvalidState {
                operation: "accept",
                state: "ringing without offer".into(),
            });
        };

        let stream = self.media.acquire().await?;
        {
            let engine = self.replace_engine().await?;
            engine.attach_local_tracks(&stream).await?;
            engine.set_remote_description(offer).await?;
        }
        self.drain_candidate_buffer().await;

        let engine = self.current_engine()?;
        let answer = engine.create_answer().await?;
        engine.set_local_description(answer.clone()).await?;
        self.directory.submit_answer(&call_id, &answer).await?;
        Ok(call_id)
    }

    /// Declines the ringing call and returns to `Idle`. Nothing local was
    /// created yet, so there is nothing to release.
    pub async fn reject(&mut self) -> Result<()> {
        let call_id = match (self.call.state, &self.call.call_id) {
            (LifecycleState::Ringing, Some(id)) => id.clone(),
            _ => {
                return Err(CallError::InvalidState {
                    operation: "reject",
                    state: self.call.state.to_string(),
                })
            }
        };
        let notified = self.directory.reject(&call_id).await;
        if let Err(e) = &notified {
            warn!(%call_id, "reject notification failed: {e}");
        }
        info!(%call_id, "incoming call rejected");
        self.call.reset();
        self.events.emit(CallEvent::StateChanged(LifecycleState::Idle));
        notified
    }

    /// Hangs up. The directory is told first; local teardown runs even when
    /// that fails, and the failure is returned afterwards.
    pub async fn end_call(&mut self) -> Result<()> {
        match self.call.state {
            LifecycleState::Ringing => return self.reject().await,
            LifecycleState::Calling | LifecycleState::Active => {}
            state => {
                return Err(CallError::InvalidState {
                    operation: "end call",
                    state: state.to_string(),
                })
            }
        }
        let notified = match self.call.call_id.clone() {
            Some(call_id) => self.directory.end(&call_id).await,
            None => Ok(()),
        };
        if let Err(e) = &notified {
            warn!("end notification failed: {e}");
        }
        let duration_secs = self.call.duration_secs();
        self.finish(LifecycleState::Ended, "end call").await;
        self.events.emit(CallEvent::Ended { duration_secs });
        notified
    }

    // ---------- inbound events ----------

    pub async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Connected => info!("signaling channel up"),
            SignalEvent::Disconnected => warn!("signaling channel down"),
            SignalEvent::IncomingCall {
                caller_id,
                recipient_id,
                call_id,
                offer,
            } => {
                self.on_incoming_call(caller_id, recipient_id, call_id, offer)
                    .await
            }
            SignalEvent::Answer { call_id, answer } => self.on_answer(call_id, answer).await,
            SignalEvent::RemoteCandidate { call_id, candidate } => {
                if self.is_stale(&call_id, "iceCandidate") {
                    return;
                }
                self.route_candidate(candidate).await;
            }
            SignalEvent::RemoteEnd { call_id } => {
                if self.is_stale(&call_id, "endCall") {
                    return;
                }
                info!(%call_id, "remote side hung up");
                let duration_secs = self.call.duration_secs();
                self.finish(LifecycleState::Ended, "remote end").await;
                self.events.emit(CallEvent::RemoteHangup { duration_secs });
            }
            SignalEvent::Rejected { call_id } => {
                if self.is_stale(&call_id, "callRejected") {
                    return;
                }
                info!(%call_id, "call rejected by remote side");
                self.finish(LifecycleState::Ended, "remote reject").await;
                self.events.emit(CallEvent::Rejected);
            }
        }
    }

    async fn on_incoming_call(
        &mut self,
        caller_id: String,
        recipient_id: String,
        call_id: CallId,
        offer: SessionDescription,
    ) {
        if recipient_id != self.local_identity {
            debug!(%call_id, %recipient_id, "incoming call addressed to someone else");
            return;
        }
        if self.call.is_current(&call_id) {
            debug!(%call_id, "duplicate incoming call notification");
            return;
        }
        if self.call.state.in_progress() {
            info!(%call_id, %caller_id, "busy, rejecting incoming call");
            if let Err(e) = self.directory.reject(&call_id).await {
                warn!(%call_id, "busy reject failed: {e}");
            }
            return;
        }
        if self.call.state.is_terminal() {
            self.call.reset();
        }
        if let Err(e) = self.call.transition("incoming call", LifecycleState::Ringing) {
            warn!("{e}");
            return;
        }
        self.call.role = Role::Receiver;
        self.call.call_id = Some(call_id.clone());
        self.call.remote_identity = Some(caller_id.clone());
        self.call.pending_offer = Some(offer);
        info!(%call_id, %caller_id, "incoming call ringing");
        self.events.emit(CallEvent::IncomingCall {
            call_id,
            caller: caller_id,
        });
        self.events.emit(CallEvent::StateChanged(LifecycleState::Ringing));
    }

    async fn on_answer(&mut self, call_id: CallId, answer: SessionDescription) {
        if self.is_stale(&call_id, "answer") {
            return;
        }
        if self.call.role != Role::Caller {
            debug!(%call_id, "answer ignored, not the caller");
            return;
        }
        let applied = match self.engine.as_deref() {
            None => {
                debug!(%call_id, "answer ignored, no engine");
                return;
            }
            Some(engine) if engine.has_remote_description() => {
                debug!(%call_id, "duplicate answer ignored");
                return;
            }
            Some(engine) => engine.set_remote_description(answer).await,
        };
        match applied {
            Ok(()) => {
                info!(%call_id, "remote answer applied");
                self.drain_candidate_buffer().await;
            }
            Err(e) => {
                warn!(%call_id, "remote answer rejected: {e}");
                self.fail_setup(e, SetupPhase::Start).await;
            }
        }
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        let current = self.engine.as_ref().map(|e| e.generation());
        if current != Some(event.generation) {
            debug!(
                generation = event.generation,
                ?current,
                "event from superseded engine dropped"
            );
            return;
        }
        match event.kind {
            EngineEventKind::LocalCandidate(candidate) => self.submit_local_candidate(candidate),
            EngineEventKind::GatheringComplete => debug!("local candidate gathering complete"),
            EngineEventKind::RemoteTrack(track) => {
                self.events.emit(CallEvent::RemoteTrack(track));
            }
            EngineEventKind::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                info!(call_id = ?self.call.call_id, "peer connected");
                self.events.emit(CallEvent::Connected);
            }
            ConnectionState::Failed => {
                if !self.call.state.in_progress() {
                    return;
                }
                warn!(call_id = ?self.call.call_id, "peer connection failed");
                self.finish(LifecycleState::Failed, "connection failed").await;
                self.events.emit(CallEvent::ConnectionLost);
            }
            ConnectionState::Disconnected => {
                warn!(call_id = ?self.call.call_id, "peer disconnected, waiting for recovery");
            }
            other => debug!(?other, "peer connection state"),
        }
    }

    /// Relays a local candidate in the background. Call id and target are
    /// read from the record now, not from when the engine was created.
    fn submit_local_candidate(&mut self, candidate: IceCandidate) {
        let (Some(call_id), Some(target)) = (&self.call.call_id, &self.call.remote_identity)
        else {
            debug!("local candidate without a call, dropped");
            return;
        };
        let directory = Arc::clone(&self.directory);
        let call_id = call_id.clone();
        let target = target.clone();
        self.submissions.spawn(async move {
            if let Err(e) = directory
                .submit_candidate(&call_id, &target, &candidate)
                .await
            {
                warn!(%call_id, "candidate submission failed: {e}");
            }
        });
    }

    /// Waits for the next background candidate submission to settle.
    /// `None` when none is outstanding.
    pub async fn reap_submission(&mut self) -> Option<()> {
        match self.submissions.join_next().await? {
            Err(e) if e.is_panic() => warn!("candidate submission panicked: {e}"),
            _ => {}
        }
        Some(())
    }

    pub fn pending_submissions(&self) -> usize {
        self.submissions.len()
    }

    // ---------- candidate buffering ----------

    /// Applies a remote candidate when the engine has its remote
    /// description, buffers it otherwise.
    async fn route_candidate(&mut self, candidate: IceCandidate) {
        match self.engine.as_deref() {
            Some(engine) if engine.has_remote_description() => {
                apply_candidate(engine, &candidate).await;
            }
            _ => {
                self.call.remote_candidates.push(candidate);
                debug!(
                    buffered = self.call.remote_candidates.len(),
                    "remote candidate buffered"
                );
            }
        }
    }

    /// Applies every buffered candidate in arrival order and empties the
    /// buffer. Only meaningful once the remote description is set.
    async fn drain_candidate_buffer(&mut self) {
        let Some(engine) = self.engine.as_deref() else {
            return;
        };
        if !engine.has_remote_description() {
            return;
        }
        let pending = self.call.remote_candidates.drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), "draining buffered candidates");
        }
        for candidate in &pending {
            apply_candidate(engine, candidate).await;
        }
    }

    // ---------- teardown ----------

    /// Releases everything and returns to `Idle`. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        self.release_resources().await;
        let was = self.call.state;
        self.call.reset();
        if was != LifecycleState::Idle {
            info!(from = %was, "call state reset");
            self.events.emit(CallEvent::StateChanged(LifecycleState::Idle));
        }
    }

    /// Closes the engine, releases media and forgets the call identity.
    async fn release_resources(&mut self) {
        self.submissions.shutdown().await;
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
        self.media.release();
        self.call.remote_candidates.clear();
        self.call.call_id = None;
        self.call.role = Role::Unset;
        self.call.pending_offer = None;
        self.call.remote_identity = None;
        self.call.started_at = None;
    }

    /// Releases resources and parks the record in a terminal state.
    async fn finish(&mut self, terminal: LifecycleState, operation: &'static str) {
        self.release_resources().await;
        match self.call.transition(operation, terminal) {
            Ok(()) => self.events.emit(CallEvent::StateChanged(terminal)),
            Err(e) => warn!("{e}"),
        }
    }

    async fn fail_setup(&mut self, err: CallError, phase: SetupPhase) -> CallError {
        warn!(?phase, call_id = ?self.call.call_id, "call setup failed: {err}");
        self.finish(LifecycleState::Failed, "setup failure").await;
        self.events.emit(CallEvent::SetupFailed {
            reason: err.user_message(phase),
        });
        err
    }

    /// Best-effort notice for a call being replaced by a new one.
    async fn notify_abandon(&self) {
        let Some(call_id) = &self.call.call_id else {
            return;
        };
        let res = match self.call.state {
            LifecycleState::Ringing => self.directory.reject(call_id).await,
            _ => self.directory.end(call_id).await,
        };
        if let Err(e) = res {
            warn!(%call_id, "abandon notification failed: {e}");
        }
    }

    // ---------- helpers ----------

    fn is_stale(&self, call_id: &CallId, event: &str) -> bool {
        match self.call.check_current(call_id) {
            Ok(()) => false,
            Err(e) => {
                debug!(event, current = ?self.call.call_id, "{e}");
                true
            }
        }
    }

    /// Closes the previous engine, if any, and builds a fresh one under a new
    /// generation.
    async fn replace_engine(&mut self) -> Result<&dyn PeerSession> {
        if let Some(old) = self.engine.take() {
            old.close().await;
        }
        self.generation += 1;
        let engine = self
            .factory
            .create(&self.engine_config, self.generation, self.engine_tx.clone())
            .await?;
        Ok(&**self.engine.insert(engine))
    }

    fn current_engine(&self) -> Result<&dyn PeerSession> {
        self.engine
            .as_deref()
            .ok_or_else(|| CallError::Engine("no engine".into()))
    }
}

async fn apply_candidate(engine: &dyn PeerSession, candidate: &IceCandidate) {
    if let Err(e) = engine.add_remote_candidate(candidate).await {
        warn!(candidate = %candidate.candidate, "remote candidate not applied: {e}");
    }
}
