#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use peercall_lib::directory::Directory;
use peercall_lib::events::{CallEvent, EventSink};
use peercall_lib::machine::NegotiationMachine;
use peercall_lib::media::{
    CaptureDevice, LocalMediaSource, LocalStream, MediaConstraints, SampleCaptureDevice,
};
use peercall_lib::peer::{
    EngineConfig, EngineEvent, EngineEventKind, EngineEventSender, IceCandidate, PeerSession,
    PeerSessionFactory, SdpKind, SessionDescription,
};
use peercall_lib::session::CallId;
use peercall_lib::signaling::SignalEvent;
use peercall_lib::{CallError, Result};

pub const ME: &str = "user-2";

// ---------- directory ----------

#[derive(Debug, Clone, PartialEq)]
pub enum DirCall {
    Create(String),
    Offer(String),
    Answer(String),
    Candidate {
        call_id: String,
        target: String,
        candidate: String,
    },
    Reject(String),
    End(String),
}

#[derive(Default)]
pub struct FakeDirectory {
    calls: Mutex<Vec<DirCall>>,
    ids: Mutex<VecDeque<String>>,
    pub fail_create: AtomicBool,
    pub fail_end: AtomicBool,
    pub fail_candidate: AtomicBool,
    /// Calls never complete once recorded.
    pub stall_create: AtomicBool,
    pub stall_candidate: AtomicBool,
}

impl FakeDirectory {
    pub fn queue_id(&self, id: &str) {
        self.ids.lock().unwrap().push_back(id.to_owned());
    }

    pub fn calls(&self) -> Vec<DirCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: DirCall) {
        self.calls.lock().unwrap().push(call);
    }

    async fn hang_if(flag: &AtomicBool) {
        if flag.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn unavailable(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(CallError::DirectoryUnavailable("503 Service Unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn create_call(&self, target: &str) -> Result<CallId> {
        self.record(DirCall::Create(target.to_owned()));
        Self::hang_if(&self.stall_create).await;
        Self::unavailable(&self.fail_create)?;
        let id = self
            .ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "123".to_owned());
        Ok(CallId::new(id))
    }

    async fn submit_offer(&self, call_id: &CallId, _offer: &SessionDescription) -> Result<()> {
        self.record(DirCall::Offer(call_id.to_string()));
        Ok(())
    }

    async fn submit_answer(&self, call_id: &CallId, _answer: &SessionDescription) -> Result<()> {
        self.record(DirCall::Answer(call_id.to_string()));
        Ok(())
    }

    async fn submit_candidate(
        &self,
        call_id: &CallId,
        target: &str,
        candidate: &IceCandidate,
    ) -> Result<()> {
        self.record(DirCall::Candidate {
            call_id: call_id.to_string(),
            target: target.to_owned(),
            candidate: candidate.candidate.clone(),
        });
        Self::hang_if(&self.stall_candidate).await;
        Self::unavailable(&self.fail_candidate)
    }

    async fn reject(&self, call_id: &CallId) -> Result<()> {
        self.record(DirCall::Reject(call_id.to_string()));
        Ok(())
    }

    async fn end(&self, call_id: &CallId) -> Result<()> {
        self.record(DirCall::End(call_id.to_string()));
        Self::unavailable(&self.fail_end)
    }
}

// ---------- engine ----------

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Created(u64),
    AttachTracks(u64),
    CreateOffer(u64),
    CreateAnswer(u64),
    SetLocal(u64, SdpKind),
    SetRemote(u64, SdpKind),
    AddCandidate(u64, String),
    Close(u64),
}

#[derive(Default)]
pub struct FakeEngineFactory {
    log: Arc<Mutex<Vec<Op>>>,
    senders: Mutex<Vec<(u64, EngineEventSender)>>,
    /// Every engine refuses remote descriptions while set.
    pub fail_remote: Arc<AtomicBool>,
}

impl FakeEngineFactory {
    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().unwrap().clone()
    }

    /// Candidates applied to any engine, in application order.
    pub fn applied(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AddCandidate(_, c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Fires a callback as if engine `generation` raised it.
    pub fn emit(&self, generation: u64, kind: EngineEventKind) {
        let senders = self.senders.lock().unwrap();
        let (_, tx) = senders
            .iter()
            .find(|(g, _)| *g == generation)
            .expect("no engine with that generation");
        tx.send(EngineEvent { generation, kind }).unwrap();
    }
}

#[async_trait]
impl PeerSessionFactory for FakeEngineFactory {
    async fn create(
        &self,
        _config: &EngineConfig,
        generation: u64,
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerSession>> {
        self.log.lock().unwrap().push(Op::Created(generation));
        self.senders.lock().unwrap().push((generation, events));
        Ok(Box::new(FakeEngine {
            generation,
            log: self.log.clone(),
            fail_remote: self.fail_remote.clone(),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeEngine {
    generation: u64,
    log: Arc<Mutex<Vec<Op>>>,
    fail_remote: Arc<AtomicBool>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl FakeEngine {
    fn push(&self, op: Op) {
        self.log.lock().unwrap().push(op);
    }
}

#[async_trait]
impl PeerSession for FakeEngine {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn attach_local_tracks(&self, _stream: &LocalStream) -> Result<()> {
        self.push(Op::AttachTracks(self.generation));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.push(Op::CreateOffer(self.generation));
        Ok(SessionDescription::offer(format!("offer-{}", self.generation)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.push(Op::CreateAnswer(self.generation));
        Ok(SessionDescription::answer(format!("answer-{}", self.generation)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if self.local_set.swap(true, Ordering::SeqCst) {
            return Err(CallError::Engine("local description already set".into()));
        }
        self.push(Op::SetLocal(self.generation, desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(CallError::Engine("malformed remote description".into()));
        }
        if self.remote_set.swap(true, Ordering::SeqCst) {
            return Err(CallError::Engine("remote description already set".into()));
        }
        self.push(Op::SetRemote(self.generation, desc.kind));
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if !self.has_remote_description() {
            return Err(CallError::CandidateRejected("remote description not set".into()));
        }
        if candidate.candidate.starts_with("bad") {
            return Err(CallError::CandidateRejected("unparseable".into()));
        }
        self.push(Op::AddCandidate(self.generation, candidate.candidate.clone()));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.push(Op::Close(self.generation));
        }
    }
}

// ---------- capture ----------

#[derive(Default)]
pub struct FakeCapture {
    pub deny: AtomicBool,
    pub opened: AtomicUsize,
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccessDenied("permission denied".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        SampleCaptureDevice.open(constraints).await
    }
}

// ---------- harness ----------

pub struct Harness {
    pub machine: NegotiationMachine,
    pub engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    pub directory: Arc<FakeDirectory>,
    pub engines: Arc<FakeEngineFactory>,
    pub capture: Arc<FakeCapture>,
}

pub fn harness() -> Harness {
    let directory = Arc::new(FakeDirectory::default());
    let engines = Arc::new(FakeEngineFactory::default());
    let capture = Arc::new(FakeCapture::default());
    let (sink, events) = EventSink::channel();
    let media = LocalMediaSource::new(capture.clone(), MediaConstraints::default());
    let (machine, engine_rx) = NegotiationMachine::new(
        ME,
        EngineConfig::default(),
        directory.clone(),
        media,
        engines.clone(),
        sink,
    );
    Harness {
        machine,
        engine_rx,
        events,
        directory,
        engines,
        capture,
    }
}

impl Harness {
    /// Dispatches every queued engine callback and, unless the directory
    /// is stalling them, waits for the candidate submissions it started.
    pub async fn pump_engine(&mut self) {
        while let Ok(ev) = self.engine_rx.try_recv() {
            self.machine.handle_engine_event(ev).await;
        }
        if !self.directory.stall_candidate.load(Ordering::SeqCst) {
            while self.machine.reap_submission().await.is_some() {}
        }
    }

    pub fn take_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    pub async fn remote_candidate(&mut self, call_id: &str, candidate: &str) {
        self.machine
            .handle_signal(SignalEvent::RemoteCandidate {
                call_id: call_id.into(),
                candidate: IceCandidate::new(candidate),
            })
            .await;
    }

    pub async fn answer(&mut self, call_id: &str) {
        self.machine
            .handle_signal(SignalEvent::Answer {
                call_id: call_id.into(),
                answer: SessionDescription::answer("remote-answer"),
            })
            .await;
    }

    pub async fn incoming(&mut self, call_id: &str, caller: &str) {
        self.machine
            .handle_signal(SignalEvent::IncomingCall {
                caller_id: caller.to_owned(),
                recipient_id: ME.to_owned(),
                call_id: call_id.into(),
                offer: SessionDescription::offer("remote-offer"),
            })
            .await;
    }
}
