use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalStream, TrackKind};
use crate::peer::ice::{analyze_candidates, to_rtc_ice_servers, DEFAULT_ICE_SERVERS};
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};
use crate::peer::{
    EngineConfig, EngineEvent, EngineEventKind, EngineEventSender, PeerSession,
    PeerSessionFactory, RemoteTrack,
};

/// Создает конфигурацию для peer connection
fn rtc_config(config: &EngineConfig) -> RTCConfiguration {
    let servers = if config.ice_servers.is_empty() {
        DEFAULT_ICE_SERVERS.as_slice()
    } else {
        config.ice_servers.as_slice()
    };

    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Фабрика сессий поверх `RTCPeerConnection`
#[derive(Debug, Default)]
pub struct RtcPeerSessionFactory;

#[async_trait]
impl PeerSessionFactory for RtcPeerSessionFactory {
    async fn create(
        &self,
        config: &EngineConfig,
        generation: u64,
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerSession>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(CallError::engine)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(CallError::engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(config))
                .await
                .map_err(CallError::engine)?,
        );
        let session = RtcPeerSession {
            generation,
            pc,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        session.wire_callbacks(events);
        info!(generation, "peer engine created");
        Ok(Box::new(session))
    }
}

pub struct RtcPeerSession {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl RtcPeerSession {
    fn wire_callbacks(&self, events: EngineEventSender) {
        let generation = self.generation;
        let emit = move |tx: &EngineEventSender, kind: EngineEventKind| {
            // получатель закрыт - машина завершается
            let _ = tx.send(EngineEvent { generation, kind });
        };

        // Локальные кандидаты для статистики по окончании сбора
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));
        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                let gathered = gathered.clone();
                Box::pin(async move {
                    match cand {
                        Some(c) => match c.to_json() {
                            Ok(init) => {
                                let candidate = IceCandidate::from(init);
                                dump_candidate("LOCAL", &candidate);
                                gathered.lock().await.push(candidate.clone());
                                emit(&tx, EngineEventKind::LocalCandidate(candidate));
                            }
                            Err(e) => warn!("local candidate not serializable: {e}"),
                        },
                        None => {
                            // cand == None означает конец сбора
                            analyze_candidates(&gathered.lock().await);
                            emit(&tx, EngineEventKind::GatheringComplete);
                        }
                    }
                })
            }));

        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(generation, "ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let remote = RemoteTrack {
                        kind,
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                    };
                    info!(generation, ?remote, "remote track arrived");
                    emit(&tx, EngineEventKind::RemoteTrack(remote));
                }
                Box::pin(async {})
            },
        ));

        let tx = events;
        let pc_stats = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                info!(generation, "Peer connection state changed to: {:?}", st);
                if matches!(
                    st,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
                ) {
                    if let Some(pc) = pc_stats.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                emit(&tx, EngineEventKind::ConnectionState(ConnectionState::from(st)));
                Box::pin(async {})
            }));
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<()> {
        for track in &stream.tracks {
            let sender = self
                .pc
                .add_track(track.rtc_track())
                .await
                .map_err(CallError::engine)?;
            debug!(track = track.id(), "local track attached");

            // RTCP должен читаться, иначе интерсепторы не работают
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(CallError::engine)?;
        SessionDescription::try_from(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(CallError::engine)?;
        SessionDescription::try_from(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if self.local_set.load(Ordering::SeqCst) {
            return Err(CallError::Engine("local description already set".into()));
        }
        self.pc
            .set_local_description(desc.to_rtc()?)
            .await
            .map_err(CallError::engine)?;
        self.local_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.remote_set.load(Ordering::SeqCst) {
            return Err(CallError::Engine("remote description already set".into()));
        }
        self.pc
            .set_remote_description(desc.to_rtc()?)
            .await
            .map_err(CallError::engine)?;
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if !self.has_remote_description() {
            return Err(CallError::CandidateRejected(
                "remote description not set".into(),
            ));
        }
        dump_candidate("REMOTE", candidate);
        self.pc
            .add_ice_candidate(candidate.to_init())
            .await
            .map_err(|e| CallError::CandidateRejected(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                debug!("sender stop: {e}");
            }
            if let Err(e) = self.pc.remove_track(&sender).await {
                debug!("remove track: {e}");
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(generation = self.generation, "peer connection close failed: {e}");
        }
        info!(generation = self.generation, "peer engine closed");
    }
}
