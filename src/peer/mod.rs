pub mod connection;
pub mod ice;
pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalStream, TrackKind};

pub use connection::RtcPeerSessionFactory;
pub use types::{ConnectionState, IceCandidate, SdpKind, ServerConfig, SessionDescription};

/// Settings a peer engine is built with.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Relay/reflection endpoints used for candidate discovery.
    pub ice_servers: Vec<ServerConfig>,
}

/// A track the remote side started sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
}

/// A callback from one engine instance, tagged with the generation the
/// engine was created under.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub generation: u64,
    pub kind: EngineEventKind,
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// One peer media session. Descriptions are settable once each;
/// remote candidates are accepted only after the remote description.
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn generation(&self) -> u64;

    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    fn has_remote_description(&self) -> bool;

    /// Fails with `CandidateRejected` before the remote description is set.
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Stops outbound tracks and releases the connection. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(
        &self,
        config: &EngineConfig,
        generation: u64,
        events: EngineEventSender,
    ) -> Result<Box<dyn PeerSession>>;
}
