//! Local capture stream ownership.
//!
//! The platform capture facility sits behind [`CaptureDevice`]; this module
//! only guarantees that one stream is held per call, handed out idempotently,
//! and stopped exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{CallError, Result};
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// One outbound track. Encoded frames go in through
/// [`LocalTrack::write_sample`]; after `stop` writes are dropped.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// `Ok(false)` once the track is stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() {
            return Ok(false);
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(CallError::engine)?;
        Ok(true)
    }
}

/// Opus frame that decodes to 20 ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Keeps an audio track paced with silent Opus frames until it is stopped.
pub fn spawn_silence_pump(track: LocalTrack) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(AUDIO_FRAME);
        loop {
            ticker.tick().await;
            match track
                .write_sample(Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME)
                .await
            {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(track = track.id(), "audio write failed: {e}");
                    break;
                }
            }
        }
        debug!(track = track.id(), "audio pump stopped");
    })
}

/// A captured stream: a stream id plus its tracks.
#[derive(Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn stop(&self) {
        for t in &self.tracks {
            t.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }
}

/// Platform capture facility.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Requests capture access. Fails with `MediaAccessDenied` when the
    /// platform refuses and `MediaUnavailable` when no capable device exists.
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream>;
}

/// Creates Opus/VP8 sample tracks. Audio tracks are paced with silence;
/// video tracks carry whatever a capture loop writes into them.
#[derive(Debug, Default)]
pub struct SampleCaptureDevice;

impl SampleCaptureDevice {
    fn sample_track(kind: TrackKind, stream_id: &str) -> LocalTrack {
        let (capability, label) = match kind {
            TrackKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio",
            ),
            TrackKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video",
            ),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{label}-{}", random_id()),
            stream_id.to_owned(),
        ));
        LocalTrack::new(kind, track)
    }
}

#[async_trait]
impl CaptureDevice for SampleCaptureDevice {
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(CallError::MediaUnavailable(
                "no audio or video requested".into(),
            ));
        }
        let id = format!("local-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            let audio = Self::sample_track(TrackKind::Audio, &id);
            spawn_silence_pump(audio.clone());
            tracks.push(audio);
        }
        if constraints.video {
            tracks.push(Self::sample_track(TrackKind::Video, &id));
        }
        Ok(LocalStream { id, tracks })
    }
}

/// Holds the local stream for the lifetime of a call.
pub struct LocalMediaSource {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConstraints,
    stream: Option<LocalStream>,
}

impl LocalMediaSource {
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConstraints) -> Self {
        Self {
            device,
            constraints,
            stream: None,
        }
    }

    /// Returns the held stream, capturing one first if none is held.
    pub async fn acquire(&mut self) -> Result<LocalStream> {
        if let Some(stream) = &self.stream {
            debug!(stream = %stream.id, "reusing local stream");
            return Ok(stream.clone());
        }
        let stream = self.device.open(self.constraints).await?;
        info!(
            stream = %stream.id,
            tracks = stream.tracks.len(),
            "local media acquired"
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Stops every track and drops the reference. No-op when nothing is held.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            info!(stream = %stream.id, "local media released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.stream.is_some()
    }
}
