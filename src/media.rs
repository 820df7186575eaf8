// src/media.rs
//
// Media stream aggregator.
//
// Owns the local capture tracks (microphone plus one video track that is
// either the camera or a screen surrogate) and the map of remote streams
// keyed by peer.  The aggregator never talks to peer connections itself;
// operations that change the outgoing track set return `true` and the session
// layer fans the change out as a renegotiation.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CallError, CallResult};
use crate::room::{PeerId, TrackKind, TrackSource};

// ---------------------------------------------------------------------------
// Capture seams
// ---------------------------------------------------------------------------

/// One local capture track.  Dropping the last handle does not release the
/// device; `stop` does.
pub trait CaptureTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn source(&self) -> TrackSource;

    fn kind(&self) -> TrackKind {
        self.source().kind()
    }

    /// Muting keeps the track negotiated and just stops sending content.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Release the underlying device.  Idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Lets a peer-link backend recover its concrete track type.
    fn as_any(&self) -> &dyn Any;
}

pub type LocalTrack = Arc<dyn CaptureTrack>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    User,
    Environment,
}

impl CameraFacing {
    pub fn flipped(self) -> Self {
        match self {
            CameraFacing::User => CameraFacing::Environment,
            CameraFacing::Environment => CameraFacing::User,
        }
    }
}

/// Capture device access.  Failures are reported as
/// `CallError::CaptureDenied`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_camera_and_microphone(&self, facing: CameraFacing)
        -> CallResult<Vec<LocalTrack>>;

    async fn open_camera(&self, facing: CameraFacing) -> CallResult<LocalTrack>;

    async fn open_screen(&self) -> CallResult<LocalTrack>;
}

/// A video capture to open in place of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    Screen,
    Camera(CameraFacing),
}

impl CaptureRequest {
    pub async fn open(self, devices: &dyn MediaDevices) -> CallResult<LocalTrack> {
        match self {
            CaptureRequest::Screen => devices.open_screen().await,
            CaptureRequest::Camera(facing) => devices.open_camera(facing).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Local state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Camera,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub capture_mode: CaptureMode,
    pub facing: CameraFacing,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            mic_enabled: true,
            camera_enabled: true,
            capture_mode: CaptureMode::Camera,
            facing: CameraFacing::User,
        }
    }
}

/// View-friendly description of a local track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTrackInfo {
    pub id: String,
    pub source: TrackSource,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Remote streams
// ---------------------------------------------------------------------------

/// A track received from a remote peer.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    packets: Arc<AtomicU64>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            packets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter the receiving backend bumps per media packet.
    pub fn packet_counter(&self) -> Arc<AtomicU64> {
        self.packets.clone()
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.stream_id == other.stream_id
    }
}

/// Everything received from one peer: at most one audio and one video track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteStream {
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
}

impl RemoteStream {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.audio.iter().chain(self.video.iter())
    }
}

// ---------------------------------------------------------------------------
// MediaAggregator
// ---------------------------------------------------------------------------

pub struct MediaAggregator {
    devices: Arc<dyn MediaDevices>,
    state: LocalMediaState,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    remote: BTreeMap<PeerId, RemoteStream>,
}

impl MediaAggregator {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: LocalMediaState::default(),
            audio: None,
            video: None,
            remote: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub fn has_local_media(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }

    /// Open camera and microphone.  Any failure is `CaptureDenied`.
    pub async fn acquire_local_media(&mut self) -> CallResult<()> {
        let tracks = self
            .devices
            .open_camera_and_microphone(self.state.facing)
            .await
            .map_err(|e| match e {
                CallError::CaptureDenied(_) => e,
                other => CallError::CaptureDenied(other.to_string()),
            })?;

        for track in tracks {
            match track.kind() {
                TrackKind::Audio => {
                    track.set_enabled(self.state.mic_enabled);
                    replace(&mut self.audio, track);
                }
                TrackKind::Video => {
                    track.set_enabled(self.state.camera_enabled);
                    replace(&mut self.video, track);
                }
            }
        }
        if !self.has_local_media() {
            return Err(CallError::CaptureDenied("no capture device available".into()));
        }
        self.state.capture_mode = CaptureMode::Camera;
        info!(
            audio = self.audio.is_some(),
            video = self.video.is_some(),
            "local media acquired"
        );
        Ok(())
    }

    pub fn set_mic_enabled(&mut self, enabled: bool) {
        self.state.mic_enabled = enabled;
        if let Some(track) = &self.audio {
            track.set_enabled(enabled);
        }
    }

    /// Applies to the camera only; a screen surrogate keeps sending.
    pub fn set_camera_enabled(&mut self, enabled: bool) {
        self.state.camera_enabled = enabled;
        if self.state.capture_mode == CaptureMode::Camera {
            if let Some(track) = &self.video {
                track.set_enabled(enabled);
            }
        }
    }

    // Track changes are split in two: a request describing what to open, and
    // `install` once the device handed a track back.  The open itself runs
    // outside the aggregator so the caller can abandon it.

    /// Screen capture replacing the video track.  `None` when already
    /// sharing.
    pub fn screen_share_request(&self) -> Option<CaptureRequest> {
        (self.state.capture_mode != CaptureMode::Screen).then_some(CaptureRequest::Screen)
    }

    /// Camera replacing the screen surrogate.  `None` when the camera is
    /// already active.
    pub fn camera_request(&self) -> Option<CaptureRequest> {
        (self.state.capture_mode != CaptureMode::Camera)
            .then_some(CaptureRequest::Camera(self.state.facing))
    }

    /// Camera re-opened with the other facing.  While screen sharing this
    /// only flips the stored preference and returns `None`.
    pub fn flip_request(&mut self) -> Option<CaptureRequest> {
        let facing = self.state.facing.flipped();
        if self.state.capture_mode == CaptureMode::Screen {
            self.state.facing = facing;
            return None;
        }
        Some(CaptureRequest::Camera(facing))
    }

    /// Make `track`, opened for `request`, the outgoing video track.
    pub fn install(&mut self, request: CaptureRequest, track: LocalTrack) {
        match request {
            CaptureRequest::Screen => {
                replace(&mut self.video, track);
                self.state.capture_mode = CaptureMode::Screen;
                info!("switched to screen share");
            }
            CaptureRequest::Camera(facing) => {
                track.set_enabled(self.state.camera_enabled);
                replace(&mut self.video, track);
                self.state.capture_mode = CaptureMode::Camera;
                self.state.facing = facing;
                info!(?facing, "switched to camera");
            }
        }
    }

    /// The tracks every peer connection should be sending.
    pub fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn local_tracks(&self) -> Vec<LocalTrackInfo> {
        self.outgoing_tracks()
            .iter()
            .map(|t| LocalTrackInfo {
                id: t.id().to_string(),
                source: t.source(),
                enabled: t.is_enabled(),
            })
            .collect()
    }

    /// Record a track received from `peer`.  A track of the same kind
    /// replaces the previous one.  Returns `true` when this is the first
    /// track seen from that peer.
    pub fn add_remote_track(&mut self, peer: &PeerId, track: RemoteTrack) -> bool {
        let is_new = !self.remote.contains_key(peer);
        let stream = self.remote.entry(peer.clone()).or_default();
        debug!(peer = %peer, track = %track.id, kind = ?track.kind, "remote track");
        match track.kind {
            TrackKind::Audio => stream.audio = Some(track),
            TrackKind::Video => stream.video = Some(track),
        }
        is_new
    }

    pub fn remove_remote(&mut self, peer: &PeerId) -> bool {
        self.remote.remove(peer).is_some()
    }

    pub fn remote_streams(&self) -> &BTreeMap<PeerId, RemoteStream> {
        &self.remote
    }

    /// Stop every local track, forget remote streams and reset the local
    /// state.
    pub fn release(&mut self) {
        for track in self.audio.take().into_iter().chain(self.video.take()) {
            track.stop();
        }
        self.remote.clear();
        self.state = LocalMediaState::default();
        debug!("local media released");
    }
}

impl Drop for MediaAggregator {
    fn drop(&mut self) {
        self.release();
    }
}

/// Install `track` in `slot`, stopping whatever was there.
fn replace(slot: &mut Option<LocalTrack>, track: LocalTrack) {
    if let Some(old) = slot.replace(track) {
        old.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevices;

    fn aggregator(devices: &SimulatedDevices) -> MediaAggregator {
        MediaAggregator::new(Arc::new(devices.clone()))
    }

    async fn apply(
        media: &mut MediaAggregator,
        devices: &SimulatedDevices,
        request: Option<CaptureRequest>,
    ) -> CallResult<bool> {
        let Some(request) = request else {
            return Ok(false);
        };
        let track = request.open(devices).await?;
        media.install(request, track);
        Ok(true)
    }

    async fn screen_share(media: &mut MediaAggregator, devices: &SimulatedDevices) -> CallResult<bool> {
        let request = media.screen_share_request();
        apply(media, devices, request).await
    }

    async fn camera(media: &mut MediaAggregator, devices: &SimulatedDevices) -> CallResult<bool> {
        let request = media.camera_request();
        apply(media, devices, request).await
    }

    async fn flip(media: &mut MediaAggregator, devices: &SimulatedDevices) -> CallResult<bool> {
        let request = media.flip_request();
        apply(media, devices, request).await
    }

    #[tokio::test]
    async fn acquire_opens_camera_and_microphone() {
        let devices = SimulatedDevices::new();
        let mut media = aggregator(&devices);
        media.acquire_local_media().await.unwrap();

        let sources: Vec<_> = media.outgoing_tracks().iter().map(|t| t.source()).collect();
        assert_eq!(sources, vec![TrackSource::Microphone, TrackSource::Camera]);
        assert_eq!(devices.open_handles(), 2);

        media.release();
        assert_eq!(devices.open_handles(), 0);
    }

    #[tokio::test]
    async fn denied_capture_is_reported() {
        let devices = SimulatedDevices::new();
        devices.deny_camera(true);
        let mut media = aggregator(&devices);
        let err = media.acquire_local_media().await.unwrap_err();
        assert!(matches!(err, CallError::CaptureDenied(_)));
        assert!(err.is_fatal());
        assert_eq!(devices.open_handles(), 0);
    }

    #[tokio::test]
    async fn mute_toggles_flags_without_replacing_tracks() {
        let devices = SimulatedDevices::new();
        let mut media = aggregator(&devices);
        media.acquire_local_media().await.unwrap();
        let before: Vec<String> = media.outgoing_tracks().iter().map(|t| t.id().to_string()).collect();

        media.set_mic_enabled(false);
        media.set_camera_enabled(false);

        let tracks = media.outgoing_tracks();
        let after: Vec<String> = tracks.iter().map(|t| t.id().to_string()).collect();
        assert_eq!(before, after);
        assert!(tracks.iter().all(|t| !t.is_enabled()));
        assert!(!media.state().mic_enabled);
        assert!(!media.state().camera_enabled);
    }

    #[tokio::test]
    async fn screen_share_replaces_video_and_stops_camera() {
        let devices = SimulatedDevices::new();
        let mut media = aggregator(&devices);
        media.acquire_local_media().await.unwrap();

        assert!(screen_share(&mut media, &devices).await.unwrap());
        assert!(!screen_share(&mut media, &devices).await.unwrap());
        assert_eq!(media.state().capture_mode, CaptureMode::Screen);
        let video = media.outgoing_tracks().pop().unwrap();
        assert_eq!(video.source(), TrackSource::Screen);
        // microphone + screen
        assert_eq!(devices.open_handles(), 2);

        assert!(camera(&mut media, &devices).await.unwrap());
        assert!(video.is_stopped());
        assert_eq!(devices.open_handles(), 2);
    }

    #[tokio::test]
    async fn failed_screen_share_keeps_camera() {
        let devices = SimulatedDevices::new();
        let mut media = aggregator(&devices);
        media.acquire_local_media().await.unwrap();
        devices.deny_screen(true);

        assert!(screen_share(&mut media, &devices).await.is_err());
        assert_eq!(media.state().capture_mode, CaptureMode::Camera);
        assert_eq!(media.outgoing_tracks().len(), 2);
    }

    #[tokio::test]
    async fn flip_reopens_camera_with_other_facing() {
        let devices = SimulatedDevices::new();
        let mut media = aggregator(&devices);
        media.acquire_local_media().await.unwrap();
        let old = media.outgoing_tracks().pop().unwrap();

        assert!(flip(&mut media, &devices).await.unwrap());
        assert_eq!(media.state().facing, CameraFacing::Environment);
        assert!(old.is_stopped());

        // while sharing only the preference flips
        screen_share(&mut media, &devices).await.unwrap();
        assert!(!flip(&mut media, &devices).await.unwrap());
        assert_eq!(media.state().facing, CameraFacing::User);
    }

    #[test]
    fn remote_streams_keep_one_track_per_kind() {
        let devices = SimulatedDevices::new();
        let mut media = aggregator(&devices);
        let peer = PeerId::parse("remote").unwrap();

        let audio = RemoteTrack::new("a1", TrackKind::Audio, "s");
        let counter = audio.packet_counter();
        assert!(media.add_remote_track(&peer, audio));
        assert!(!media.add_remote_track(&peer, RemoteTrack::new("v1", TrackKind::Video, "s")));
        assert!(!media.add_remote_track(&peer, RemoteTrack::new("v2", TrackKind::Video, "s")));

        let stream = media.remote_streams()[&peer].clone();
        assert_eq!(stream.video.as_ref().unwrap().id, "v2");
        assert_eq!(stream.tracks().count(), 2);

        // copies handed to the view read the live counter
        counter.fetch_add(3, Ordering::Relaxed);
        assert_eq!(stream.audio.as_ref().unwrap().packets(), 3);

        assert!(media.remove_remote(&peer));
        assert!(!media.remove_remote(&peer));
    }
}
