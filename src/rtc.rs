// src/rtc.rs
//
// webrtc-rs backend for the peer-link and capture seams.
//
// `WebRtcLinkFactory` builds one `RTCPeerConnection` per remote peer from the
// configured ICE servers and UDP port range.  Candidates are trickled through
// the signaling channel as they are gathered; remote RTP is drained and
// counted per remote track.
//
// `SyntheticDevices` stands in for real capture hardware in the headless
// binary: every track is a `TrackLocalStaticSample` fed by a pump task that
// writes silent Opus frames or blank VP8 frames.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::{Config, IceServerConfig};
use crate::error::{CallError, CallResult};
use crate::media::{CameraFacing, CaptureTrack, LocalTrack, MediaDevices, RemoteTrack};
use crate::peer::{LinkEvent, LinkState, PeerLink, PeerLinkFactory, SdpKind};
use crate::room::{PeerId, TrackKind, TrackSource};
use crate::signaling::IceCandidate;

// ─── PeerConnection factory ─────────────────────────────────────────────────

pub struct WebRtcLinkFactory {
    ice_servers: Vec<IceServerConfig>,
    udp_port_min: u16,
    udp_port_max: u16,
}

impl WebRtcLinkFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            ice_servers: config.ice_servers(),
            udp_port_min: config.udp_port_min,
            udp_port_max: config.udp_port_max,
        }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = webrtc::api::setting_engine::SettingEngine::default();
        if self.udp_port_min > 0 && self.udp_port_max > 0 {
            let ephemeral =
                webrtc::ice::udp_network::EphemeralUDP::new(self.udp_port_min, self.udp_port_max)
                    .map_err(|e| webrtc::Error::new(format!("invalid UDP port range: {e}")))?;
            setting_engine
                .set_udp_network(webrtc::ice::udp_network::UDPNetwork::Ephemeral(ephemeral));
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .ice_servers
            .iter()
            .cloned()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> CallResult<Arc<dyn PeerLink>> {
        let pc = self.create_peer_connection().await.map_err(|e| {
            warn!(peer = %remote, "create_peer_connection failed: {e}");
            CallError::link(e)
        })?;
        let cancel = CancellationToken::new();

        // Trickle ICE: every gathered candidate goes straight to the actor.
        {
            let tx = events.clone();
            let peer = remote.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let tx = tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(LinkEvent::LocalCandidate(from_init(init)));
                        }
                        Err(e) => warn!(peer = %peer, "candidate serialization failed: {e}"),
                    }
                })
            }));
        }

        {
            let tx = events.clone();
            let peer = remote.clone();
            let cancel = cancel.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                let peer = peer.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    info!(peer = %peer, ?kind, ssrc = track.ssrc(), "remote track received");

                    let remote = RemoteTrack::new(track.id(), kind, track.stream_id());
                    let packets = remote.packet_counter();
                    let _ = tx.send(LinkEvent::RemoteTrack(remote));

                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                result = track.read_rtp() => match result {
                                    Ok(_) => {
                                        packets.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        debug!(peer = %peer, "RTP read ended: {e}");
                                        break;
                                    }
                                },
                            }
                        }
                    });
                })
            }));
        }

        {
            let tx = events;
            let peer = remote.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                debug!(peer = %peer, %state, "peer connection state");
                if let Some(state) = link_state(state) {
                    let _ = tx.send(LinkEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(WebRtcLink {
            pc,
            senders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            cancel,
        }))
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

// ─── PeerLink ───────────────────────────────────────────────────────────────

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    /// One sender per media kind; later track sets replace into it.
    senders: Mutex<Vec<(TrackKind, Arc<RTCRtpSender>)>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn set_outgoing_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()> {
        let mut senders = self.senders.lock().await;
        for track in tracks {
            let synthetic = track
                .as_any()
                .downcast_ref::<SyntheticTrack>()
                .ok_or_else(|| CallError::Link(format!("unsupported capture track {}", track.id())))?;
            let rtp = synthetic.rtp_track();
            let kind = track.kind();

            if let Some((_, sender)) = senders.iter().find(|(k, _)| *k == kind) {
                sender.replace_track(Some(rtp)).await.map_err(|e| {
                    warn!(track = %track.id(), "replace_track failed: {e}");
                    CallError::link(e)
                })?;
                continue;
            }

            let sender = self.pc.add_track(rtp).await.map_err(|e| {
                warn!(track = %track.id(), "add_track failed: {e}");
                CallError::link(e)
            })?;
            spawn_rtcp_drain(sender.clone(), self.cancel.clone());
            senders.push((kind, sender));
        }
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<String> {
        let offer = self.pc.create_offer(None).await.map_err(|e| {
            warn!("create_offer failed: {e}");
            CallError::link(e)
        })?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(|e| {
            warn!("set_local_description failed: {e}");
            CallError::link(e)
        })?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> CallResult<String> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            warn!("create_answer failed: {e}");
            CallError::link(e)
        })?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(|e| {
            warn!("set_local_description failed: {e}");
            CallError::link(e)
        })?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> CallResult<()> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| {
            warn!(?kind, "invalid remote SDP: {e}");
            CallError::link(e)
        })?;

        self.pc.set_remote_description(desc).await.map_err(|e| {
            warn!(?kind, "set_remote_description failed: {e}");
            CallError::link(e)
        })
    }

    async fn rollback(&self) -> CallResult<()> {
        // The rollback description must still carry a parseable SDP.
        let Some(pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        desc.sdp = pending.sdp;
        self.pc.set_local_description(desc).await.map_err(|e| {
            warn!("rollback failed: {e}");
            CallError::link(e)
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(CallError::link)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.pc.close().await {
            warn!("peer connection close failed: {e}");
        }
    }
}

/// Interceptors only run if RTCP is read off each sender.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = sender.read_rtcp() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

// ─── Synthetic capture ──────────────────────────────────────────────────────

/// Opus frame for 20ms of silence.
const SILENT_OPUS: &[u8] = &[0xf8, 0xff, 0xfe];
/// VP8 keyframe header for a 16x16 frame; carries no image data.
const BLANK_VP8: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(100);

pub struct SyntheticTrack {
    id: String,
    source: TrackSource,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: AtomicBool,
    pump: CancellationToken,
}

impl SyntheticTrack {
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtp.clone()
    }
}

impl fmt::Debug for SyntheticTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl CaptureTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> TrackSource {
        self.source
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.pump.cancel();
            debug!(track = %self.id, "synthetic track stopped");
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for SyntheticTrack {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}

/// Capture devices backed by generated media.
pub struct SyntheticDevices {
    stream_id: String,
    next_id: AtomicU64,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            stream_id: format!("meshcall-{}", Uuid::new_v4()),
            next_id: AtomicU64::new(0),
        }
    }

    fn open(&self, source: TrackSource, tag: &str) -> LocalTrack {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{tag}-{n}");
        let (mime, payload, frame) = match source.kind() {
            TrackKind::Audio => (MIME_TYPE_OPUS, SILENT_OPUS, AUDIO_FRAME),
            TrackKind::Video => (MIME_TYPE_VP8, BLANK_VP8, VIDEO_FRAME),
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            id.clone(),
            self.stream_id.clone(),
        ));

        let enabled = Arc::new(AtomicBool::new(true));
        let pump = CancellationToken::new();
        spawn_pump(rtp.clone(), enabled.clone(), pump.clone(), payload, frame);

        info!(track = %id, ?source, "synthetic track opened");
        Arc::new(SyntheticTrack {
            id,
            source,
            rtp,
            enabled,
            stopped: AtomicBool::new(false),
            pump,
        })
    }
}

fn spawn_pump(
    rtp: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    cancel: CancellationToken,
    payload: &'static [u8],
    frame: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !enabled.load(Ordering::Relaxed) {
                        continue;
                    }
                    let sample = Sample {
                        data: Bytes::from_static(payload),
                        duration: frame,
                        ..Default::default()
                    };
                    if let Err(e) = rtp.write_sample(&sample).await {
                        debug!("sample write failed: {e}");
                    }
                }
            }
        }
    });
}

fn facing_tag(facing: CameraFacing) -> &'static str {
    match facing {
        CameraFacing::User => "camera-user",
        CameraFacing::Environment => "camera-env",
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_camera_and_microphone(&self, facing: CameraFacing) -> CallResult<Vec<LocalTrack>> {
        Ok(vec![
            self.open(TrackSource::Microphone, "mic"),
            self.open(TrackSource::Camera, facing_tag(facing)),
        ])
    }

    async fn open_camera(&self, facing: CameraFacing) -> CallResult<LocalTrack> {
        Ok(self.open(TrackSource::Camera, facing_tag(facing)))
    }

    async fn open_screen(&self) -> CallResult<LocalTrack> {
        Ok(self.open(TrackSource::Screen, "screen"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> Config {
        Config {
            stun_urls: vec![],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn synthetic_tracks_stop_their_pump() {
        let devices = SyntheticDevices::new();
        let tracks = devices
            .open_camera_and_microphone(CameraFacing::User)
            .await
            .unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind(), TrackKind::Audio);
        assert_eq!(tracks[1].source(), TrackSource::Camera);

        let synthetic = tracks[1].as_any().downcast_ref::<SyntheticTrack>().unwrap();
        tracks[1].stop();
        tracks[1].stop();
        assert!(tracks[1].is_stopped());
        assert!(synthetic.pump.is_cancelled());
        assert!(!tracks[0].is_stopped());
    }

    #[test]
    fn connection_states_map_to_link_states() {
        assert_eq!(link_state(RTCPeerConnectionState::Connected), Some(LinkState::Connected));
        assert_eq!(link_state(RTCPeerConnectionState::Failed), Some(LinkState::Failed));
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn candidates_convert_both_ways() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert_eq!(from_init(to_init(candidate.clone())), candidate);
    }

    #[tokio::test]
    async fn offer_describes_outgoing_tracks() {
        let factory = WebRtcLinkFactory::new(&offline_config());
        let devices = SyntheticDevices::new();
        let tracks = devices
            .open_camera_and_microphone(CameraFacing::User)
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory
            .create(&PeerId::parse("remote").unwrap(), tx)
            .await
            .unwrap();
        link.set_outgoing_tracks(&tracks).await.unwrap();
        let sdp = link.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));

        // a second track set reuses the senders
        let screen = devices.open_screen().await.unwrap();
        link.set_outgoing_tracks(&[tracks[0].clone(), screen.clone()])
            .await
            .unwrap();

        link.close().await;
        link.close().await;
        for track in tracks.iter().chain(std::iter::once(&screen)) {
            track.stop();
        }
    }
}
