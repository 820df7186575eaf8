// src/sim.rs
//
// In-process simulated capture devices and peer links.
//
// Used by the tests and by offline runs.  Both sides count the resources they
// hand out (open capture handles, open links) so callers can assert that
// nothing leaks across join/leave cycles.
//
// A simulated link follows the offer/answer rules of a real one closely
// enough to exercise the negotiation state machine: descriptions must be
// applied in a valid order, a local offer can be rolled back, and the link
// only "connects" after both descriptions and at least one remote candidate
// are in place.  Its SDP is a small JSON document listing the sender's
// tracks; every track id the remote side sends is surfaced once as a remote
// track.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CallError, CallResult};
use crate::media::{CameraFacing, CaptureTrack, LocalTrack, MediaDevices, RemoteTrack};
use crate::peer::{LinkEvent, LinkState, PeerLink, PeerLinkFactory, SdpKind};
use crate::room::{PeerId, TrackKind, TrackSource};
use crate::signaling::IceCandidate;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimulatedTrack {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    open: Arc<AtomicUsize>,
}

impl CaptureTrack for SimulatedTrack {
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
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct DevicesInner {
    open: Arc<AtomicUsize>,
    next_id: AtomicU64,
    deny_camera: AtomicBool,
    deny_screen: AtomicBool,
    hang_screen: AtomicBool,
    acquire_delay_ms: AtomicU64,
}

/// Capture devices that always succeed unless told otherwise.
#[derive(Clone, Default)]
pub struct SimulatedDevices {
    inner: Arc<DevicesInner>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture handles opened and not yet stopped.
    pub fn open_handles(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn deny_camera(&self, deny: bool) {
        self.inner.deny_camera.store(deny, Ordering::SeqCst);
    }

    pub fn deny_screen(&self, deny: bool) {
        self.inner.deny_screen.store(deny, Ordering::SeqCst);
    }

    /// Screen capture never resolves, like a picker nobody answers.
    pub fn hang_screen(&self, hang: bool) {
        self.inner.hang_screen.store(hang, Ordering::SeqCst);
    }

    /// Make camera+microphone acquisition take this long (permission
    /// prompt stand-in).
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.inner
            .acquire_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn open(&self, source: TrackSource, tag: &str) -> LocalTrack {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Arc::new(SimulatedTrack {
            id: format!("sim-{tag}-{n}"),
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            open: self.inner.open.clone(),
        })
    }
}

fn facing_tag(facing: CameraFacing) -> &'static str {
    match facing {
        CameraFacing::User => "camera-user",
        CameraFacing::Environment => "camera-env",
    }
}

#[async_trait]
impl MediaDevices for SimulatedDevices {
    async fn open_camera_and_microphone(&self, facing: CameraFacing) -> CallResult<Vec<LocalTrack>> {
        let delay = self.inner.acquire_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.inner.deny_camera.load(Ordering::SeqCst) {
            return Err(CallError::CaptureDenied("camera permission refused".into()));
        }
        Ok(vec![
            self.open(TrackSource::Microphone, "mic"),
            self.open(TrackSource::Camera, facing_tag(facing)),
        ])
    }

    async fn open_camera(&self, facing: CameraFacing) -> CallResult<LocalTrack> {
        if self.inner.deny_camera.load(Ordering::SeqCst) {
            return Err(CallError::CaptureDenied("camera permission refused".into()));
        }
        Ok(self.open(TrackSource::Camera, facing_tag(facing)))
    }

    async fn open_screen(&self) -> CallResult<LocalTrack> {
        if self.inner.hang_screen.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.inner.deny_screen.load(Ordering::SeqCst) {
            return Err(CallError::CaptureDenied("screen capture refused".into()));
        }
        Ok(self.open(TrackSource::Screen, "screen"))
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SimTrackDesc {
    id: String,
    kind: TrackKind,
}

/// The SDP stand-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SimDescription {
    session: String,
    tracks: Vec<SimTrackDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
struct FactoryInner {
    open: AtomicUsize,
    created: AtomicUsize,
    next_id: AtomicU64,
    stall: AtomicBool,
}

/// Creates `SimulatedLink`s and counts the open ones.
#[derive(Clone, Default)]
pub struct SimulatedLinkFactory {
    inner: Arc<FactoryInner>,
}

impl SimulatedLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links created and not yet closed.
    pub fn open_links(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn created_links(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Links created from now on never gather candidates, so they never
    /// connect.
    pub fn stall(&self, stall: bool) {
        self.inner.stall.store(stall, Ordering::SeqCst);
    }

    /// A well-formed offer carrying no tracks, for driving a peer by hand.
    pub fn offer_sdp(&self, session: &str) -> String {
        let desc = SimDescription {
            session: session.to_string(),
            tracks: Vec::new(),
        };
        serde_json::to_string(&desc).unwrap_or_default()
    }
}

#[async_trait]
impl PeerLinkFactory for SimulatedLinkFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> CallResult<Arc<dyn PeerLink>> {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        let _ = events.send(LinkEvent::StateChanged(LinkState::New));
        debug!(peer = %remote, link = n, "simulated link created");
        Ok(Arc::new(SimulatedLink {
            id: format!("link-{n}"),
            events,
            factory: self.inner.clone(),
            gather: !self.inner.stall.load(Ordering::SeqCst),
            state: Mutex::new(LinkInner {
                signaling: SignalingState::Stable,
                tracks: Vec::new(),
                local: None,
                remote: None,
                remote_candidates: 0,
                connected: false,
                closed: false,
                surfaced: HashSet::new(),
                candidate_seq: 0,
            }),
        }))
    }
}

struct LinkInner {
    signaling: SignalingState,
    tracks: Vec<SimTrackDesc>,
    local: Option<SimDescription>,
    remote: Option<SimDescription>,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
    surfaced: HashSet<String>,
    candidate_seq: u64,
}

pub struct SimulatedLink {
    id: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    factory: Arc<FactoryInner>,
    gather: bool,
    state: Mutex<LinkInner>,
}

impl SimulatedLink {
    fn describe(&self, inner: &LinkInner) -> SimDescription {
        SimDescription {
            session: self.id.clone(),
            tracks: inner.tracks.clone(),
        }
    }

    fn gather_candidate(&self, inner: &mut LinkInner) {
        if !self.gather {
            return;
        }
        inner.candidate_seq += 1;
        let _ = self.events.send(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.id, 40000 + inner.candidate_seq),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    /// Connect once everything is in place, then surface new remote tracks.
    fn check_connected(&self, inner: &mut LinkInner) {
        if inner.closed
            || inner.signaling != SignalingState::Stable
            || inner.local.is_none()
            || inner.remote_candidates == 0
        {
            return;
        }
        let Some(remote) = inner.remote.clone() else {
            return;
        };
        if !inner.connected {
            inner.connected = true;
            let _ = self.events.send(LinkEvent::StateChanged(LinkState::Connected));
        }
        for track in remote.tracks {
            if inner.surfaced.insert(track.id.clone()) {
                let _ = self.events.send(LinkEvent::RemoteTrack(RemoteTrack::new(
                    track.id,
                    track.kind,
                    remote.session.clone(),
                )));
            }
        }
    }

    fn ensure_open(inner: &LinkInner) -> CallResult<()> {
        if inner.closed {
            return Err(CallError::link("link closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for SimulatedLink {
    async fn set_outgoing_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()> {
        let mut inner = self.state.lock().unwrap();
        Self::ensure_open(&inner)?;
        inner.tracks = tracks
            .iter()
            .map(|t| SimTrackDesc {
                id: t.id().to_string(),
                kind: t.kind(),
            })
            .collect();
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<String> {
        let mut inner = self.state.lock().unwrap();
        Self::ensure_open(&inner)?;
        if inner.signaling == SignalingState::HaveRemoteOffer {
            return Err(CallError::link("cannot offer while a remote offer is pending"));
        }
        let desc = self.describe(&inner);
        inner.local = Some(desc.clone());
        inner.signaling = SignalingState::HaveLocalOffer;
        self.gather_candidate(&mut inner);
        serde_json::to_string(&desc).map_err(CallError::link)
    }

    async fn create_answer(&self) -> CallResult<String> {
        let mut inner = self.state.lock().unwrap();
        Self::ensure_open(&inner)?;
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(CallError::link("no remote offer to answer"));
        }
        let desc = self.describe(&inner);
        inner.local = Some(desc.clone());
        inner.signaling = SignalingState::Stable;
        self.gather_candidate(&mut inner);
        self.check_connected(&mut inner);
        serde_json::to_string(&desc).map_err(CallError::link)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> CallResult<()> {
        let desc: SimDescription = serde_json::from_str(&sdp).map_err(CallError::link)?;
        let mut inner = self.state.lock().unwrap();
        Self::ensure_open(&inner)?;
        match (kind, inner.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => {
                inner.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                inner.signaling = SignalingState::Stable;
            }
            (kind, state) => {
                return Err(CallError::link(format!(
                    "cannot apply remote {kind:?} in {state:?}"
                )));
            }
        }
        inner.remote = Some(desc);
        self.check_connected(&mut inner);
        Ok(())
    }

    async fn rollback(&self) -> CallResult<()> {
        let mut inner = self.state.lock().unwrap();
        if inner.signaling == SignalingState::HaveLocalOffer {
            inner.signaling = SignalingState::Stable;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        if candidate.candidate.is_empty() {
            return Err(CallError::link("empty candidate"));
        }
        let mut inner = self.state.lock().unwrap();
        Self::ensure_open(&inner)?;
        inner.remote_candidates += 1;
        self.check_connected(&mut inner);
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.state.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.factory.open.fetch_sub(1, Ordering::SeqCst);
        debug!(link = %self.id, "simulated link closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn candidates(events: &[LinkEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn offer_answer_connects_and_surfaces_tracks() {
        let devices = SimulatedDevices::new();
        let tracks = devices
            .open_camera_and_microphone(CameraFacing::User)
            .await
            .unwrap();
        let factory = SimulatedLinkFactory::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = factory.create(&peer("b"), tx_a).await.unwrap();
        let b = factory.create(&peer("a"), tx_b).await.unwrap();

        a.set_outgoing_tracks(&tracks).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(SdpKind::Offer, offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(SdpKind::Answer, answer).await.unwrap();

        for c in candidates(&drain(&mut rx_a).await) {
            b.add_ice_candidate(c).await.unwrap();
        }
        let b_events = drain(&mut rx_b).await;
        for c in candidates(&b_events) {
            a.add_ice_candidate(c).await.unwrap();
        }

        let remote: Vec<_> = b_events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::RemoteTrack(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(remote, vec![TrackKind::Audio, TrackKind::Video]);
        assert!(b_events
            .iter()
            .any(|e| matches!(e, LinkEvent::StateChanged(LinkState::Connected))));

        assert_eq!(factory.open_links(), 2);
        a.close().await;
        a.close().await;
        b.close().await;
        assert_eq!(factory.open_links(), 0);
    }

    #[tokio::test]
    async fn glare_requires_rollback() {
        let factory = SimulatedLinkFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create(&peer("x"), tx).await.unwrap();

        link.create_offer().await.unwrap();
        let remote_offer = factory.offer_sdp("other");
        assert!(link
            .set_remote_description(SdpKind::Offer, remote_offer.clone())
            .await
            .is_err());

        link.rollback().await.unwrap();
        link.set_remote_description(SdpKind::Offer, remote_offer).await.unwrap();
        link.create_answer().await.unwrap();
        link.close().await;
    }

    #[tokio::test]
    async fn stopped_tracks_release_handles() {
        let devices = SimulatedDevices::new();
        let track = devices.open_screen().await.unwrap();
        assert_eq!(devices.open_handles(), 1);
        track.stop();
        track.stop();
        assert_eq!(devices.open_handles(), 0);
        assert!(track.as_any().downcast_ref::<SimulatedTrack>().is_some());
    }
}
