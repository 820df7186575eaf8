// src/peer.rs
//
// Peer connection manager.
//
// One actor task per remote peer owns that peer's link and negotiation
// state.  Everything addressed to the peer (signals, renegotiation triggers)
// goes through the actor's queue, so transitions for one pair are strictly
// serialized while pairs progress independently.
//
//   Idle ──link created──▶ Negotiating
//     Initiator: offer ──▶ OfferSent ──answer──▶ Connected
//     Responder: offer received ──▶ AnswerSent ──▶ Connected
//   Connected ──track set changed──▶ Renegotiating ──▶ Connected
//   any ──presence gone / link failed / link closed──▶ Terminated
//
// Collisions during renegotiation keep the originally assigned role: the
// initiator ignores an offer that crosses its own, the responder rolls its
// own offer back, answers, and re-offers afterwards.
//
// A round that does not complete within the negotiation timeout is reported
// as stalled and left alone until presence changes or a new trigger arrives.
//
// The manager itself is owned by the session loop; `reconcile` is the only
// place records are created or dropped.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CallResult;
use crate::media::{LocalTrack, RemoteTrack};
use crate::presence::PresenceSnapshot;
use crate::room::{PeerId, Role};
use crate::signaling::{IceCandidate, NegotiationMessage, NegotiationPayload, SignalingChannel};

/// Signals buffered per not-yet-known peer.
const MAX_PENDING_CANDIDATES: usize = 64;
/// Distinct unknown senders buffered at once.
const MAX_PENDING_PEERS: usize = 64;

// ---------------------------------------------------------------------------
// PeerLink seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a link.
#[derive(Debug)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

/// The underlying peer-connection primitive.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Make the link send exactly `tracks` (adding or replacing senders).
    async fn set_outgoing_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()>;

    /// Create an offer, apply it locally and return its SDP.
    async fn create_offer(&self) -> CallResult<String>;

    /// Create an answer to the applied remote offer, apply it locally and
    /// return its SDP.
    async fn create_answer(&self) -> CallResult<String>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> CallResult<()>;

    /// Discard a local offer that has not been answered.
    async fn rollback(&self) -> CallResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()>;

    /// Release the connection.  Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        remote: &PeerId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> CallResult<Arc<dyn PeerLink>>;
}

// ---------------------------------------------------------------------------
// States, reports, counters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Idle,
    Negotiating,
    OfferSent,
    AnswerSent,
    Connected,
    Renegotiating,
    Terminated,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "idle",
            PeerState::Negotiating => "negotiating",
            PeerState::OfferSent => "offer_sent",
            PeerState::AnswerSent => "answer_sent",
            PeerState::Connected => "connected",
            PeerState::Renegotiating => "renegotiating",
            PeerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the UI sees for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub role: Role,
    pub state: PeerState,
    /// The current round exceeded the negotiation timeout.
    pub stalled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Gone from presence, or the session is leaving.
    Departed,
    Failed(String),
    Closed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Departed => f.write_str("departed"),
            TerminationReason::Failed(e) => write!(f, "failed: {e}"),
            TerminationReason::Closed => f.write_str("closed"),
        }
    }
}

/// Actor to session notifications.  `instance` identifies the record that
/// produced the report; reports from a record that has since been replaced
/// are ignored.
#[derive(Debug)]
pub enum PeerReport {
    Status {
        peer: PeerId,
        instance: u64,
        status: PeerStatus,
    },
    Stalled {
        peer: PeerId,
        instance: u64,
        status: PeerStatus,
        waited: Duration,
    },
    RenegotiationStarted {
        peer: PeerId,
        instance: u64,
        role: Role,
    },
    RemoteTrack {
        peer: PeerId,
        instance: u64,
        track: RemoteTrack,
    },
    Terminated {
        peer: PeerId,
        instance: u64,
        role: Role,
        reason: TerminationReason,
    },
}

impl PeerReport {
    pub fn peer(&self) -> &PeerId {
        match self {
            PeerReport::Status { peer, .. }
            | PeerReport::Stalled { peer, .. }
            | PeerReport::RenegotiationStarted { peer, .. }
            | PeerReport::RemoteTrack { peer, .. }
            | PeerReport::Terminated { peer, .. } => peer,
        }
    }

    fn instance(&self) -> u64 {
        match self {
            PeerReport::Status { instance, .. }
            | PeerReport::Stalled { instance, .. }
            | PeerReport::RenegotiationStarted { instance, .. }
            | PeerReport::RemoteTrack { instance, .. }
            | PeerReport::Terminated { instance, .. } => *instance,
        }
    }
}

#[derive(Debug, Default)]
pub struct NegotiationCounters {
    renegotiations: AtomicU64,
    offers_sent: AtomicU64,
    answers_sent: AtomicU64,
    stalls: AtomicU64,
    links_opened: AtomicU64,
    links_closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    /// Renegotiation triggers dispatched to peer records.
    pub renegotiations: u64,
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub stalls: u64,
    pub links_opened: u64,
    pub links_closed: u64,
}

impl NegotiationCounters {
    pub fn snapshot(&self) -> CallStats {
        CallStats {
            renegotiations: self.renegotiations.load(Ordering::Relaxed),
            offers_sent: self.offers_sent.load(Ordering::Relaxed),
            answers_sent: self.answers_sent.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            links_opened: self.links_opened.load(Ordering::Relaxed),
            links_closed: self.links_closed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Per-peer actor
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum PeerInput {
    Signal(NegotiationMessage),
    /// Outgoing track set changed.
    Renegotiate(Vec<LocalTrack>),
}

/// Everything an actor needs besides its link.
struct PeerContext {
    remote: PeerId,
    instance: u64,
    role: Role,
    tracks: Vec<LocalTrack>,
    signaling: SignalingChannel,
    reports: mpsc::UnboundedSender<PeerReport>,
    counters: Arc<NegotiationCounters>,
    timeout: Duration,
}

async fn run_peer(
    ctx: PeerContext,
    factory: Arc<dyn PeerLinkFactory>,
    inputs: mpsc::UnboundedReceiver<PeerInput>,
    cancel: CancellationToken,
) {
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let link = match factory.create(&ctx.remote, link_tx).await {
        Ok(link) => link,
        Err(e) => {
            warn!(peer = %ctx.remote, "could not create peer link: {e}");
            let _ = ctx.reports.send(PeerReport::Terminated {
                peer: ctx.remote.clone(),
                instance: ctx.instance,
                role: ctx.role,
                reason: TerminationReason::Failed(e.to_string()),
            });
            return;
        }
    };
    NegotiationCounters::bump(&ctx.counters.links_opened);

    let mut actor = PeerActor::new(ctx, link);
    let reason = actor.run(inputs, link_rx, &cancel).await;
    actor.teardown(reason).await;
}

struct PeerActor {
    ctx: PeerContext,
    link: Arc<dyn PeerLink>,
    state: PeerState,
    stalled: bool,
    ever_connected: bool,
    deadline: Option<Instant>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    /// Generation of our offer that is waiting for an answer.
    outstanding_offer: Option<u64>,
    last_remote_offer: u64,
    /// Another round must start once the current one completes.
    renegotiate_pending: bool,
}

impl PeerActor {
    fn new(ctx: PeerContext, link: Arc<dyn PeerLink>) -> Self {
        Self {
            ctx,
            link,
            state: PeerState::Idle,
            stalled: false,
            ever_connected: false,
            deadline: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            outstanding_offer: None,
            last_remote_offer: 0,
            renegotiate_pending: false,
        }
    }

    async fn run(
        &mut self,
        mut inputs: mpsc::UnboundedReceiver<PeerInput>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: &CancellationToken,
    ) -> TerminationReason {
        if cancel.is_cancelled() {
            return TerminationReason::Departed;
        }
        if let Err(e) = self.link.set_outgoing_tracks(&self.ctx.tracks).await {
            return TerminationReason::Failed(e.to_string());
        }

        self.arm_deadline();
        self.set_state(PeerState::Negotiating);
        if self.ctx.role == Role::Initiator {
            self.start_offer().await;
        }

        let mut link_open = true;
        loop {
            let sleep_at = self
                .deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return TerminationReason::Departed,

                event = link_events.recv(), if link_open => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_link_event(event).await {
                            return reason;
                        }
                    }
                    None => link_open = false,
                },

                input = inputs.recv() => match input {
                    Some(PeerInput::Signal(msg)) => self.on_signal(msg).await,
                    Some(PeerInput::Renegotiate(tracks)) => self.on_renegotiate(tracks).await,
                    None => return TerminationReason::Departed,
                },

                _ = tokio::time::sleep_until(sleep_at), if self.deadline.is_some() => {
                    self.on_timeout();
                }
            }
        }
    }

    // ── Signals ─────────────────────────────────────────────────────────

    async fn on_signal(&mut self, msg: NegotiationMessage) {
        match msg.payload {
            NegotiationPayload::Offer { sdp } => self.on_offer(msg.generation, sdp).await,
            NegotiationPayload::Answer { sdp } => self.on_answer(msg.generation, sdp).await,
            NegotiationPayload::Candidate(candidate) => self.on_candidate(candidate).await,
        }
    }

    async fn on_offer(&mut self, generation: u64, sdp: String) {
        let peer = &self.ctx.remote;
        if generation <= self.last_remote_offer {
            debug!(peer = %peer, generation, "stale offer ignored");
            return;
        }
        self.last_remote_offer = generation;

        if self.outstanding_offer.is_some() {
            match self.ctx.role {
                Role::Initiator => {
                    debug!(peer = %peer, generation, "colliding offer ignored");
                    return;
                }
                Role::Responder => {
                    debug!(peer = %peer, generation, "offer collision, rolling back local offer");
                    if let Err(e) = self.link.rollback().await {
                        warn!(peer = %peer, "rollback failed: {e}");
                    }
                    self.outstanding_offer = None;
                    self.renegotiate_pending = true;
                }
            }
        }

        if self.state == PeerState::Connected {
            self.enter_renegotiation();
        }
        self.arm_deadline();

        if let Err(e) = self.link.set_remote_description(SdpKind::Offer, sdp).await {
            warn!(peer = %self.ctx.remote, generation, "remote offer rejected: {e}");
            self.mark_stalled();
            return;
        }
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = match self.link.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %self.ctx.remote, generation, "could not create answer: {e}");
                self.mark_stalled();
                return;
            }
        };
        match self.ctx.signaling.send_answer(&self.ctx.remote, answer, generation).await {
            Ok(()) => {
                NegotiationCounters::bump(&self.ctx.counters.answers_sent);
                self.set_state(PeerState::AnswerSent);
                self.complete_round().await;
            }
            Err(e) => {
                warn!(peer = %self.ctx.remote, generation, "{e}");
                self.mark_stalled();
            }
        }
    }

    async fn on_answer(&mut self, generation: u64, sdp: String) {
        if self.outstanding_offer != Some(generation) {
            debug!(peer = %self.ctx.remote, generation, "answer for an older offer ignored");
            return;
        }
        self.outstanding_offer = None;
        if let Err(e) = self.link.set_remote_description(SdpKind::Answer, sdp).await {
            warn!(peer = %self.ctx.remote, generation, "remote answer rejected: {e}");
            self.mark_stalled();
            return;
        }
        self.remote_description_set = true;
        self.flush_candidates().await;
        self.complete_round().await;
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.link.add_ice_candidate(candidate).await {
            warn!(peer = %self.ctx.remote, "remote candidate rejected: {e}");
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                warn!(peer = %self.ctx.remote, "buffered candidate rejected: {e}");
            }
        }
    }

    // ── Rounds ──────────────────────────────────────────────────────────

    async fn on_renegotiate(&mut self, tracks: Vec<LocalTrack>) {
        self.ctx.tracks = tracks;
        if let Err(e) = self.link.set_outgoing_tracks(&self.ctx.tracks).await {
            warn!(peer = %self.ctx.remote, "could not update outgoing tracks: {e}");
        }

        if self.outstanding_offer.is_some() {
            if !self.stalled {
                debug!(peer = %self.ctx.remote, "renegotiation deferred until the current round completes");
                self.renegotiate_pending = true;
                return;
            }
            // Abandon the stalled round and start over.
            if let Err(e) = self.link.rollback().await {
                warn!(peer = %self.ctx.remote, "rollback failed: {e}");
            }
            self.outstanding_offer = None;
        }
        let waiting_for_first_offer =
            self.ctx.role == Role::Responder && !self.ever_connected && !self.stalled;
        if waiting_for_first_offer {
            // The new tracks go into the answer.
            return;
        }
        self.start_offer().await;
    }

    async fn start_offer(&mut self) {
        if self.ever_connected {
            self.enter_renegotiation();
        }
        self.arm_deadline();
        self.stalled = false;

        let sdp = match self.link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(peer = %self.ctx.remote, "could not create offer: {e}");
                self.mark_stalled();
                return;
            }
        };
        match self.ctx.signaling.send_offer(&self.ctx.remote, sdp).await {
            Ok(generation) => {
                NegotiationCounters::bump(&self.ctx.counters.offers_sent);
                self.outstanding_offer = Some(generation);
                debug!(peer = %self.ctx.remote, generation, "offer sent");
                if self.ever_connected {
                    self.publish();
                } else {
                    self.set_state(PeerState::OfferSent);
                }
            }
            Err(e) => {
                warn!(peer = %self.ctx.remote, "{e}");
                if let Err(e) = self.link.rollback().await {
                    warn!(peer = %self.ctx.remote, "rollback failed: {e}");
                }
                self.mark_stalled();
            }
        }
    }

    fn enter_renegotiation(&mut self) {
        if self.state == PeerState::Renegotiating {
            return;
        }
        self.set_state(PeerState::Renegotiating);
        let _ = self.ctx.reports.send(PeerReport::RenegotiationStarted {
            peer: self.ctx.remote.clone(),
            instance: self.ctx.instance,
            role: self.ctx.role,
        });
    }

    async fn complete_round(&mut self) {
        self.deadline = None;
        self.stalled = false;
        self.ever_connected = true;
        self.set_state(PeerState::Connected);

        if self.renegotiate_pending {
            self.renegotiate_pending = false;
            self.start_offer().await;
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.ctx.timeout);
    }

    fn on_timeout(&mut self) {
        self.deadline = None;
        if self.state == PeerState::Connected {
            return;
        }
        self.mark_stalled();
    }

    fn mark_stalled(&mut self) {
        self.deadline = None;
        if self.stalled {
            return;
        }
        self.stalled = true;
        NegotiationCounters::bump(&self.ctx.counters.stalls);
        warn!(
            peer = %self.ctx.remote,
            role = %self.ctx.role,
            state = %self.state,
            "negotiation stalled"
        );
        let _ = self.ctx.reports.send(PeerReport::Stalled {
            peer: self.ctx.remote.clone(),
            instance: self.ctx.instance,
            status: self.status(),
            waited: self.ctx.timeout,
        });
    }

    // ── Link events ─────────────────────────────────────────────────────

    async fn on_link_event(&mut self, event: LinkEvent) -> Option<TerminationReason> {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.ctx.signaling.send_candidate(&self.ctx.remote, candidate).await {
                    warn!(peer = %self.ctx.remote, "{e}");
                }
                None
            }
            LinkEvent::RemoteTrack(track) => {
                let _ = self.ctx.reports.send(PeerReport::RemoteTrack {
                    peer: self.ctx.remote.clone(),
                    instance: self.ctx.instance,
                    track,
                });
                None
            }
            LinkEvent::StateChanged(state) => match state {
                LinkState::Failed => Some(TerminationReason::Failed("connection failed".into())),
                LinkState::Closed => Some(TerminationReason::Closed),
                LinkState::Disconnected => {
                    warn!(peer = %self.ctx.remote, "link disconnected");
                    None
                }
                other => {
                    debug!(peer = %self.ctx.remote, link_state = ?other, "link state");
                    None
                }
            },
        }
    }

    // ── Reporting ───────────────────────────────────────────────────────

    fn status(&self) -> PeerStatus {
        PeerStatus {
            role: self.ctx.role,
            state: self.state,
            stalled: self.stalled,
        }
    }

    fn set_state(&mut self, state: PeerState) {
        if self.state != state {
            debug!(peer = %self.ctx.remote, from = %self.state, to = %state, "peer state");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.ctx.reports.send(PeerReport::Status {
            peer: self.ctx.remote.clone(),
            instance: self.ctx.instance,
            status: self.status(),
        });
    }

    async fn teardown(mut self, reason: TerminationReason) {
        self.link.close().await;
        NegotiationCounters::bump(&self.ctx.counters.links_closed);
        self.ctx.signaling.clear_pair(&self.ctx.remote).await;
        self.state = PeerState::Terminated;
        info!(peer = %self.ctx.remote, role = %self.ctx.role, %reason, "peer connection terminated");
        let _ = self.ctx.reports.send(PeerReport::Terminated {
            peer: self.ctx.remote.clone(),
            instance: self.ctx.instance,
            role: self.ctx.role,
            reason,
        });
    }
}

// ---------------------------------------------------------------------------
// PeerConnectionManager
// ---------------------------------------------------------------------------

struct PeerRecord {
    instance: u64,
    status: PeerStatus,
    inputs: mpsc::UnboundedSender<PeerInput>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Signals that arrived before their sender showed up in presence.
#[derive(Default)]
struct PendingSignals {
    offer: Option<NegotiationMessage>,
    answer: Option<NegotiationMessage>,
    candidates: VecDeque<NegotiationMessage>,
}

impl PendingSignals {
    fn push(&mut self, msg: NegotiationMessage) {
        let slot = match msg.payload {
            NegotiationPayload::Offer { .. } => &mut self.offer,
            NegotiationPayload::Answer { .. } => &mut self.answer,
            NegotiationPayload::Candidate(_) => {
                if self.candidates.len() == MAX_PENDING_CANDIDATES {
                    self.candidates.pop_front();
                }
                self.candidates.push_back(msg);
                return;
            }
        };
        if slot.as_ref().map_or(true, |old| old.generation < msg.generation) {
            *slot = Some(msg);
        }
    }

    fn drain(self) -> impl Iterator<Item = NegotiationMessage> {
        self.offer.into_iter().chain(self.answer).chain(self.candidates)
    }
}

/// Peers added and removed by one `reconcile` call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<(PeerId, Role)>,
    pub removed: Vec<(PeerId, Role)>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct PeerConnectionManager {
    self_id: PeerId,
    signaling: SignalingChannel,
    factory: Arc<dyn PeerLinkFactory>,
    reports: mpsc::UnboundedSender<PeerReport>,
    negotiation_timeout: Duration,
    counters: Arc<NegotiationCounters>,
    outgoing: Vec<LocalTrack>,
    records: BTreeMap<PeerId, PeerRecord>,
    pending: HashMap<PeerId, PendingSignals>,
    /// Peers whose link failed; not recreated until they leave presence.
    failed: BTreeSet<PeerId>,
    /// Actors cancelled but possibly still tearing down.
    retiring: Vec<JoinHandle<()>>,
    next_instance: u64,
}

impl PeerConnectionManager {
    pub fn new(
        signaling: SignalingChannel,
        factory: Arc<dyn PeerLinkFactory>,
        reports: mpsc::UnboundedSender<PeerReport>,
        negotiation_timeout: Duration,
        counters: Arc<NegotiationCounters>,
    ) -> Self {
        Self {
            self_id: signaling.self_id().clone(),
            signaling,
            factory,
            reports,
            negotiation_timeout,
            counters,
            outgoing: Vec::new(),
            records: BTreeMap::new(),
            pending: HashMap::new(),
            failed: BTreeSet::new(),
            retiring: Vec::new(),
            next_instance: 1,
        }
    }

    /// Bring the record set in line with `snapshot`: one record per remote
    /// member, none for anyone else.  Repeating a snapshot changes nothing.
    pub fn reconcile(&mut self, snapshot: &PresenceSnapshot) -> ReconcileOutcome {
        let desired: BTreeSet<PeerId> = snapshot.others(&self.self_id).cloned().collect();
        let mut outcome = ReconcileOutcome::default();

        self.failed.retain(|p| desired.contains(p));

        let gone: Vec<PeerId> = self
            .records
            .keys()
            .filter(|p| !desired.contains(*p))
            .cloned()
            .collect();
        for peer in gone {
            if let Some(record) = self.records.remove(&peer) {
                record.cancel.cancel();
                self.retiring.push(record.handle);
                self.pending.remove(&peer);
                info!(peer = %peer, role = %record.status.role, "peer left");
                outcome.removed.push((peer, record.status.role));
            }
        }

        for peer in desired {
            if self.records.contains_key(&peer) || self.failed.contains(&peer) {
                continue;
            }
            let role = self.spawn(peer.clone());
            outcome.added.push((peer, role));
        }

        self.retiring.retain(|h| !h.is_finished());
        outcome
    }

    fn spawn(&mut self, peer: PeerId) -> Role {
        let role = Role::assign(&self.self_id, &peer);
        let instance = self.next_instance;
        self.next_instance += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let ctx = PeerContext {
            remote: peer.clone(),
            instance,
            role,
            tracks: self.outgoing.clone(),
            signaling: self.signaling.clone(),
            reports: self.reports.clone(),
            counters: self.counters.clone(),
            timeout: self.negotiation_timeout,
        };
        let handle = tokio::spawn(run_peer(ctx, self.factory.clone(), rx, cancel.clone()));

        if let Some(pending) = self.pending.remove(&peer) {
            for msg in pending.drain() {
                let _ = tx.send(PeerInput::Signal(msg));
            }
        }

        info!(peer = %peer, %role, instance, "peer observed, connecting");
        self.records.insert(
            peer,
            PeerRecord {
                instance,
                status: PeerStatus {
                    role,
                    state: PeerState::Idle,
                    stalled: false,
                },
                inputs: tx,
                cancel,
                handle,
            },
        );
        role
    }

    /// Route an incoming signal to its peer's queue, or buffer it until the
    /// sender appears in presence.
    pub fn deliver(&mut self, msg: NegotiationMessage) {
        if msg.from == self.self_id || self.failed.contains(&msg.from) {
            return;
        }
        if let Some(record) = self.records.get(&msg.from) {
            let _ = record.inputs.send(PeerInput::Signal(msg));
            return;
        }
        if !self.pending.contains_key(&msg.from) && self.pending.len() >= MAX_PENDING_PEERS {
            warn!(peer = %msg.from, "too many unknown signal senders, dropping");
            return;
        }
        debug!(peer = %msg.from, generation = msg.generation, "buffering signal from unknown peer");
        self.pending.entry(msg.from.clone()).or_default().push(msg);
    }

    /// Tracks handed to records created from now on.
    pub fn set_outgoing(&mut self, tracks: Vec<LocalTrack>) {
        self.outgoing = tracks;
    }

    /// Re-run the offer/answer cycle for one record with the current
    /// outgoing tracks.  Returns `false` for an unknown peer.
    pub fn renegotiate(&mut self, peer: &PeerId) -> bool {
        let Some(record) = self.records.get(peer) else {
            return false;
        };
        if record
            .inputs
            .send(PeerInput::Renegotiate(self.outgoing.clone()))
            .is_err()
        {
            return false;
        }
        NegotiationCounters::bump(&self.counters.renegotiations);
        true
    }

    /// Install a new outgoing track set and renegotiate every record.
    /// Returns the number of records triggered.
    pub fn renegotiate_all(&mut self, tracks: Vec<LocalTrack>) -> usize {
        self.outgoing = tracks;
        let peers: Vec<PeerId> = self.records.keys().cloned().collect();
        peers.iter().filter(|p| self.renegotiate(p)).count()
    }

    /// Apply an actor report.  Returns `true` when it came from a live
    /// record (stale reports from replaced records are dropped).
    pub fn handle_report(&mut self, report: &PeerReport) -> bool {
        let peer = report.peer();
        let current = self
            .records
            .get(peer)
            .map_or(false, |r| r.instance == report.instance());
        if !current {
            return false;
        }

        match report {
            PeerReport::Status { status, .. } | PeerReport::Stalled { status, .. } => {
                if let Some(record) = self.records.get_mut(peer) {
                    record.status = *status;
                }
            }
            PeerReport::Terminated { reason, .. } => {
                if let Some(record) = self.records.remove(peer) {
                    self.retiring.push(record.handle);
                }
                if *reason != TerminationReason::Departed {
                    self.failed.insert(peer.clone());
                }
            }
            PeerReport::RenegotiationStarted { .. } | PeerReport::RemoteTrack { .. } => {}
        }
        true
    }

    pub fn status_of(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.records.get(peer).map(|r| r.status)
    }

    pub fn statuses(&self) -> BTreeMap<PeerId, PeerStatus> {
        self.records
            .iter()
            .map(|(p, r)| (p.clone(), r.status))
            .collect()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cancel every record and wait for all actors to finish tearing down.
    pub async fn shutdown(&mut self) {
        let mut handles = std::mem::take(&mut self.retiring);
        for (peer, record) in std::mem::take(&mut self.records) {
            debug!(peer = %peer, "closing peer record");
            record.cancel.cancel();
            handles.push(record.handle);
        }
        self.pending.clear();
        self.failed.clear();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("peer task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        for record in self.records.values() {
            record.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceMarker;
    use crate::room::RoomId;
    use crate::sim::SimulatedLinkFactory;
    use crate::store::MemoryBackend;
    use chrono::Utc;
    use futures::StreamExt;

    fn snapshot(peers: &[&PeerId]) -> PresenceSnapshot {
        PresenceSnapshot::from_members(peers.iter().map(|p| {
            (
                (*p).clone(),
                PresenceMarker {
                    label: p.short().to_string(),
                    joined_at: Utc::now(),
                },
            )
        }))
    }

    struct Harness {
        manager: PeerConnectionManager,
        reports: mpsc::UnboundedReceiver<PeerReport>,
        links: SimulatedLinkFactory,
        me: PeerId,
    }

    fn harness(me: &str, timeout: Duration) -> Harness {
        let backend = MemoryBackend::new();
        let me = PeerId::parse(me).unwrap();
        let signaling =
            SignalingChannel::new(Arc::new(backend.connect()), RoomId::new("R1").unwrap(), me.clone());
        let links = SimulatedLinkFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(
            signaling,
            Arc::new(links.clone()),
            tx,
            timeout,
            Arc::new(NegotiationCounters::default()),
        );
        Harness {
            manager,
            reports: rx,
            links,
            me,
        }
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let mut h = harness("m", Duration::from_secs(5));
        let a = PeerId::parse("a").unwrap();
        let b = PeerId::parse("b").unwrap();
        let c = PeerId::parse("c").unwrap();

        let s1 = snapshot(&[&h.me, &a, &b]);
        let out = h.manager.reconcile(&s1);
        assert_eq!(out.added.len(), 2);
        assert!(h.manager.reconcile(&s1).is_empty());
        assert!(h.manager.reconcile(&s1).is_empty());

        let s2 = snapshot(&[&h.me, &b, &c]);
        let out = h.manager.reconcile(&s2);
        assert_eq!(out.added, vec![(c.clone(), Role::Responder)]);
        assert_eq!(out.removed, vec![(a.clone(), Role::Responder)]);
        assert!(h.manager.reconcile(&s2).is_empty());

        let ids: Vec<_> = h.manager.peer_ids().cloned().collect();
        assert_eq!(ids, vec![b, c]);

        h.manager.shutdown().await;
        assert_eq!(h.links.open_links(), 0);
    }

    #[tokio::test]
    async fn self_is_never_a_record() {
        let mut h = harness("m", Duration::from_secs(5));
        let out = h.manager.reconcile(&snapshot(&[&h.me]));
        assert!(out.is_empty());
        assert!(h.manager.is_empty());
    }

    #[tokio::test]
    async fn roles_follow_identity_order() {
        let mut h = harness("m", Duration::from_secs(5));
        let low = PeerId::parse("a").unwrap();
        let high = PeerId::parse("z").unwrap();
        let out = h.manager.reconcile(&snapshot(&[&h.me, &low, &high]));
        assert!(out.added.contains(&(low, Role::Responder)));
        assert!(out.added.contains(&(high, Role::Initiator)));
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn unanswered_offer_stalls_without_retry() {
        let mut h = harness("a", Duration::from_millis(100));
        let silent = PeerId::parse("z").unwrap();
        h.manager.reconcile(&snapshot(&[&h.me, &silent]));

        let stalled = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let report = h.reports.recv().await.expect("reports open");
                h.manager.handle_report(&report);
                if let PeerReport::Stalled { status, .. } = report {
                    break status;
                }
            }
        })
        .await
        .expect("stall reported");

        assert_eq!(stalled.state, PeerState::OfferSent);
        assert!(stalled.stalled);
        assert_eq!(h.manager.status_of(&silent).unwrap().state, PeerState::OfferSent);
        assert_eq!(h.manager.counters.snapshot().offers_sent, 1);

        // no automatic retry
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.manager.counters.snapshot().offers_sent, 1);

        // a fresh trigger starts a new round
        assert!(h.manager.renegotiate(&silent));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.counters.snapshot().offers_sent, 2);

        h.manager.shutdown().await;
        assert_eq!(h.links.open_links(), 0);
    }

    #[tokio::test]
    async fn signals_before_presence_are_replayed() {
        let backend = MemoryBackend::new();
        let room = RoomId::new("R1").unwrap();
        let a = PeerId::parse("a").unwrap();
        let b = PeerId::parse("b").unwrap();
        let links = SimulatedLinkFactory::new();
        let counters = Arc::new(NegotiationCounters::default());

        // b is the responder; a's offer arrives before a is in b's snapshot
        let sig_a = SignalingChannel::new(Arc::new(backend.connect()), room.clone(), a.clone());
        let sig_b = SignalingChannel::new(Arc::new(backend.connect()), room, b.clone());
        let mut offers = sig_b.subscribe_offers();
        sig_a.send_offer(&b, links.offer_sdp("early")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = PeerConnectionManager::new(
            sig_b.clone(),
            Arc::new(links.clone()),
            tx,
            Duration::from_secs(5),
            counters.clone(),
        );
        let msg = offers.next().await.unwrap();
        manager.deliver(msg);
        assert!(manager.is_empty());

        manager.reconcile(&snapshot(&[&a, &b]));
        let answered = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let report = rx.recv().await.unwrap();
                manager.handle_report(&report);
                if let PeerReport::Status { status, .. } = report {
                    if status.state == PeerState::Connected {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(answered.is_ok());
        assert_eq!(counters.snapshot().answers_sent, 1);
        manager.shutdown().await;
    }

    #[test]
    fn pending_keeps_latest_offer_and_bounded_candidates() {
        let room = RoomId::new("R1").unwrap();
        let from = PeerId::parse("a").unwrap();
        let to = PeerId::parse("b").unwrap();
        let msg = |generation, payload| NegotiationMessage {
            room: room.clone(),
            from: from.clone(),
            to: to.clone(),
            generation,
            payload,
        };

        let mut pending = PendingSignals::default();
        pending.push(msg(2, NegotiationPayload::Offer { sdp: "new".into() }));
        pending.push(msg(1, NegotiationPayload::Offer { sdp: "old".into() }));
        for seq in 0..(MAX_PENDING_CANDIDATES as u64 + 5) {
            pending.push(msg(
                seq,
                NegotiationPayload::Candidate(IceCandidate {
                    candidate: seq.to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                }),
            ));
        }

        let drained: Vec<_> = pending.drain().collect();
        assert_eq!(drained[0].payload, NegotiationPayload::Offer { sdp: "new".into() });
        assert_eq!(drained.len(), 1 + MAX_PENDING_CANDIDATES);
        assert_eq!(drained[1].generation, 5);
    }
}
