// src/session.rs
//
// Session facilitation layer.
//
// A `CallSession` is the handle the UI (or the CLI) drives.  Joining a room
// spawns one call task that owns everything room-scoped: the media
// aggregator, the peer connection manager, the chat log and the notes
// digest.  The task runs a single event loop over presence snapshots,
// incoming signals, chat, actor reports and UI commands, so room state is
// only ever mutated from one place.  The UI reads state through a
// `watch`-published `SessionView` and the `EventBus`.
//
// Leaving cancels the call task and waits for its teardown, which is best
// effort: every step runs even if an earlier one failed, and failures are
// logged rather than returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatChannel, ChatLog, ChatMessage};
use crate::config::Config;
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, EventBus};
use crate::media::{
    CaptureRequest, LocalMediaState, LocalTrack, LocalTrackInfo, MediaAggregator, MediaDevices,
    RemoteStream,
};
use crate::notes::{self, NotesDigest, Summarizer};
use crate::peer::{
    CallStats, NegotiationCounters, PeerConnectionManager, PeerLinkFactory, PeerReport, PeerStatus,
    TerminationReason,
};
use crate::presence::{PresenceRegistry, PresenceSnapshot};
use crate::room::{PeerId, RoomId};
use crate::rtc::{SyntheticDevices, WebRtcLinkFactory};
use crate::signaling::{NegotiationMessage, SignalingChannel};
use crate::store::{self, RendezvousStore};

/// Everything the UI renders.  Reset to the default on leave.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub room: Option<RoomId>,
    pub local_peer: Option<PeerId>,
    pub media: LocalMediaState,
    pub local_tracks: Vec<LocalTrackInfo>,
    pub remote_streams: BTreeMap<PeerId, RemoteStream>,
    pub peers: BTreeMap<PeerId, PeerStatus>,
    pub chat: Vec<ChatMessage>,
    pub notes: Option<NotesDigest>,
    pub notes_generating: bool,
}

type Reply<T> = oneshot::Sender<CallResult<T>>;

#[derive(Debug)]
enum Command {
    SetMic(bool, Reply<()>),
    SetCamera(bool, Reply<()>),
    ScreenShare(Reply<bool>),
    Camera(Reply<bool>),
    FlipCamera(Reply<bool>),
    Chat(String, Reply<Option<ChatMessage>>),
    Notes(Reply<NotesDigest>),
}

struct ActiveCall {
    room: RoomId,
    peer: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    config: Config,
    store: Arc<dyn RendezvousStore>,
    devices: Arc<dyn MediaDevices>,
    links: Arc<dyn PeerLinkFactory>,
    summarizer: Arc<dyn Summarizer>,
    events: EventBus,
    view: watch::Sender<SessionView>,
    counters: Arc<NegotiationCounters>,
    active: Mutex<Option<ActiveCall>>,
}

// ---------------------------------------------------------------------------
// CallSession
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CallSession {
    shared: Arc<Shared>,
}

impl CallSession {
    pub fn new(
        config: Config,
        store: Arc<dyn RendezvousStore>,
        devices: Arc<dyn MediaDevices>,
        links: Arc<dyn PeerLinkFactory>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let (view, _) = watch::channel(SessionView::default());
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                devices,
                links,
                summarizer,
                events: EventBus::new(),
                view,
                counters: Arc::new(NegotiationCounters::default()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Session wired to the configured store, webrtc-rs links and synthetic
    /// capture.
    pub async fn from_config(config: Config) -> CallResult<Self> {
        let store = store::connect(&config).await?;
        let links = Arc::new(WebRtcLinkFactory::new(&config));
        let summarizer = notes::from_config(&config)?;
        Ok(Self::new(
            config,
            store,
            Arc::new(SyntheticDevices::new()),
            links,
            summarizer,
        ))
    }

    /// Join `room` under a fresh identity.  Resolves once local media is
    /// acquired and the presence entry is written.
    pub async fn join_room(&self, room: &str) -> CallResult<PeerId> {
        let room = RoomId::new(room)?;
        let peer = PeerId::generate();
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let mut active = self.shared.active.lock().await;
            if let Some(current) = active.as_ref() {
                return Err(CallError::AlreadyJoined(current.room.to_string()));
            }
            let (commands, inbox) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let call = Call::new(self.shared.clone(), room.clone(), peer.clone());
            let handle = tokio::spawn(call.run(inbox, cancel.clone(), ready_tx));
            *active = Some(ActiveCall {
                room: room.clone(),
                peer: peer.clone(),
                commands,
                cancel,
                handle,
            });
        }

        info!(room = %room, peer = %peer, "joining room");
        let result = ready_rx.await.unwrap_or(Err(CallError::Cancelled));
        if let Err(e) = result {
            warn!(room = %room, peer = %peer, code = e.code(), "join failed: {e}");
            self.discard(&peer).await;
            return Err(e);
        }
        Ok(peer)
    }

    /// Leave the current room.  Safe to call at any time, any number of
    /// times, including while a join is still in progress.
    pub async fn leave_room(&self) {
        let mut active = self.shared.active.lock().await;
        let Some(call) = active.take() else {
            debug!("leave_room: not in a room");
            return;
        };
        info!(room = %call.room, peer = %call.peer, "leaving room");
        call.cancel.cancel();
        if let Err(e) = call.handle.await {
            warn!(room = %call.room, "call task ended abnormally: {e}");
        }
    }

    /// Drop the slot of a join that failed on its own.
    async fn discard(&self, peer: &PeerId) {
        let mut active = self.shared.active.lock().await;
        if active.as_ref().map_or(false, |c| &c.peer == peer) {
            if let Some(call) = active.take() {
                let _ = call.handle.await;
            }
        }
    }

    pub async fn set_mic_enabled(&self, enabled: bool) -> CallResult<()> {
        self.request(|reply| Command::SetMic(enabled, reply)).await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> CallResult<()> {
        self.request(|reply| Command::SetCamera(enabled, reply)).await
    }

    /// Returns `false` when already sharing the screen.
    pub async fn switch_to_screen_share(&self) -> CallResult<bool> {
        self.request(Command::ScreenShare).await
    }

    /// Returns `false` when already on the camera.
    pub async fn switch_to_camera(&self) -> CallResult<bool> {
        self.request(Command::Camera).await
    }

    pub async fn flip_camera_facing(&self) -> CallResult<bool> {
        self.request(Command::FlipCamera).await
    }

    /// Broadcast `text` to the room.  Blank text is ignored.
    pub async fn send_chat_message(&self, text: &str) -> CallResult<Option<ChatMessage>> {
        let text = text.to_string();
        self.request(|reply| Command::Chat(text, reply)).await
    }

    /// Summarize the chat so far.  On failure the previous digest stays.
    pub async fn request_notes_digest(&self) -> CallResult<NotesDigest> {
        self.request(Command::Notes).await
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> CallResult<T> {
        let commands = {
            let active = self.shared.active.lock().await;
            active
                .as_ref()
                .map(|c| c.commands.clone())
                .ok_or(CallError::NotJoined)?
        };
        let (reply, response) = oneshot::channel();
        commands
            .send(command(reply))
            .map_err(|_| CallError::NotJoined)?;
        response.await.map_err(|_| CallError::NotJoined)?
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.shared.view.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> CallStats {
        self.shared.counters.snapshot()
    }

    pub fn remote_streams(&self) -> BTreeMap<PeerId, RemoteStream> {
        self.shared.view.borrow().remote_streams.clone()
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.shared.view.borrow().local_peer.clone()
    }
}

// ---------------------------------------------------------------------------
// Call task
// ---------------------------------------------------------------------------

enum Step {
    Cancelled,
    Presence(PresenceSnapshot),
    Signal(NegotiationMessage),
    Chat(ChatMessage),
    Report(PeerReport),
    Command(Command),
    Notes(Result<CallResult<NotesDigest>, JoinError>),
    Capture(Result<CallResult<LocalTrack>, JoinError>),
    FeedEnded(&'static str),
}

struct NotesJob {
    handle: JoinHandle<CallResult<NotesDigest>>,
    reply: Reply<NotesDigest>,
}

/// A device open for a track change.  At most one runs at a time; further
/// commands wait in the queue until it resolves.
struct CaptureJob {
    request: CaptureRequest,
    handle: JoinHandle<CallResult<LocalTrack>>,
    reply: Reply<bool>,
}

/// Room-scoped state, owned by the call task.
struct Call {
    shared: Arc<Shared>,
    room: RoomId,
    me: PeerId,
    label: String,
    media: MediaAggregator,
    presence: PresenceRegistry,
    signaling: SignalingChannel,
    chat: ChatChannel,
    chat_log: ChatLog,
    notes: Option<NotesDigest>,
    notes_job: Option<NotesJob>,
    capture_job: Option<CaptureJob>,
    manager: PeerConnectionManager,
    reports: mpsc::UnboundedReceiver<PeerReport>,
}

impl Call {
    fn new(shared: Arc<Shared>, room: RoomId, me: PeerId) -> Self {
        let label = if shared.config.display_name.is_empty() {
            me.short().to_string()
        } else {
            shared.config.display_name.clone()
        };
        let signaling = SignalingChannel::new(shared.store.clone(), room.clone(), me.clone());
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(
            signaling.clone(),
            shared.links.clone(),
            reports_tx,
            shared.config.negotiation_timeout,
            shared.counters.clone(),
        );

        Self {
            media: MediaAggregator::new(shared.devices.clone()),
            presence: PresenceRegistry::new(shared.store.clone()),
            chat: ChatChannel::new(shared.store.clone(), room.clone(), me.clone(), label.clone()),
            chat_log: ChatLog::new(),
            notes: None,
            notes_job: None,
            capture_job: None,
            signaling,
            manager,
            reports,
            label,
            room,
            me,
            shared,
        }
    }

    async fn run(
        mut self,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
        ready: oneshot::Sender<CallResult<()>>,
    ) {
        let setup = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            result = self.setup() => result,
        };

        match setup {
            Ok(()) => {
                info!(room = %self.room, peer = %self.me, label = %self.label, "joined room");
                self.shared
                    .events
                    .emit(CallEvent::session_joined(self.room.as_str(), self.me.as_str()));
                let _ = ready.send(Ok(()));
                self.event_loop(commands, &cancel).await;
            }
            Err(e) => {
                let _ = ready.send(Err(e));
            }
        }

        self.teardown().await;
    }

    async fn setup(&mut self) -> CallResult<()> {
        self.media.acquire_local_media().await?;
        self.manager.set_outgoing(self.media.outgoing_tracks());
        self.publish();

        self.signaling.register_disconnect_cleanup().await?;
        self.presence.join(&self.room, &self.me, &self.label).await?;
        Ok(())
    }

    async fn event_loop(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) {
        let mut presence = self.presence.subscribe(&self.room);
        let mut offers = self.signaling.subscribe_offers();
        let mut answers = self.signaling.subscribe_answers();
        let mut candidates = self.signaling.subscribe_candidates();
        let mut chat = self.chat.subscribe();
        let mut open = Feeds::default();

        loop {
            let capturing = self.capture_job.is_some();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                command = commands.recv(), if !capturing => {
                    command.map_or(Step::Cancelled, Step::Command)
                }
                Some(report) = self.reports.recv() => Step::Report(report),
                snapshot = presence.next(), if open.presence => {
                    snapshot.map_or(Step::FeedEnded("presence"), Step::Presence)
                }
                msg = offers.next(), if open.offers => msg.map_or(Step::FeedEnded("offers"), Step::Signal),
                msg = answers.next(), if open.answers => msg.map_or(Step::FeedEnded("answers"), Step::Signal),
                msg = candidates.next(), if open.candidates => {
                    msg.map_or(Step::FeedEnded("candidates"), Step::Signal)
                }
                msg = chat.next(), if open.chat => msg.map_or(Step::FeedEnded("chat"), Step::Chat),
                result = wait_job(self.notes_job.as_mut().map(|j| &mut j.handle)) => Step::Notes(result),
                result = wait_job(self.capture_job.as_mut().map(|j| &mut j.handle)) => Step::Capture(result),
            };

            match step {
                Step::Cancelled => break,
                Step::Presence(snapshot) => self.on_presence(&snapshot),
                Step::Signal(msg) => self.manager.deliver(msg),
                Step::Chat(message) => self.on_chat(message),
                Step::Report(report) => self.on_report(report),
                Step::Command(command) => self.on_command(command).await,
                Step::Notes(result) => self.on_notes(result),
                Step::Capture(result) => self.on_capture(result),
                Step::FeedEnded(feed) => {
                    warn!(room = %self.room, feed, "subscription ended");
                    open.close(feed);
                }
            }
        }
    }

    fn on_presence(&mut self, snapshot: &PresenceSnapshot) {
        let outcome = self.manager.reconcile(snapshot);
        if outcome.is_empty() {
            return;
        }
        let room = self.room.as_str();
        for (peer, role) in &outcome.added {
            self.shared
                .events
                .emit(CallEvent::peer_joined(room, peer.as_str(), role.as_str()));
        }
        for (peer, role) in &outcome.removed {
            if self.media.remove_remote(peer) {
                self.shared
                    .events
                    .emit(CallEvent::stream_removed(room, peer.as_str()));
            }
            let reason = TerminationReason::Departed.to_string();
            self.shared
                .events
                .emit(CallEvent::peer_left(room, peer.as_str(), role.as_str(), &reason));
        }
        self.publish();
    }

    fn on_chat(&mut self, message: ChatMessage) {
        if !self.chat_log.append(message.clone()) {
            return;
        }
        self.shared.events.emit(CallEvent::chat_received(
            self.room.as_str(),
            message.sender.as_str(),
            &message.sender_label,
            &message.text,
        ));
        self.publish();
    }

    fn on_report(&mut self, report: PeerReport) {
        if !self.manager.handle_report(&report) {
            debug!(peer = %report.peer(), "stale peer report dropped");
            return;
        }
        let room = self.room.as_str();
        let events = &self.shared.events;

        match report {
            PeerReport::Status { peer, status, .. } => {
                events.emit(CallEvent::peer_state_changed(
                    room,
                    peer.as_str(),
                    status.role.as_str(),
                    status.state.as_str(),
                ));
            }
            PeerReport::Stalled {
                peer,
                status,
                waited,
                ..
            } => {
                let err = CallError::NegotiationStalled {
                    peer: peer.clone(),
                    waited,
                };
                warn!(room, peer = %peer, state = %status.state, code = err.code(), "{err}");
                events.emit(CallEvent::negotiation_stalled(
                    room,
                    peer.as_str(),
                    status.role.as_str(),
                    status.state.as_str(),
                ));
            }
            PeerReport::RenegotiationStarted { peer, role, .. } => {
                events.emit(CallEvent::renegotiation_started(
                    room,
                    peer.as_str(),
                    role.as_str(),
                ));
            }
            PeerReport::RemoteTrack { peer, track, .. } => {
                let kind = track.kind;
                if self.media.add_remote_track(&peer, track) {
                    info!(room, peer = %peer, "remote stream added");
                }
                events.emit(CallEvent::stream_added(room, peer.as_str(), kind.as_str()));
            }
            PeerReport::Terminated {
                peer, role, reason, ..
            } => {
                if self.media.remove_remote(&peer) {
                    events.emit(CallEvent::stream_removed(room, peer.as_str()));
                }
                events.emit(CallEvent::peer_left(
                    room,
                    peer.as_str(),
                    role.as_str(),
                    &reason.to_string(),
                ));
            }
        }
        self.publish();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetMic(enabled, reply) => {
                self.media.set_mic_enabled(enabled);
                let _ = reply.send(Ok(()));
            }
            Command::SetCamera(enabled, reply) => {
                self.media.set_camera_enabled(enabled);
                let _ = reply.send(Ok(()));
            }
            Command::ScreenShare(reply) => {
                let request = self.media.screen_share_request();
                self.start_capture(request, reply);
            }
            Command::Camera(reply) => {
                let request = self.media.camera_request();
                self.start_capture(request, reply);
            }
            Command::FlipCamera(reply) => {
                let request = self.media.flip_request();
                self.start_capture(request, reply);
            }
            Command::Chat(text, reply) => {
                let result = self.chat.send(&text).await;
                if let Ok(Some(message)) = &result {
                    self.chat_log.append(message.clone());
                }
                let _ = reply.send(result);
            }
            Command::Notes(reply) => self.start_notes(reply),
        }
        self.publish();
    }

    /// Open the device off the loop so presence, signals and leave keep
    /// flowing while a picker or permission prompt is up.
    fn start_capture(&mut self, request: Option<CaptureRequest>, reply: Reply<bool>) {
        let Some(request) = request else {
            let _ = reply.send(Ok(false));
            return;
        };
        debug!(room = %self.room, ?request, "opening capture device");
        let devices = self.shared.devices.clone();
        let handle = tokio::spawn(async move { request.open(devices.as_ref()).await });
        self.capture_job = Some(CaptureJob {
            request,
            handle,
            reply,
        });
    }

    /// Install the new track and fan the changed outgoing set out to every
    /// peer record.
    fn on_capture(&mut self, result: Result<CallResult<LocalTrack>, JoinError>) {
        let Some(job) = self.capture_job.take() else {
            return;
        };
        let result = result.unwrap_or_else(|e| Err(CallError::CaptureDenied(e.to_string())));
        match result {
            Ok(track) => {
                self.media.install(job.request, track);
                let peers = self.manager.renegotiate_all(self.media.outgoing_tracks());
                info!(room = %self.room, peers, "outgoing tracks changed, renegotiating");
                let _ = job.reply.send(Ok(true));
            }
            Err(e) => {
                warn!(room = %self.room, request = ?job.request, code = e.code(), "capture switch failed: {e}");
                let _ = job.reply.send(Err(e));
            }
        }
        self.publish();
    }

    fn start_notes(&mut self, reply: Reply<NotesDigest>) {
        if self.notes_job.is_some() {
            let _ = reply.send(Err(CallError::SummarizationFailed(
                "a digest is already being generated".into(),
            )));
            return;
        }
        if self.chat_log.is_empty() {
            let err = CallError::SummarizationFailed("transcript is empty".into());
            self.shared
                .events
                .emit(CallEvent::notes_failed(self.room.as_str(), &err.to_string()));
            let _ = reply.send(Err(err));
            return;
        }

        let summarizer = self.shared.summarizer.clone();
        let transcript = self.chat_log.messages().to_vec();
        info!(room = %self.room, messages = transcript.len(), "generating notes digest");
        let handle = tokio::spawn(async move { summarizer.summarize(&transcript).await });
        self.notes_job = Some(NotesJob { handle, reply });
    }

    fn on_notes(&mut self, result: Result<CallResult<NotesDigest>, JoinError>) {
        let Some(job) = self.notes_job.take() else {
            return;
        };
        let result = result.unwrap_or_else(|e| Err(CallError::SummarizationFailed(e.to_string())));
        let room = self.room.as_str();
        match result {
            Ok(digest) => {
                self.notes = Some(digest.clone());
                self.shared.events.emit(CallEvent::notes_updated(room));
                let _ = job.reply.send(Ok(digest));
            }
            Err(e) => {
                warn!(room, code = e.code(), "notes digest failed, keeping previous: {e}");
                self.shared
                    .events
                    .emit(CallEvent::notes_failed(room, &e.to_string()));
                let _ = job.reply.send(Err(e));
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.shared.view.send_replace(SessionView {
            room: Some(self.room.clone()),
            local_peer: Some(self.me.clone()),
            media: self.media.state().clone(),
            local_tracks: self.media.local_tracks(),
            remote_streams: self.media.remote_streams().clone(),
            peers: self.manager.statuses(),
            chat: self.chat_log.messages().to_vec(),
            notes: self.notes.clone(),
            notes_generating: self.notes_job.is_some(),
        });
    }

    /// Best-effort release of everything the call holds.
    async fn teardown(mut self) {
        if let Some(job) = self.notes_job.take() {
            job.handle.abort();
            let _ = job.reply.send(Err(CallError::Cancelled));
        }
        if let Some(job) = self.capture_job.take() {
            job.handle.abort();
            // the device may have answered just before the abort
            if let Ok(Ok(track)) = job.handle.await {
                track.stop();
            }
            let _ = job.reply.send(Err(CallError::Cancelled));
        }

        self.manager.shutdown().await;
        self.signaling.clear_outgoing().await;
        if let Err(e) = self.presence.leave(&self.room, &self.me).await {
            warn!(room = %self.room, peer = %self.me, "presence leave failed: {e}");
        }
        self.media.release();

        self.shared.view.send_replace(SessionView::default());
        self.shared
            .events
            .emit(CallEvent::session_left(self.room.as_str(), self.me.as_str()));
        info!(room = %self.room, peer = %self.me, "left room");
    }
}

/// Resolves when the job finishes; never, when there is none.
async fn wait_job<T>(handle: Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Which subscriptions are still producing.
struct Feeds {
    presence: bool,
    offers: bool,
    answers: bool,
    candidates: bool,
    chat: bool,
}

impl Default for Feeds {
    fn default() -> Self {
        Self {
            presence: true,
            offers: true,
            answers: true,
            candidates: true,
            chat: true,
        }
    }
}

impl Feeds {
    fn close(&mut self, feed: &str) {
        match feed {
            "presence" => self.presence = false,
            "offers" => self.offers = false,
            "answers" => self.answers = false,
            "candidates" => self.candidates = false,
            _ => self.chat = false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
