// libs/teleconsultation-cell/src/services/coordinator.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{
    IceCandidate, IceServer, InboundSignal, LinkConnectionState, LinkEvent, MediaConstraints,
    OutboundSignal, ParticipantRole, PatientStatus, QualitySample, QualityTier,
    RemoteStream, RtcConfiguration, SessionDescription, SessionEvent, SessionSnapshot,
    SessionState, TeleconsultationError, TrackKind,
};
use crate::platform::{
    LinkEventSender, LocalMedia, MediaDevices, PeerLink, PeerLinkFactory, SignalingChannel,
};
use crate::services::candidates::CandidateBuffer;
use crate::services::negotiation::{NegotiationRoleRules, ProtocolViolation};
use crate::services::quality::{action_for_transition, QualityAction, QualityMonitor};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Invoked once when the remote side ends the consultation.
pub type OnConsultationEnded = Box<dyn FnOnce() + Send + Sync>;

/// Everything a session needs to know before it starts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub role: ParticipantRole,
    pub rtc: RtcConfiguration,
    pub constraints: MediaConstraints,
    pub quality_sample_interval: Duration,
}

impl SessionConfig {
    pub fn new(config: &AppConfig, room_id: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            room_id: room_id.into(),
            role,
            rtc: RtcConfiguration {
                ice_servers: config
                    .ice_server_urls
                    .iter()
                    .map(|url| IceServer {
                        urls: vec![url.clone()],
                        username: None,
                        credential: None,
                    })
                    .collect(),
            },
            constraints: MediaConstraints {
                audio: true,
                video_ideal_width: config.video_ideal_width,
                video_ideal_height: config.video_ideal_height,
            },
            quality_sample_interval: Duration::from_secs(config.quality_sample_interval_secs),
        }
    }
}

/// Platform collaborators the coordinator drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub media: Arc<dyn MediaDevices>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
}

enum Command {
    Start(oneshot::Sender<Result<(), TeleconsultationError>>),
    Toggle(TrackKind, oneshot::Sender<Option<bool>>),
}

/// Caller side of a running session.
///
/// Every command is funnelled into the session's single actor task, so
/// inbound signals, monitor ticks and user commands never interleave.
/// Dropping the handle tears the session down.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Acquires local media, opens signaling and joins the room.
    /// Fails if local media cannot be acquired; nothing is left running.
    pub async fn start(&self) -> Result<(), TeleconsultationError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start(reply))
            .map_err(|_| TeleconsultationError::SessionEnded)?;
        response.await.map_err(|_| TeleconsultationError::SessionEnded)?
    }

    /// Returns the new enabled flag, or `None` if there is no local audio.
    pub async fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    /// Returns the new enabled flag, or `None` if there is no local video.
    pub async fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::Toggle(kind, reply)).ok()?;
        response.await.ok().flatten()
    }

    /// Tears the session down and waits until it reports `Ended`.
    ///
    /// Preempts whatever the session is awaiting at the moment.
    pub async fn end(&self) {
        self.shutdown.send_replace(true);
        let mut snapshot = self.snapshot.clone();
        if snapshot
            .wait_for(|s| s.state == SessionState::Ended)
            .await
            .is_err()
        {
            debug!("Session task already gone");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The peer link plus everything scoped to it. Replaced wholesale on peer
/// loss; the buffer and monitor never outlive their link.
struct LinkIncarnation {
    id: u64,
    link: Box<dyn PeerLink>,
    candidates: CandidateBuffer,
    making_offer: bool,
    ice_restart_attempted: bool,
    monitor: Option<QualityMonitor>,
}

pub struct SessionCoordinator;

impl SessionCoordinator {
    /// Spawns the session actor in `Idle`. Call `start` on the handle to
    /// begin the call.
    pub fn spawn(
        config: SessionConfig,
        deps: SessionDeps,
        on_consultation_ended: Option<OnConsultationEnded>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();

        let session_id = Uuid::new_v4();
        let initial = SessionSnapshot {
            session_id,
            room_id: config.room_id.clone(),
            role: config.role,
            state: SessionState::Idle,
            audio_enabled: false,
            video_enabled: false,
            peer_audio_enabled: true,
            peer_video_enabled: true,
            quality: QualityTier::Good,
            link_incarnation: None,
            remote_stream: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let actor = SessionActor {
            session_id,
            config,
            deps,
            state: SessionState::Idle,
            local_media: None,
            inbound: None,
            signaling_open: false,
            link: None,
            next_incarnation: 1,
            link_events_tx,
            link_events_rx,
            peer_audio_enabled: true,
            peer_video_enabled: true,
            quality: QualityTier::Good,
            remote_stream: None,
            events: events_tx.clone(),
            snapshot: snapshot_tx,
            shutdown: shutdown_rx,
            on_consultation_ended,
        };

        let task = tokio::spawn(actor.run(commands_rx));

        SessionHandle {
            commands: commands_tx,
            shutdown: shutdown_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            task,
        }
    }
}

struct SessionActor {
    session_id: Uuid,
    config: SessionConfig,
    deps: SessionDeps,
    state: SessionState,
    local_media: Option<LocalMedia>,
    inbound: Option<mpsc::UnboundedReceiver<InboundSignal>>,
    signaling_open: bool,
    link: Option<LinkIncarnation>,
    next_incarnation: u64,
    link_events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    link_events_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
    peer_audio_enabled: bool,
    peer_video_enabled: bool,
    quality: QualityTier,
    remote_stream: Option<RemoteStream>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    shutdown: watch::Receiver<bool>,
    on_consultation_ended: Option<OnConsultationEnded>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Session {} created for room {} as {}",
            self.session_id, self.config.room_id, self.config.role
        );

        while self.state != SessionState::Ended {
            if shutdown_requested(&self.shutdown) {
                self.teardown().await;
                break;
            }

            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut self.shutdown) => {
                    self.teardown().await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.teardown().await,
                },
                signal = next_signal(&mut self.inbound) => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        warn!("Signaling channel closed for room {}", self.config.room_id);
                        self.inbound = None;
                    }
                },
                Some((incarnation, event)) = self.link_events_rx.recv() => {
                    self.handle_link_event(incarnation, event).await;
                }
                _ = next_quality_tick(&mut self.link) => {
                    self.sample_quality().await;
                }
            }

            self.publish_snapshot();
        }

        self.publish_snapshot();
        debug!("Session {} task finished", self.session_id);
    }

    // --------------------------------------------------------------------
    // Commands
    // --------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Toggle(kind, reply) => {
                let result = self.toggle_local(kind).await;
                let _ = reply.send(result);
            }
        }
    }

    #[instrument(skip(self), fields(room = %self.config.room_id, role = %self.config.role))]
    async fn start(&mut self) -> Result<(), TeleconsultationError> {
        if self.state != SessionState::Idle {
            return Err(TeleconsultationError::InvalidSessionState {
                state: self.state.to_string(),
            });
        }

        self.transition(SessionState::AcquiringMedia);

        let acquired = interruptible(
            &mut self.shutdown,
            self.deps.media.acquire(&self.config.constraints),
        )
        .await;
        let media = match acquired {
            None => return Err(TeleconsultationError::SessionEnded),
            Some(Err(e)) => {
                error!("Error acquiring local media: {}", e);
                self.abort_start().await;
                return Err(e);
            }
            Some(Ok(media)) => media,
        };
        info!("Acquired {} local tracks", media.tracks().len());
        self.local_media = Some(media);
        self.publish_local_media();

        let opened = interruptible(&mut self.shutdown, self.deps.signaling.open()).await;
        let inbound = match opened {
            None => return Err(TeleconsultationError::SessionEnded),
            Some(Err(e)) => {
                error!("Error opening signaling channel: {}", e);
                self.abort_start().await;
                return Err(e);
            }
            Some(Ok(inbound)) => inbound,
        };
        self.inbound = Some(inbound);
        self.signaling_open = true;

        if let Err(e) = self.install_link() {
            error!("Error creating peer link: {}", e);
            self.abort_start().await;
            return Err(e);
        }

        if let Err(e) = self.emit(self.join_signal()).await {
            error!("Error joining room {}: {}", self.config.room_id, e);
            self.abort_start().await;
            return Err(e);
        }

        self.transition(SessionState::SignalingConnected);
        Ok(())
    }

    async fn toggle_local(&mut self, kind: TrackKind) -> Option<bool> {
        let Some(media) = &self.local_media else {
            warn!("No local media found to toggle {}", kind);
            return None;
        };
        let Some(track) = media.track(kind) else {
            warn!("No {} track found to toggle", kind);
            return None;
        };

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        info!("Local {} toggled: {}", kind, if enabled { "on" } else { "off" });

        self.publish_local_media();
        self.notify_local_toggle(kind, enabled).await;
        Some(enabled)
    }

    async fn notify_local_toggle(&self, kind: TrackKind, enabled: bool) {
        if !self.signaling_open {
            return;
        }
        let room_id = self.config.room_id.clone();
        let signal = match kind {
            TrackKind::Audio => OutboundSignal::ToggleAudio { room_id, enabled },
            TrackKind::Video => OutboundSignal::ToggleVideo { room_id, enabled },
        };
        if let Err(e) = self.emit(signal).await {
            warn!("Failed to notify peer of {} toggle: {}", kind, e);
        }
    }

    // --------------------------------------------------------------------
    // Inbound signaling
    // --------------------------------------------------------------------

    async fn handle_signal(&mut self, signal: InboundSignal) {
        debug!("Inbound {} in state {}", signal.name(), self.state);

        match signal {
            InboundSignal::ReadyToConnect => self.on_ready_to_connect().await,
            InboundSignal::PeerJoined { role } => {
                info!("Peer joined room {} as {}", self.config.room_id, role);
            }
            InboundSignal::Offer { signal } => self.on_offer(signal).await,
            InboundSignal::Answer { signal } => self.on_answer(signal).await,
            InboundSignal::IceCandidate { signal } => self.on_remote_candidate(signal).await,
            InboundSignal::PeerDisconnected { role } => {
                info!("Peer disconnected ({:?}). Resetting connection", role);
                self.on_peer_lost().await;
            }
            InboundSignal::PeerAudioToggle { enabled } => {
                self.peer_audio_enabled = enabled;
                self.publish_peer_media();
            }
            InboundSignal::PeerVideoToggle { enabled } => {
                self.peer_video_enabled = enabled;
                self.publish_peer_media();
            }
            InboundSignal::ConsultationEnded => {
                info!("Consultation {} ended by the other side", self.config.room_id);
                self.teardown().await;
                self.publish(SessionEvent::ConsultationEnded);
                if let Some(callback) = self.on_consultation_ended.take() {
                    callback();
                }
            }
            InboundSignal::SessionReplaced => {
                warn!(
                    "Another {} joined room {}; this session was replaced",
                    self.config.role, self.config.room_id
                );
                self.publish(SessionEvent::SessionReplaced);
            }
            InboundSignal::PatientJoinedWaitingRoom => {
                self.publish(SessionEvent::PatientStatusChanged(PatientStatus::Waiting));
            }
            InboundSignal::PatientLeftWaitingRoom => {
                self.publish(SessionEvent::PatientStatusChanged(PatientStatus::Left));
            }
            InboundSignal::PatientFinishedConsultation => {
                self.publish(SessionEvent::PatientStatusChanged(PatientStatus::Finished));
            }
            InboundSignal::Reconnected => {
                if self.signaling_open {
                    info!("Signaling reconnected. Re-joining room {}", self.config.room_id);
                    if let Err(e) = self.emit(self.join_signal()).await {
                        error!("Failed to re-join room {}: {}", self.config.room_id, e);
                    }
                }
            }
        }
    }

    async fn on_ready_to_connect(&mut self) {
        match self.state {
            SessionState::SignalingConnected
            | SessionState::Negotiating
            | SessionState::Reconnecting => {}
            SessionState::Connected => {
                debug!("Already connected, ignoring ready-to-connect");
                return;
            }
            other => {
                log_violation(&ProtocolViolation::OutOfSessionState {
                    event: "ready-to-connect",
                    session_state: other.to_string(),
                });
                return;
            }
        }

        if self.state != SessionState::Negotiating {
            self.transition(SessionState::Negotiating);
        }

        let role = self.config.role;
        let Some(incarnation) = self.link.as_mut() else {
            warn!("ready-to-connect without a peer link");
            return;
        };

        if !NegotiationRoleRules::should_offer_on_ready(
            role,
            incarnation.link.negotiation_state(),
            incarnation.making_offer,
        ) {
            debug!(
                "Not offering: role {}, link {:?}, offer in flight {}",
                role,
                incarnation.link.negotiation_state(),
                incarnation.making_offer
            );
            return;
        }

        incarnation.making_offer = true;
        let result = self.send_offer(false).await;
        if let Some(incarnation) = self.link.as_mut() {
            incarnation.making_offer = false;
        }
        if let Err(e) = result {
            error!("Error creating offer: {}", e);
        }
    }

    #[instrument(skip(self), fields(room = %self.config.room_id))]
    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), TeleconsultationError> {
        let link = &self
            .link
            .as_ref()
            .ok_or_else(|| peer_link_missing("offer"))?
            .link;

        let offer = interruptible(&mut self.shutdown, link.create_offer(ice_restart))
            .await
            .ok_or(TeleconsultationError::SessionEnded)??;
        interruptible(&mut self.shutdown, link.set_local_description(offer.clone()))
            .await
            .ok_or(TeleconsultationError::SessionEnded)??;

        info!(
            "Sending {}offer to room {}",
            if ice_restart { "ICE-restart " } else { "" },
            self.config.room_id
        );
        self.emit(OutboundSignal::Offer {
            room_id: self.config.room_id.clone(),
            signal: offer,
        })
        .await
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        if !self.state.accepts_negotiation_traffic() {
            log_violation(&ProtocolViolation::OutOfSessionState {
                event: "offer",
                session_state: self.state.to_string(),
            });
            return;
        }
        let Some(incarnation) = self.link.as_ref() else {
            return;
        };
        if let Err(violation) = NegotiationRoleRules::check_inbound_offer(
            self.config.role,
            incarnation.link.negotiation_state(),
        ) {
            log_violation(&violation);
            return;
        }

        if self.state == SessionState::Reconnecting {
            self.transition(SessionState::Negotiating);
        }

        if let Err(e) = self.answer_offer(offer).await {
            error!("Error processing offer: {}", e);
        }
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), TeleconsultationError> {
        let incarnation = self
            .link
            .as_mut()
            .ok_or_else(|| peer_link_missing("answer"))?;

        interruptible(
            &mut self.shutdown,
            incarnation.link.set_remote_description(offer),
        )
        .await
        .ok_or(TeleconsultationError::SessionEnded)??;
        incarnation
            .candidates
            .flush(&*incarnation.link)
            .await;

        let answer = interruptible(&mut self.shutdown, incarnation.link.create_answer())
            .await
            .ok_or(TeleconsultationError::SessionEnded)??;
        interruptible(
            &mut self.shutdown,
            incarnation.link.set_local_description(answer.clone()),
        )
        .await
        .ok_or(TeleconsultationError::SessionEnded)??;

        info!("Sending answer to room {}", self.config.room_id);
        self.emit(OutboundSignal::Answer {
            room_id: self.config.room_id.clone(),
            signal: answer,
        })
        .await
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if !self.state.accepts_negotiation_traffic() {
            log_violation(&ProtocolViolation::OutOfSessionState {
                event: "answer",
                session_state: self.state.to_string(),
            });
            return;
        }
        let role = self.config.role;
        let Some(incarnation) = self.link.as_mut() else {
            return;
        };
        if let Err(violation) =
            NegotiationRoleRules::check_inbound_answer(role, incarnation.link.negotiation_state())
        {
            log_violation(&violation);
            return;
        }

        let applied = interruptible(
            &mut self.shutdown,
            incarnation.link.set_remote_description(answer),
        )
        .await;
        match applied {
            None => {}
            Some(Err(e)) => error!("Error processing answer: {}", e),
            Some(Ok(())) => {
                debug!("Applied remote answer");
                incarnation
                    .candidates
                    .flush(&*incarnation.link)
                    .await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.state.accepts_negotiation_traffic() {
            log_violation(&ProtocolViolation::OutOfSessionState {
                event: "ice-candidate",
                session_state: self.state.to_string(),
            });
            return;
        }
        let Some(incarnation) = self.link.as_mut() else {
            return;
        };

        if !incarnation.link.has_remote_description() {
            incarnation.candidates.enqueue(candidate);
            return;
        }
        if let Err(e) = incarnation.link.add_ice_candidate(candidate).await {
            error!("Error adding ICE candidate: {}", e);
        }
    }

    async fn on_peer_lost(&mut self) {
        if !self.state.has_signaling() {
            log_violation(&ProtocolViolation::OutOfSessionState {
                event: "peer-disconnected",
                session_state: self.state.to_string(),
            });
            return;
        }

        self.set_remote_stream(None);
        self.publish(SessionEvent::LinkStateChanged(LinkConnectionState::Disconnected));

        if let Some(old) = self.link.take() {
            debug!("Closing peer link incarnation {}", old.id);
            old.link.close();
        }

        match self.install_link() {
            Ok(()) => self.transition(SessionState::Reconnecting),
            Err(e) => {
                error!("Error rebuilding peer link: {}", e);
                self.transition(SessionState::Reconnecting);
                self.publish(SessionEvent::ConnectivityLost {
                    reason: e.to_string(),
                });
            }
        }
    }

    // --------------------------------------------------------------------
    // Peer link events
    // --------------------------------------------------------------------

    async fn handle_link_event(&mut self, incarnation: u64, event: LinkEvent) {
        if self.link.as_ref().map(|current| current.id) != Some(incarnation) {
            debug!("Ignoring {:?} from stale link incarnation {}", event, incarnation);
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if !self.signaling_open {
                    return;
                }
                let signal = OutboundSignal::IceCandidate {
                    room_id: self.config.room_id.clone(),
                    signal: candidate,
                };
                if let Err(e) = self.emit(signal).await {
                    warn!("Failed to send local candidate: {}", e);
                }
            }
            LinkEvent::RemoteStream(stream) => self.set_remote_stream(Some(stream)),
            LinkEvent::ConnectionStateChanged(link_state) => {
                self.publish(SessionEvent::LinkStateChanged(link_state));
                self.on_link_state(link_state).await;
            }
        }
    }

    async fn on_link_state(&mut self, link_state: LinkConnectionState) {
        match link_state {
            LinkConnectionState::Connected => {
                if matches!(
                    self.state,
                    SessionState::Negotiating | SessionState::Reconnecting
                ) {
                    self.transition(SessionState::Connected);
                }
                let period = self.config.quality_sample_interval;
                if let Some(incarnation) = self.link.as_mut() {
                    incarnation.ice_restart_attempted = false;
                    if incarnation.monitor.is_none() {
                        debug!("Starting quality monitoring every {:?}", period);
                        incarnation.monitor = Some(QualityMonitor::new(period));
                    }
                }
            }
            LinkConnectionState::Failed => {
                if !matches!(
                    self.state,
                    SessionState::Negotiating | SessionState::Connected | SessionState::Reconnecting
                ) {
                    return;
                }
                self.transition(SessionState::Reconnecting);
                self.restart_ice().await;
            }
            LinkConnectionState::Disconnected => {
                debug!("Peer link transport disconnected");
            }
            _ => {}
        }
    }

    /// In-place recovery after a transport failure. One attempt per failure
    /// streak; a second failure is reported instead of retried.
    async fn restart_ice(&mut self) {
        if !NegotiationRoleRules::may_originate_offer(self.config.role) {
            info!("Transport failed; waiting for the doctor to restart ICE");
            return;
        }
        let Some(incarnation) = self.link.as_mut() else {
            return;
        };
        if incarnation.ice_restart_attempted {
            error!("Transport failed again after ICE restart; giving up");
            self.publish(SessionEvent::ConnectivityLost {
                reason: "transport failed after ICE restart".to_string(),
            });
            return;
        }

        warn!("Connection failed (ICE). Attempting restart");
        incarnation.ice_restart_attempted = true;
        incarnation.making_offer = true;
        let result = self.send_offer(true).await;
        if let Some(incarnation) = self.link.as_mut() {
            incarnation.making_offer = false;
        }

        match result {
            Ok(()) => self.transition(SessionState::Negotiating),
            Err(TeleconsultationError::SessionEnded) => {}
            Err(e) => {
                error!("ICE restart failed: {}", e);
                self.publish(SessionEvent::ConnectivityLost {
                    reason: format!("ICE restart failed: {}", e),
                });
            }
        }
    }

    // --------------------------------------------------------------------
    // Quality
    // --------------------------------------------------------------------

    async fn sample_quality(&mut self) {
        let Some(incarnation) = self.link.as_mut() else {
            return;
        };
        let sample = match incarnation.link.stats().await {
            Ok(stats) => QualitySample::from_stats(&stats),
            Err(e) => {
                error!("Error getting stats: {}", e);
                None
            }
        };
        let Some(monitor) = incarnation.monitor.as_mut() else {
            return;
        };
        let tier = monitor.observe(sample);

        let previous = self.quality;
        if tier == previous {
            return;
        }
        info!("Connection quality changed: {:?} -> {:?}", previous, tier);
        self.quality = tier;
        self.publish(SessionEvent::QualityChanged(tier));

        let video_enabled = self
            .local_media
            .as_ref()
            .map(|media| media.is_enabled(TrackKind::Video))
            .unwrap_or(false);

        if action_for_transition(previous, tier, video_enabled) == QualityAction::DisableLocalVideo {
            if let Some(track) = self
                .local_media
                .as_ref()
                .and_then(|media| media.track(TrackKind::Video))
            {
                warn!("Bandwidth too low for video, switching to audio only");
                track.set_enabled(false);
                self.publish_local_media();
                self.notify_local_toggle(TrackKind::Video, false).await;
            }
        }
    }

    // --------------------------------------------------------------------
    // Peer link lifecycle
    // --------------------------------------------------------------------

    /// Creates a fresh incarnation with an empty candidate buffer and
    /// attaches every local track to it.
    fn install_link(&mut self) -> Result<(), TeleconsultationError> {
        let id = self.next_incarnation;
        self.next_incarnation += 1;

        let events = LinkEventSender::new(id, self.link_events_tx.clone());
        let link = self.deps.links.create(&self.config.rtc, events)?;

        if let Some(media) = &self.local_media {
            for track in media.tracks() {
                if let Err(e) = link.add_track(Arc::clone(track)) {
                    warn!("Failed to attach {} track {}: {}", track.kind(), track.id(), e);
                }
            }
        }

        debug!("Installed peer link incarnation {}", id);
        self.link = Some(LinkIncarnation {
            id,
            link,
            candidates: CandidateBuffer::new(),
            making_offer: false,
            ice_restart_attempted: false,
            monitor: None,
        });
        Ok(())
    }

    /// Best effort: every step runs even when an earlier one fails.
    async fn release_resources(&mut self) {
        if let Some(incarnation) = self.link.take() {
            debug!("Closing peer link incarnation {}", incarnation.id);
            incarnation.link.close();
        }

        if let Some(media) = self.local_media.take() {
            media.stop_all();
        }

        if self.signaling_open {
            self.signaling_open = false;
            let leave = OutboundSignal::LeaveRoom {
                room_id: self.config.room_id.clone(),
            };
            if let Err(e) = self.deps.signaling.emit(leave).await {
                warn!("Failed to leave room {}: {}", self.config.room_id, e);
            }
            if let Err(e) = self.deps.signaling.disconnect().await {
                warn!("Failed to disconnect signaling: {}", e);
            }
        }
        self.inbound = None;
        self.set_remote_stream(None);
    }

    async fn abort_start(&mut self) {
        self.release_resources().await;
        self.transition(SessionState::Idle);
    }

    async fn teardown(&mut self) {
        if self.state == SessionState::Ended {
            return;
        }
        info!("Ending session {} in state {}", self.session_id, self.state);
        self.release_resources().await;
        self.transition(SessionState::Ended);
    }

    // --------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------

    fn join_signal(&self) -> OutboundSignal {
        OutboundSignal::JoinRoom {
            room_id: self.config.room_id.clone(),
            role: self.config.role,
        }
    }

    async fn emit(&self, signal: OutboundSignal) -> Result<(), TeleconsultationError> {
        debug!("Outbound {} to room {}", signal.name(), self.config.room_id);
        self.deps.signaling.emit(signal).await
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!("Session {}: {} -> {}", self.session_id, self.state, next);
        self.state = next;
        self.publish(SessionEvent::StateChanged(next));
        self.publish_snapshot();
    }

    fn set_remote_stream(&mut self, stream: Option<RemoteStream>) {
        if self.remote_stream == stream {
            return;
        }
        self.remote_stream = stream.clone();
        self.publish(SessionEvent::RemoteStreamChanged(stream));
    }

    fn publish_local_media(&self) {
        let (audio_enabled, video_enabled) = self.local_flags();
        self.publish(SessionEvent::LocalMediaChanged {
            audio_enabled,
            video_enabled,
        });
    }

    fn publish_peer_media(&self) {
        self.publish(SessionEvent::PeerMediaChanged {
            audio_enabled: self.peer_audio_enabled,
            video_enabled: self.peer_video_enabled,
        });
    }

    fn local_flags(&self) -> (bool, bool) {
        self.local_media
            .as_ref()
            .map(|media| {
                (
                    media.is_enabled(TrackKind::Audio),
                    media.is_enabled(TrackKind::Video),
                )
            })
            .unwrap_or((false, false))
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_snapshot(&self) {
        let (audio_enabled, video_enabled) = self.local_flags();
        self.snapshot.send_replace(SessionSnapshot {
            session_id: self.session_id,
            room_id: self.config.room_id.clone(),
            role: self.config.role,
            state: self.state,
            audio_enabled,
            video_enabled,
            peer_audio_enabled: self.peer_audio_enabled,
            peer_video_enabled: self.peer_video_enabled,
            quality: self.quality,
            link_incarnation: self.link.as_ref().map(|incarnation| incarnation.id),
            remote_stream: self.remote_stream.clone(),
        });
    }
}

fn log_violation(violation: &ProtocolViolation) {
    warn!("Dropping inbound message: {}", violation);
}

fn peer_link_missing(operation: &str) -> TeleconsultationError {
    TeleconsultationError::PeerLink {
        message: format!("no peer link to {}", operation),
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves once shutdown is requested or the handle is dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        debug!("Session handle dropped");
    }
}

/// Runs `operation` unless shutdown is requested first. `None` means the
/// operation was abandoned.
async fn interruptible<F, T>(shutdown: &mut watch::Receiver<bool>, operation: F) -> Option<T>
where
    F: Future<Output = T>,
{
    if shutdown_requested(shutdown) {
        return None;
    }
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => None,
        output = operation => Some(output),
    }
}

async fn next_signal(inbound: &mut Option<mpsc::UnboundedReceiver<InboundSignal>>) -> Option<InboundSignal> {
    match inbound {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_quality_tick(link: &mut Option<LinkIncarnation>) {
    match link.as_mut().and_then(|incarnation| incarnation.monitor.as_mut()) {
        Some(monitor) => monitor.tick().await,
        None => std::future::pending().await,
    }
}
