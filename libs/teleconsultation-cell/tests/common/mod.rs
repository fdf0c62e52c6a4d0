#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use teleconsultation_cell::models::{
    CandidatePairState, CandidatePairStats, IceCandidate, InboundSignal, LinkConnectionState,
    LinkEvent, LinkStats, MediaConstraints, NegotiationState, OutboundSignal, ParticipantRole,
    RemoteStream, RtcConfiguration, SdpType, SessionDescription, SessionEvent, TeleconsultationError, TrackKind,
};
use teleconsultation_cell::platform::{
    LinkEventSender, LocalMedia, MediaDevices, MediaTrack, PeerLink, PeerLinkFactory,
    SignalingChannel,
};
use teleconsultation_cell::services::{SessionConfig, SessionCoordinator, SessionDeps, SessionHandle};
use teleconsultation_cell::SessionState;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ==============================================================================
// MEDIA
// ==============================================================================

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: format!("local-{}", kind),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireMode {
    Succeed,
    Fail,
    Hang,
}

pub struct FakeMediaDevices {
    pub audio: Arc<FakeTrack>,
    pub video: Arc<FakeTrack>,
    mode: AcquireMode,
    acquire_calls: AtomicUsize,
}

impl FakeMediaDevices {
    fn with_mode(mode: AcquireMode) -> Arc<Self> {
        Arc::new(Self {
            audio: FakeTrack::new(TrackKind::Audio),
            video: FakeTrack::new(TrackKind::Video),
            mode,
            acquire_calls: AtomicUsize::new(0),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::with_mode(AcquireMode::Succeed)
    }

    pub fn unavailable() -> Arc<Self> {
        Self::with_mode(AcquireMode::Fail)
    }

    /// A device prompt the user never answers.
    pub fn hanging() -> Arc<Self> {
        Self::with_mode(AcquireMode::Hang)
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<LocalMedia, TeleconsultationError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            AcquireMode::Succeed => {}
            AcquireMode::Fail => {
                return Err(TeleconsultationError::MediaUnavailable {
                    message: "camera permission denied".to_string(),
                });
            }
            AcquireMode::Hang => std::future::pending::<()>().await,
        }
        Ok(LocalMedia::new(vec![
            self.audio.clone() as Arc<dyn MediaTrack>,
            self.video.clone() as Arc<dyn MediaTrack>,
        ]))
    }
}

// ==============================================================================
// PEER LINK
// ==============================================================================

#[derive(Debug, Default)]
pub struct LinkRecord {
    pub negotiation_state: Option<NegotiationState>,
    pub remote_description: Option<SessionDescription>,
    pub local_description: Option<SessionDescription>,
    pub offers_created: Vec<bool>,
    pub answers_created: usize,
    pub applied_candidates: Vec<String>,
    pub tracks: Vec<String>,
    pub closed: bool,
    pub outgoing_bitrate: Option<u64>,
    pub stats_calls: usize,
}

/// Shared view of one fake link incarnation, kept by the factory so tests
/// can inspect it and drive its events.
pub struct FakeLinkState {
    pub record: Mutex<LinkRecord>,
    pub events: LinkEventSender,
    pub reject_candidate: Option<String>,
    pub stall_offers: bool,
}

impl FakeLinkState {
    pub fn incarnation(&self) -> u64 {
        self.events.incarnation()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.record
            .lock()
            .unwrap()
            .negotiation_state
            .unwrap_or(NegotiationState::Stable)
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.record.lock().unwrap().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> Vec<bool> {
        self.record.lock().unwrap().offers_created.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.record.lock().unwrap().closed
    }

    pub fn tracks(&self) -> Vec<String> {
        self.record.lock().unwrap().tracks.clone()
    }

    pub fn stats_calls(&self) -> usize {
        self.record.lock().unwrap().stats_calls
    }

    pub fn has_remote_description(&self) -> bool {
        self.record.lock().unwrap().remote_description.is_some()
    }

    pub fn set_outgoing_bitrate(&self, bitrate: Option<u64>) {
        self.record.lock().unwrap().outgoing_bitrate = bitrate;
    }

    pub fn report(&self, state: LinkConnectionState) {
        self.events.send(LinkEvent::ConnectionStateChanged(state));
    }

    pub fn stream(&self, id: &str) {
        self.events.send(LinkEvent::RemoteStream(RemoteStream {
            id: id.to_string(),
        }));
    }

    pub fn gather(&self, candidate: &str) {
        self.events
            .send(LinkEvent::LocalCandidate(IceCandidate::new(candidate)));
    }
}

struct FakePeerLink {
    state: Arc<FakeLinkState>,
}

#[async_trait]
impl PeerLink for FakePeerLink {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TeleconsultationError> {
        self.state
            .record
            .lock()
            .unwrap()
            .tracks
            .push(track.id().to_string());
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.state.negotiation_state()
    }

    fn has_remote_description(&self) -> bool {
        self.state.record.lock().unwrap().remote_description.is_some()
    }

    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, TeleconsultationError> {
        let created = {
            let mut record = self.state.record.lock().unwrap();
            record.offers_created.push(ice_restart);
            record.offers_created.len()
        };
        if self.state.stall_offers {
            std::future::pending::<()>().await;
        }
        Ok(SessionDescription::offer(format!("v=0 offer-{}", created)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TeleconsultationError> {
        let mut record = self.state.record.lock().unwrap();
        record.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "v=0 answer-{}",
            record.answers_created
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TeleconsultationError> {
        let mut record = self.state.record.lock().unwrap();
        record.negotiation_state = Some(match description.sdp_type {
            SdpType::Offer => NegotiationState::HaveLocalOffer,
            SdpType::Answer => NegotiationState::Stable,
        });
        record.local_description = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TeleconsultationError> {
        let mut record = self.state.record.lock().unwrap();
        record.negotiation_state = Some(match description.sdp_type {
            SdpType::Offer => NegotiationState::HaveRemoteOffer,
            SdpType::Answer => NegotiationState::Stable,
        });
        record.remote_description = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TeleconsultationError> {
        if self.state.reject_candidate.as_deref() == Some(candidate.candidate.as_str()) {
            return Err(TeleconsultationError::PeerLink {
                message: format!("cannot parse {}", candidate.candidate),
            });
        }
        self.state
            .record
            .lock()
            .unwrap()
            .applied_candidates
            .push(candidate.candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<LinkStats, TeleconsultationError> {
        let bitrate = {
            let mut record = self.state.record.lock().unwrap();
            record.stats_calls += 1;
            record.outgoing_bitrate
        };
        Ok(LinkStats {
            candidate_pairs: bitrate
                .map(|bps| {
                    vec![CandidatePairStats {
                        state: CandidatePairState::Succeeded,
                        available_outgoing_bitrate: Some(bps),
                    }]
                })
                .unwrap_or_default(),
        })
    }

    fn close(&self) {
        let mut record = self.state.record.lock().unwrap();
        record.closed = true;
        record.negotiation_state = Some(NegotiationState::Closed);
    }
}

#[derive(Default)]
pub struct FakeLinkFactory {
    links: Mutex<Vec<Arc<FakeLinkState>>>,
    reject_candidate: Option<String>,
    stall_offers: bool,
}

impl FakeLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting(candidate: &str) -> Arc<Self> {
        Arc::new(Self {
            reject_candidate: Some(candidate.to_string()),
            ..Self::default()
        })
    }

    /// Links whose offer creation never completes.
    pub fn stalling_offers() -> Arc<Self> {
        Arc::new(Self {
            stall_offers: true,
            ..Self::default()
        })
    }

    pub fn links(&self) -> Vec<Arc<FakeLinkState>> {
        self.links.lock().unwrap().clone()
    }

    pub fn current(&self) -> Arc<FakeLinkState> {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer link created yet")
    }
}

impl PeerLinkFactory for FakeLinkFactory {
    fn create(
        &self,
        _config: &RtcConfiguration,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>, TeleconsultationError> {
        let state = Arc::new(FakeLinkState {
            record: Mutex::new(LinkRecord::default()),
            events,
            reject_candidate: self.reject_candidate.clone(),
            stall_offers: self.stall_offers,
        });
        self.links.lock().unwrap().push(Arc::clone(&state));
        Ok(Box::new(FakePeerLink { state }))
    }
}

// ==============================================================================
// SIGNALING
// ==============================================================================

#[derive(Default)]
pub struct FakeSignaling {
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundSignal>>>,
    sent: Mutex<Vec<OutboundSignal>>,
    disconnected: AtomicBool,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliver(&self, signal: InboundSignal) {
        let inbound = self.inbound.lock().unwrap();
        inbound
            .as_ref()
            .expect("signaling channel not opened")
            .send(signal)
            .expect("session dropped its inbound channel");
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<OutboundSignal> {
        self.sent()
            .into_iter()
            .filter(|signal| signal.name() == name)
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<InboundSignal>, TeleconsultationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn emit(&self, signal: OutboundSignal) -> Result<(), TeleconsultationError> {
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TeleconsultationError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ==============================================================================
// HARNESS
// ==============================================================================

pub struct Harness {
    pub media: Arc<FakeMediaDevices>,
    pub links: Arc<FakeLinkFactory>,
    pub signaling: Arc<FakeSignaling>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            media: FakeMediaDevices::new(),
            links: FakeLinkFactory::new(),
            signaling: FakeSignaling::new(),
        }
    }

    pub fn with_media(mut self, media: Arc<FakeMediaDevices>) -> Self {
        self.media = media;
        self
    }

    pub fn with_links(mut self, links: Arc<FakeLinkFactory>) -> Self {
        self.links = links;
        self
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            media: self.media.clone(),
            links: self.links.clone(),
            signaling: self.signaling.clone(),
        }
    }

    pub fn spawn(&self, role: ParticipantRole) -> SessionHandle {
        SessionCoordinator::spawn(session_config("R1", role), self.deps(), None)
    }
}

pub fn session_config(room_id: &str, role: ParticipantRole) -> SessionConfig {
    SessionConfig::new(&shared_config::AppConfig::default(), room_id, role)
}

pub fn candidate(name: &str) -> InboundSignal {
    InboundSignal::IceCandidate {
        signal: IceCandidate::new(name),
    }
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_for_state(session: &SessionHandle, state: SessionState) {
    let mut watch = session.watch();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("session task gone");
}

/// Gives the session actor a chance to drain what was delivered so far.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Waits for the first event matching `wanted`, skipping everything else.
pub async fn next_event<F>(events: &mut broadcast::Receiver<SessionEvent>, mut wanted: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), search)
        .await
        .expect("timed out waiting for session event")
}
