// libs/teleconsultation-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// PARTICIPANTS & SESSION LIFECYCLE
// ==============================================================================

/// The two sides of a consultation room. Exactly one of each per room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParticipantRole {
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "patient")]
    Patient,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Doctor => "doctor",
            ParticipantRole::Patient => "patient",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one call attempt.
///
/// `Idle -> AcquiringMedia -> SignalingConnected -> Negotiating -> Connected
/// -> (Reconnecting -> Negotiating)* -> Ended`. `Ended` is reachable from
/// every state and is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    SignalingConnected,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
}

impl SessionState {
    /// States in which offers, answers and candidates are processed.
    pub fn accepts_negotiation_traffic(&self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::Connected | SessionState::Reconnecting
        )
    }

    pub fn has_signaling(&self) -> bool {
        matches!(
            self,
            SessionState::SignalingConnected
                | SessionState::Negotiating
                | SessionState::Connected
                | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringMedia => "acquiring-media",
            SessionState::SignalingConnected => "signaling-connected",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Offer/answer sub-state of a peer link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport-level state reported by a peer link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// How the caller leaves the call. `End` finishes the consultation record,
/// `Leave` only steps out of the room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndChoice {
    Leave,
    End,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatientStatus {
    Waiting,
    Left,
    Finished,
}

// ==============================================================================
// QUALITY
// ==============================================================================

/// Ordinal link quality, lowest first so that `Ord` reads naturally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QualityTier {
    #[serde(rename = "audio-only")]
    AudioOnly,
    #[serde(rename = "poor")]
    Poor,
    #[serde(rename = "fair")]
    Fair,
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "excellent")]
    Excellent,
}

impl QualityTier {
    pub fn from_bitrate(bits_per_second: u64) -> Self {
        match bits_per_second {
            bps if bps > 1_000_000 => QualityTier::Excellent,
            bps if bps > 500_000 => QualityTier::Good,
            bps if bps > 200_000 => QualityTier::Fair,
            bps if bps > 100_000 => QualityTier::Poor,
            _ => QualityTier::AudioOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePairStats {
    pub state: CandidatePairState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_outgoing_bitrate: Option<u64>,
}

/// Statistics report returned by a peer link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub candidate_pairs: Vec<CandidatePairStats>,
}

/// One monitoring tick's worth of link statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualitySample {
    pub outgoing_bitrate: u64,
    pub sampled_at: DateTime<Utc>,
}

impl QualitySample {
    /// Takes the available outgoing bitrate of the last succeeded candidate
    /// pair. A zero or absent bitrate is not a sample.
    pub fn from_stats(stats: &LinkStats) -> Option<Self> {
        stats
            .candidate_pairs
            .iter()
            .filter(|pair| pair.state == CandidatePairState::Succeeded)
            .filter_map(|pair| pair.available_outgoing_bitrate)
            .last()
            .filter(|bps| *bps > 0)
            .map(|outgoing_bitrate| QualitySample {
                outgoing_bitrate,
                sampled_at: Utc::now(),
            })
    }

    pub fn tier(&self) -> QualityTier {
        QualityTier::from_bitrate(self.outgoing_bitrate)
    }
}

// ==============================================================================
// SESSION DESCRIPTIONS & CANDIDATES
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Configuration handed to the platform when a peer link is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

// ==============================================================================
// MEDIA
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: bool,
    pub video_ideal_width: u32,
    pub video_ideal_height: u32,
}

/// Opaque handle to the remote participant's media stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

// ==============================================================================
// SIGNALING WIRE EVENTS
// ==============================================================================

/// Events delivered by the signaling channel, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum InboundSignal {
    ReadyToConnect,
    PeerJoined { role: ParticipantRole },
    Offer { signal: SessionDescription },
    Answer { signal: SessionDescription },
    IceCandidate { signal: IceCandidate },
    PeerDisconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<ParticipantRole>,
    },
    PeerAudioToggle { enabled: bool },
    PeerVideoToggle { enabled: bool },
    ConsultationEnded,
    SessionReplaced,
    PatientJoinedWaitingRoom,
    PatientLeftWaitingRoom,
    PatientFinishedConsultation,
    /// The transport itself re-established its connection.
    Reconnected,
}

impl InboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            InboundSignal::ReadyToConnect => "ready-to-connect",
            InboundSignal::PeerJoined { .. } => "peer-joined",
            InboundSignal::Offer { .. } => "offer",
            InboundSignal::Answer { .. } => "answer",
            InboundSignal::IceCandidate { .. } => "ice-candidate",
            InboundSignal::PeerDisconnected { .. } => "peer-disconnected",
            InboundSignal::PeerAudioToggle { .. } => "peer-audio-toggle",
            InboundSignal::PeerVideoToggle { .. } => "peer-video-toggle",
            InboundSignal::ConsultationEnded => "consultation-ended",
            InboundSignal::SessionReplaced => "session-replaced",
            InboundSignal::PatientJoinedWaitingRoom => "patient-joined-waiting-room",
            InboundSignal::PatientLeftWaitingRoom => "patient-left-waiting-room",
            InboundSignal::PatientFinishedConsultation => "patient-finished-consultation",
            InboundSignal::Reconnected => "reconnected",
        }
    }
}

/// Everything the session sends to the signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundSignal {
    JoinRoom { room_id: String, role: ParticipantRole },
    LeaveRoom { room_id: String },
    Offer { room_id: String, signal: SessionDescription },
    Answer { room_id: String, signal: SessionDescription },
    IceCandidate { room_id: String, signal: IceCandidate },
    ToggleAudio { room_id: String, enabled: bool },
    ToggleVideo { room_id: String, enabled: bool },
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundSignal::JoinRoom { .. } => "join-room",
            OutboundSignal::LeaveRoom { .. } => "leave-room",
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::IceCandidate { .. } => "ice-candidate",
            OutboundSignal::ToggleAudio { .. } => "toggle-audio",
            OutboundSignal::ToggleVideo { .. } => "toggle-video",
        }
    }
}

/// Events raised by a peer link incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
    ConnectionStateChanged(LinkConnectionState),
}

// ==============================================================================
// CALLER-FACING NOTIFICATIONS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    LinkStateChanged(LinkConnectionState),
    RemoteStreamChanged(Option<RemoteStream>),
    QualityChanged(QualityTier),
    LocalMediaChanged { audio_enabled: bool, video_enabled: bool },
    PeerMediaChanged { audio_enabled: bool, video_enabled: bool },
    PatientStatusChanged(PatientStatus),
    SessionReplaced,
    ConnectivityLost { reason: String },
    ConsultationEnded,
}

/// Point-in-time view of a session, published after every processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub room_id: String,
    pub role: ParticipantRole,
    pub state: SessionState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub peer_audio_enabled: bool,
    pub peer_video_enabled: bool,
    pub quality: QualityTier,
    pub link_incarnation: Option<u64>,
    pub remote_stream: Option<RemoteStream>,
}

// ==============================================================================
// CONSULTATION RECORDS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    Pending,
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl ConsultationStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConsultationStatus::Completed | ConsultationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationMetadata {
    pub id: String,
    pub status: ConsultationStatus,
    pub scheduled_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_number: Option<String>,
    pub doctor_id: String,
    pub patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ==============================================================================
// ERROR HANDLING
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TeleconsultationError {
    #[error("Local media unavailable: {message}")]
    MediaUnavailable { message: String },

    #[error("Signaling channel error: {message}")]
    Signaling { message: String },

    #[error("Peer link error: {message}")]
    PeerLink { message: String },

    #[error("Session is not in a state that allows this operation: {state}")]
    InvalidSessionState { state: String },

    #[error("Session has ended")]
    SessionEnded,

    #[error("Consultation API error: {message}")]
    ConsultationApi { message: String },

    #[error("Consultation not found")]
    ConsultationNotFound,

    #[error("Teleconsultation not configured")]
    NotConfigured,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<anyhow::Error> for TeleconsultationError {
    fn from(err: anyhow::Error) -> Self {
        TeleconsultationError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for TeleconsultationError {
    fn from(err: reqwest::Error) -> Self {
        TeleconsultationError::ConsultationApi {
            message: err.to_string(),
        }
    }
}
