// libs/teleconsultation-cell/src/lib.rs
//! # Teleconsultation Cell
//!
//! Live doctor/patient call sessions. The cell brings the two participants
//! of a consultation room into a peer audio/video link through a signaling
//! channel and keeps that link healthy while the call runs.
//!
//! ## Features
//!
//! - **Role-gated negotiation**: the doctor always offers and the patient
//!   always answers, so both sides never offer at the same time.
//! - **Candidate buffering**: remote ICE candidates that arrive early are
//!   queued and applied in order once a remote description is set.
//! - **Recovery**: the peer link is rebuilt when the peer is lost, and the
//!   doctor restarts ICE in place when the transport fails.
//! - **Quality adaptation**: outgoing bitrate is sampled periodically, and
//!   local video is switched off when the link can only carry audio.
//! - **Consultation records**: the consultation is fetched before a call
//!   and finished or left after it.
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------+
//! |                 Teleconsultation Cell                |
//! +------------------------------------------------------+
//! |  models.rs        |  Wire events, states, errors     |
//! |  platform.rs      |  Media, peer link, signaling and |
//! |                   |  record-service traits           |
//! |  services/        |                                  |
//! |    coordinator.rs |  Session actor and handle        |
//! |    negotiation.rs |  Offer/answer role rules         |
//! |    candidates.rs  |  Early candidate buffer          |
//! |    quality.rs     |  Bitrate tiers and sampling      |
//! |    consultation.rs|  Consultation REST client        |
//! |    integration.rs |  Prepare/conclude around a call  |
//! +------------------------------------------------------+
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shared_config::AppConfig;
//! use teleconsultation_cell::{
//!     ConsultationApiClient, EndChoice, ParticipantRole, SessionCoordinator, SessionDeps,
//!     TeleconsultationService,
//! };
//!
//! # async fn example(deps: SessionDeps) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(AppConfig::load());
//! let records = Arc::new(ConsultationApiClient::new(&config, ParticipantRole::Patient)?);
//! let service = TeleconsultationService::new(records, Arc::clone(&config));
//!
//! let session_config = service.prepare_session("consultation-id", ParticipantRole::Patient).await?;
//! let session = SessionCoordinator::spawn(session_config, deps, None);
//! session.start().await?;
//!
//! // ... the call runs ...
//!
//! service.conclude(&session, "consultation-id", EndChoice::End).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! - `CONSULTATION_API_URL` - consultation-record service base URL
//! - `CONSULTATION_API_TOKEN` - bearer token for that service
//! - `ICE_SERVER_URLS` - comma-separated STUN/TURN URLs (optional)
//! - `QUALITY_SAMPLE_INTERVAL_SECS` - monitor period, defaults to 5

pub mod models;
pub mod platform;
pub mod services;

pub use models::{
    ConsultationMetadata, ConsultationStatus, EndChoice, IceCandidate, InboundSignal,
    LinkConnectionState, LinkEvent, NegotiationState, OutboundSignal, ParticipantRole,
    QualityTier, SessionDescription, SessionEvent, SessionSnapshot, SessionState,
    TeleconsultationError, TrackKind,
};

pub use platform::{
    ConsultationRecords, LinkEventSender, LocalMedia, MediaDevices, MediaTrack, PeerLink,
    PeerLinkFactory, SignalingChannel,
};

pub use services::{
    CandidateBuffer, ConsultationApiClient, NegotiationRoleRules, QualityMonitor, SessionConfig,
    SessionCoordinator, SessionDeps, SessionHandle, TeleconsultationService,
};
