// libs/teleconsultation-cell/src/platform.rs
//! Seams to the outside world: local media, the peer link stack, the
//! signaling transport and the consultation-record service.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::models::{
    ConsultationMetadata, IceCandidate, InboundSignal, LinkEvent, LinkStats, MediaConstraints,
    NegotiationState, OutboundSignal, RtcConfiguration, SessionDescription,
    TeleconsultationError, TrackKind,
};

/// A single local capture track. Enabling and disabling is a flag flip on the
/// live track; `stop` releases the device and is final.
pub trait MediaTrack: Send + Sync + Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

/// Local tracks acquired for a session. They outlive every peer link
/// incarnation and are only stopped at final teardown.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// A missing track counts as disabled.
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.track(kind).map(|track| track.is_enabled()).unwrap_or(false)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, TeleconsultationError>;
}

/// One incarnation of the transport-level connection to the peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TeleconsultationError>;

    fn negotiation_state(&self) -> NegotiationState;

    fn has_remote_description(&self) -> bool;

    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, TeleconsultationError>;

    async fn create_answer(&self) -> Result<SessionDescription, TeleconsultationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TeleconsultationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TeleconsultationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TeleconsultationError>;

    async fn stats(&self) -> Result<LinkStats, TeleconsultationError>;

    fn close(&self);
}

/// Tags every event with the incarnation that produced it, so events from a
/// closed link cannot reach its replacement.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    incarnation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEventSender {
    pub fn new(incarnation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { incarnation, tx }
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Returns false once the owning session is gone.
    pub fn send(&self, event: LinkEvent) -> bool {
        self.tx.send((self.incarnation, event)).is_ok()
    }
}

pub trait PeerLinkFactory: Send + Sync {
    fn create(
        &self,
        config: &RtcConfiguration,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerLink>, TeleconsultationError>;
}

/// Room-scoped publish/subscribe transport. Delivery is ordered and
/// at-least-once.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<InboundSignal>, TeleconsultationError>;

    async fn emit(&self, signal: OutboundSignal) -> Result<(), TeleconsultationError>;

    async fn disconnect(&self) -> Result<(), TeleconsultationError>;
}

/// The consultation-record service. Plain request/response, no retries.
#[async_trait]
pub trait ConsultationRecords: Send + Sync {
    async fn fetch_consultation(
        &self,
        consultation_id: &str,
    ) -> Result<ConsultationMetadata, TeleconsultationError>;

    async fn finish_consultation(&self, consultation_id: &str) -> Result<(), TeleconsultationError>;

    async fn leave_consultation(&self, consultation_id: &str) -> Result<(), TeleconsultationError>;
}
