// libs/teleconsultation-cell/src/services/mod.rs

pub mod candidates;
pub mod consultation;
pub mod coordinator;
pub mod integration;
pub mod negotiation;
pub mod quality;

pub use candidates::{CandidateBuffer, FlushOutcome};
pub use consultation::ConsultationApiClient;
pub use coordinator::{
    OnConsultationEnded, SessionConfig, SessionCoordinator, SessionDeps, SessionHandle,
};
pub use integration::TeleconsultationService;
pub use negotiation::{NegotiationRoleRules, ProtocolViolation};
pub use quality::{QualityAction, QualityMonitor};
