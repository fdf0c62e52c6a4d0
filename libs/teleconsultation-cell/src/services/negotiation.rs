// libs/teleconsultation-cell/src/services/negotiation.rs
//! Which participant may originate, accept and answer offers.
//!
//! The doctor is the only side that ever creates an offer and the patient is
//! the only side that ever answers one. Glare cannot happen because both
//! sides never offer at once.

use crate::models::{NegotiationState, ParticipantRole, SdpType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{role} may not accept an inbound {kind:?}")]
    WrongRole { role: ParticipantRole, kind: SdpType },

    #[error("inbound {kind:?} arrived while link is {state:?}")]
    WrongNegotiationState { kind: SdpType, state: NegotiationState },

    #[error("{event} arrived while session is {session_state}")]
    OutOfSessionState {
        event: &'static str,
        session_state: String,
    },
}

pub struct NegotiationRoleRules;

impl NegotiationRoleRules {
    pub fn may_originate_offer(role: ParticipantRole) -> bool {
        role == ParticipantRole::Doctor
    }

    pub fn may_accept_offer(role: ParticipantRole) -> bool {
        role == ParticipantRole::Patient
    }

    pub fn may_accept_answer(role: ParticipantRole) -> bool {
        role == ParticipantRole::Doctor
    }

    /// An inbound offer is applied only by the answering role, and only while
    /// the link is stable. A late offer during negotiation is dropped.
    pub fn check_inbound_offer(
        role: ParticipantRole,
        state: NegotiationState,
    ) -> Result<(), ProtocolViolation> {
        if !Self::may_accept_offer(role) {
            return Err(ProtocolViolation::WrongRole {
                role,
                kind: SdpType::Offer,
            });
        }
        if state != NegotiationState::Stable {
            return Err(ProtocolViolation::WrongNegotiationState {
                kind: SdpType::Offer,
                state,
            });
        }
        Ok(())
    }

    /// An inbound answer must match an outstanding local offer.
    pub fn check_inbound_answer(
        role: ParticipantRole,
        state: NegotiationState,
    ) -> Result<(), ProtocolViolation> {
        if !Self::may_accept_answer(role) {
            return Err(ProtocolViolation::WrongRole {
                role,
                kind: SdpType::Answer,
            });
        }
        if state != NegotiationState::HaveLocalOffer {
            return Err(ProtocolViolation::WrongNegotiationState {
                kind: SdpType::Answer,
                state,
            });
        }
        Ok(())
    }

    /// Whether a `ready-to-connect` should produce a fresh offer.
    pub fn should_offer_on_ready(
        role: ParticipantRole,
        state: NegotiationState,
        offer_in_flight: bool,
    ) -> bool {
        Self::may_originate_offer(role) && state == NegotiationState::Stable && !offer_in_flight
    }
}
