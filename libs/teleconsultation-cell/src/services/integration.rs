// libs/teleconsultation-cell/src/services/integration.rs
use std::sync::Arc;
use tracing::{info, warn};

use shared_config::AppConfig;

use crate::models::{EndChoice, ParticipantRole, TeleconsultationError};
use crate::platform::ConsultationRecords;
use crate::services::coordinator::{SessionConfig, SessionHandle};

/// Ties a live session to its consultation record: checks the record before
/// a call and reports the caller's end choice after it.
pub struct TeleconsultationService {
    records: Arc<dyn ConsultationRecords>,
    config: Arc<AppConfig>,
}

impl TeleconsultationService {
    pub fn new(records: Arc<dyn ConsultationRecords>, config: Arc<AppConfig>) -> Self {
        Self { records, config }
    }

    /// Builds the session configuration for a consultation. The room is the
    /// consultation id, so both participants meet in the same room.
    pub async fn prepare_session(
        &self,
        consultation_id: &str,
        role: ParticipantRole,
    ) -> Result<SessionConfig, TeleconsultationError> {
        let consultation = self.records.fetch_consultation(consultation_id).await?;

        if consultation.status.is_closed() {
            warn!(
                "Consultation {} is {:?}; refusing to start a call",
                consultation_id, consultation.status
            );
            return Err(TeleconsultationError::InvalidSessionState {
                state: format!("{:?}", consultation.status),
            });
        }

        info!("Preparing {} session for consultation {}", role, consultation.id);
        Ok(SessionConfig::new(&self.config, consultation.id, role))
    }

    /// Ends the session, then forwards the choice to the record service.
    /// The session reaches `Ended` even if the record update fails.
    pub async fn conclude(
        &self,
        session: &SessionHandle,
        consultation_id: &str,
        choice: EndChoice,
    ) -> Result<(), TeleconsultationError> {
        session.end().await;

        match choice {
            EndChoice::End => self.records.finish_consultation(consultation_id).await,
            EndChoice::Leave => self.records.leave_consultation(consultation_id).await,
        }
    }
}
