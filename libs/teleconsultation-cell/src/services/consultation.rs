// libs/teleconsultation-cell/src/services/consultation.rs
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, error, info};

use shared_config::AppConfig;

use crate::models::{ConsultationMetadata, ParticipantRole, TeleconsultationError};
use crate::platform::ConsultationRecords;

/// REST client for the consultation-record service.
/// Patients and doctors reach the records through different route prefixes.
pub struct ConsultationApiClient {
    client: Client,
    base_url: String,
    api_token: String,
    role: ParticipantRole,
}

impl ConsultationApiClient {
    pub fn new(config: &AppConfig, role: ParticipantRole) -> Result<Self, TeleconsultationError> {
        if !config.is_configured() {
            return Err(TeleconsultationError::NotConfigured);
        }

        Ok(Self {
            client: Client::new(),
            base_url: config.consultation_api_url.trim_end_matches('/').to_string(),
            api_token: config.consultation_api_token.clone(),
            role,
        })
    }

    fn detail_url(&self, consultation_id: &str) -> String {
        match self.role {
            ParticipantRole::Patient => {
                format!("{}/patient-consultations/{}", self.base_url, consultation_id)
            }
            ParticipantRole::Doctor => {
                format!("{}/doctor/consultations/{}", self.base_url, consultation_id)
            }
        }
    }

    fn finish_url(&self, consultation_id: &str) -> String {
        match self.role {
            ParticipantRole::Patient => format!("{}/finish", self.detail_url(consultation_id)),
            ParticipantRole::Doctor => format!("{}/complete", self.detail_url(consultation_id)),
        }
    }

    async fn post_action(&self, url: &str, action: &str) -> Result<(), TeleconsultationError> {
        debug!("Sending {} request to: {}", action, url);

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .send()
            .await?;

        check_status(response, action).await?;
        Ok(())
    }
}

#[async_trait]
impl ConsultationRecords for ConsultationApiClient {
    /// GET /patient-consultations/{id} or /doctor/consultations/{id}
    async fn fetch_consultation(
        &self,
        consultation_id: &str,
    ) -> Result<ConsultationMetadata, TeleconsultationError> {
        let url = self.detail_url(consultation_id);
        debug!("Fetching consultation from: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .await?;

        let response_text = check_status(response, "fetch consultation").await?;

        let metadata: ConsultationMetadata = serde_json::from_str(&response_text).map_err(|e| {
            TeleconsultationError::ConsultationApi {
                message: format!("Failed to parse consultation response: {}", e),
            }
        })?;

        debug!("Consultation {} is {:?}", metadata.id, metadata.status);
        Ok(metadata)
    }

    /// POST /patient-consultations/{id}/finish or /doctor/consultations/{id}/complete
    async fn finish_consultation(&self, consultation_id: &str) -> Result<(), TeleconsultationError> {
        info!("Finishing consultation: {}", consultation_id);
        self.post_action(&self.finish_url(consultation_id), "finish consultation")
            .await?;
        info!("Successfully finished consultation: {}", consultation_id);
        Ok(())
    }

    /// POST /patient-consultations/{id}/leave. Doctors have no leave route.
    async fn leave_consultation(&self, consultation_id: &str) -> Result<(), TeleconsultationError> {
        match self.role {
            ParticipantRole::Patient => {
                let url = format!("{}/leave", self.detail_url(consultation_id));
                self.post_action(&url, "leave consultation").await
            }
            ParticipantRole::Doctor => {
                debug!("Doctor left consultation {} without a record update", consultation_id);
                Ok(())
            }
        }
    }
}

/// Returns the body of a successful response; maps failures to errors.
async fn check_status(response: Response, action: &str) -> Result<String, TeleconsultationError> {
    let status = response.status();
    let response_text = response.text().await?;

    if status == StatusCode::NOT_FOUND {
        error!("Consultation API {} returned 404: {}", action, response_text);
        return Err(TeleconsultationError::ConsultationNotFound);
    }
    if !status.is_success() {
        error!("Consultation API {} failed: {} - {}", action, status, response_text);
        return Err(TeleconsultationError::ConsultationApi {
            message: format!("HTTP {}: {}", status, response_text),
        });
    }

    Ok(response_text)
}
