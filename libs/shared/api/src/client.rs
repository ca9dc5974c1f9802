use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{Scope, ScopeKind};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Slot already held by another session")]
    Conflict,

    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            // Connect failures, timeouts and dropped sockets are all
            // retriable from the caller's point of view.
            ApiError::Transient(err.to_string())
        }
    }
}

/// One day of fetched availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<SlotEntry>,
}

/// One (time, professional) entry inside a fetched day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotEntry {
    pub time: NaiveTime,
    pub professional_id: Uuid,
    pub is_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    pub professional_id: Uuid,
    pub specialty_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// The server's answer to a successful reservation: the hold id plus the
/// authoritative expiry timestamp the countdown is derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationGrant {
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub reservation_id: Uuid,
    pub professional_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfirmation {
    pub appointment_id: Uuid,
}

/// HTTP client for the scheduling endpoints. The server is the authority on
/// every mutation; this client only translates its answers.
pub struct SchedulingApiClient {
    client: Client,
    base_url: String,
    auth_token: String,
}

impl SchedulingApiClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.scheduling_api_url.clone(),
            auth_token: config.scheduling_auth_token.clone(),
        }
    }

    pub async fn get_availability(&self, scope: &Scope) -> Result<Vec<DayAvailability>, ApiError> {
        let id_param = match scope.kind {
            ScopeKind::Specialty => "specialty_id",
            ScopeKind::Professional => "professional_id",
        };
        let path = format!(
            "/scheduling/availability?{}={}&date_from={}&date_to={}",
            id_param, scope.id, scope.window.from, scope.window.to
        );

        let response = self.send(Method::GET, &path, None).await?;
        Ok(response.json().await?)
    }

    /// Bookable scope ids for the scope pickers, refetched when a push event
    /// reports a scope the local candidate list does not know about.
    pub async fn get_scopes(&self, kind: ScopeKind) -> Result<Vec<Uuid>, ApiError> {
        let path = format!("/scheduling/scopes?kind={}", kind.as_str());
        let response = self.send(Method::GET, &path, None).await?;
        Ok(response.json().await?)
    }

    /// Request a provisional hold. A 409 means another session holds the
    /// slot; no local state is created in that case.
    pub async fn create_reservation(
        &self,
        request: &CreateReservationRequest,
    ) -> Result<ReservationGrant, ApiError> {
        debug!(
            "Requesting hold on {} {} for professional {}",
            request.date, request.time, request.professional_id
        );

        let body = serde_json::to_value(request)
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let response = self
            .send(Method::POST, "/scheduling/reservations", Some(body))
            .await?;
        Ok(response.json().await?)
    }

    /// Delete a hold. Unknown and already-expired ids are a success: the
    /// server treats the delete as a no-op and so do we.
    pub async fn delete_reservation(&self, id: Uuid) -> Result<(), ApiError> {
        let path = format!("/scheduling/reservations/{}", id);
        let url = format!("{}{}", self.base_url, path);

        let response = self.request(Method::DELETE, &url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!("Reservation {} already gone on delete", id);
                Ok(())
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                warn!("Reservation delete failed ({}): {}", status, message);
                Err(ApiError::Status {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    pub async fn create_booking(
        &self,
        request: &BookingRequest,
    ) -> Result<BookingConfirmation, ApiError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let response = self
            .send(Method::POST, "/scheduling/bookings", Some(body))
            .await?;
        Ok(response.json().await?)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if !self.auth_token.is_empty() {
            builder = builder.bearer_auth(&self.auth_token);
        }
        builder
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut builder = self.request(method, &url);
        if let Some(body_data) = body {
            builder = builder.json(&body_data);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        error!("API error ({}): {}", status, message);

        Err(match status {
            StatusCode::CONFLICT => ApiError::Conflict,
            _ => ApiError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }
}
