use thiserror::Error;

use shared_api::ApiError;

#[derive(Error, Debug)]
pub enum ReservationError {
    #[error("Slot already held by another session")]
    Conflict,

    #[error("Reservation attempt superseded by a newer selection")]
    Superseded,

    #[error("Reservation service error: {0}")]
    Api(ApiError),
}

impl From<ApiError> for ReservationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Conflict => ReservationError::Conflict,
            other => ReservationError::Api(other),
        }
    }
}
