use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use uuid::Uuid;

use push_channel_cell::ChannelError;
use shared_api::ApiError;

use crate::models::BookingStep;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: BookingStep, to: BookingStep },

    #[error("No scope selected")]
    NoActiveScope,

    #[error("No date selected")]
    NoSelectedDate,

    #[error("No slot selected")]
    NoSelectedSlot,

    #[error("Day {0} has no availability")]
    DayUnavailable(NaiveDate),

    #[error("No bookable slot at {0}")]
    UnknownSlot(NaiveTime),

    #[error("Professional {0} is not eligible for the reserved slot")]
    NotEligible(Uuid),

    #[error("Slot already held by another session")]
    SlotTaken,

    #[error("No active reservation to confirm")]
    NoActiveReservation,

    #[error("Push channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Scheduling API error: {0}")]
    Api(#[from] ApiError),
}
