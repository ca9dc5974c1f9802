use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Where the user stands in the booking flow. Forward progress is gated by
/// the owning session (a chosen scope, an available day, a granted hold);
/// backward moves are either user-driven or forced by push events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BookingStep {
    ScopeSelection,
    DateSelection,
    TimeSelection,
    ProfessionalSelection,
    Confirmation,
    Completed,
    Cancelled,
}

impl BookingStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStep::Completed | BookingStep::Cancelled)
    }

    /// True while the session may own a provisional hold. Leaving these
    /// steps backward must release it.
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            BookingStep::ProfessionalSelection | BookingStep::Confirmation
        )
    }

    pub fn can_transition_to(&self, target: &BookingStep) -> bool {
        use BookingStep::*;
        if self.is_terminal() {
            return false;
        }
        match (self, target) {
            (ScopeSelection, DateSelection) => true,
            (DateSelection, TimeSelection) => true,
            (TimeSelection, ProfessionalSelection | Confirmation) => true,
            (ProfessionalSelection, Confirmation) => true,
            (Confirmation, Completed) => true,
            // Backward moves. Confirmation steps back to TimeSelection, not
            // ProfessionalSelection: the hold is released on the way out, and
            // professional choice only exists while a slot is held.
            (DateSelection | TimeSelection | ProfessionalSelection | Confirmation, ScopeSelection) => {
                true
            }
            (TimeSelection | ProfessionalSelection | Confirmation, DateSelection) => true,
            (ProfessionalSelection | Confirmation, TimeSelection) => true,
            (_, Cancelled) => true,
            _ => false,
        }
    }
}

/// Out-of-band interruptions surfaced to the UI while the user is mid-flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FlowNotice {
    /// The slot the user picked was granted to another session first.
    SlotTaken,
    /// The local TTL on the hold ran out before confirmation.
    ReservationExpired,
    /// The selected scope lost all availability.
    ScopeUnavailable,
    /// A block now covers the selected date.
    DateBlocked { date: NaiveDate },
    ConnectionLost,
    ConnectionRestored,
}
