use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduling::SlotKey;

/// Server-to-client push events, deserialized from the wire envelope. The
/// variant tags match the server's frame names; the reconciler consumes each
/// event exactly once, in the order the channel delivered them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PushEvent {
    #[serde(rename = "SlotUpdated")]
    SlotAvailabilityChanged {
        professional_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        available: bool,
    },

    #[serde(rename = "DayUpdated")]
    DayCountDelta {
        date: NaiveDate,
        slots_delta: i32,
    },

    #[serde(rename = "ScopeAvailabilityUpdated")]
    ScopeAvailabilityChanged {
        scope_id: Uuid,
        has_availability: bool,
    },

    #[serde(rename = "SlotEligibilityUpdated")]
    SlotEligibilityChanged {
        professional_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        eligible: bool,
    },

    #[serde(rename = "BlockRangeChanged")]
    BlockRangeChanged {
        professional_id: Uuid,
        date_from: NaiveDate,
        date_to: NaiveDate,
        is_blocked: bool,
    },
}

impl PushEvent {
    /// The slot+professional identity this event refers to, when it targets
    /// a single slot. Used for self-echo checks against the hold registry.
    pub fn slot_key(&self) -> Option<SlotKey> {
        match self {
            PushEvent::SlotAvailabilityChanged {
                professional_id,
                date,
                time,
                ..
            }
            | PushEvent::SlotEligibilityChanged {
                professional_id,
                date,
                time,
                ..
            } => Some(SlotKey {
                professional_id: *professional_id,
                date: *date,
                time: *time,
            }),
            _ => None,
        }
    }

    /// True when the event reports a slot+professional pair as no longer
    /// bookable - the variants subject to self-echo suppression.
    pub fn announces_unavailability(&self) -> bool {
        matches!(
            self,
            PushEvent::SlotAvailabilityChanged { available: false, .. }
                | PushEvent::SlotEligibilityChanged { eligible: false, .. }
        )
    }
}

/// Client-to-server messages maintaining group membership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    JoinScopeGroup { group: String },
    LeaveScopeGroup { group: String },
}
