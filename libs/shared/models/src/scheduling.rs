use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of entity the user is browsing availability for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Specialty,
    Professional,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Specialty => "specialty",
            ScopeKind::Professional => "professional",
        }
    }
}

/// Inclusive date range shown on the calendar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

/// The currently displayed scope. Exactly one is active at a time, and the
/// joined push groups must always equal the groups this scope implies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: Uuid,
    pub window: DateWindow,
}

impl Scope {
    /// Push group key the server uses to route events for this scope.
    pub fn group_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.id)
    }
}

/// One calendar day in the active window. `available` is derived state and
/// must always equal `slot_count > 0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub slot_count: u32,
    pub available: bool,
}

impl CalendarDay {
    pub fn new(date: NaiveDate, slot_count: u32) -> Self {
        Self {
            date,
            slot_count,
            available: slot_count > 0,
        }
    }

    /// Apply an advisory delta, clamping at zero. Returns false when the
    /// delta would have driven the count negative, which callers treat as a
    /// signal that the local count has drifted from the server.
    pub fn apply_delta(&mut self, delta: i32) -> bool {
        let clean = if delta.is_negative() {
            let magnitude = delta.unsigned_abs();
            let clean = magnitude <= self.slot_count;
            self.slot_count = self.slot_count.saturating_sub(magnitude);
            clean
        } else {
            self.slot_count = self.slot_count.saturating_add(delta as u32);
            true
        };
        self.available = self.slot_count > 0;
        clean
    }
}

/// A bookable time within a day. A slot with no eligible professionals does
/// not exist: the owning view removes it instead of keeping it empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub time: NaiveTime,
    pub eligible_professionals: BTreeSet<Uuid>,
}

impl Slot {
    pub fn new(time: NaiveTime) -> Self {
        Self {
            time,
            eligible_professionals: BTreeSet::new(),
        }
    }

    /// The professional a provisional hold pins when the user has not picked
    /// one yet: lowest id, so the choice is deterministic.
    pub fn tentative_professional(&self) -> Option<Uuid> {
        self.eligible_professionals.iter().next().copied()
    }
}

/// Identity of a slot+professional pair, used by the pending-operation
/// registry and self-echo checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub professional_id: Uuid,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// A provisional, time-bounded hold on one slot+professional pair. At most
/// one is owned by a client session at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub professional_id: Uuid,
    pub specialty_id: Option<Uuid>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            professional_id: self.professional_id,
            date: self.date,
            time: self.time,
        }
    }

    /// Remaining lifetime derived from the authoritative expiry timestamp.
    /// Never maintained as an independent counter.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u32 {
        (self.expires_at - now).num_seconds().max(0) as u32
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(count: u32) -> CalendarDay {
        CalendarDay::new(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(), count)
    }

    #[test]
    fn test_availability_tracks_slot_count() {
        let mut d = day(2);
        assert!(d.available);

        assert!(d.apply_delta(-2));
        assert_eq!(d.slot_count, 0);
        assert!(!d.available);

        assert!(d.apply_delta(1));
        assert!(d.available);
    }

    #[test]
    fn test_delta_clamps_at_zero() {
        let mut d = day(1);
        assert!(!d.apply_delta(-5));
        assert_eq!(d.slot_count, 0);
        assert!(!d.available);
    }

    #[test]
    fn test_tentative_professional_is_lowest_id() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut slot = Slot::new(NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        slot.eligible_professionals.insert(b);
        slot.eligible_professionals.insert(a);
        assert_eq!(slot.tentative_professional(), Some(a));
    }

    #[test]
    fn test_remaining_seconds_never_negative() {
        let now = Utc::now();
        let reservation = Reservation {
            id: Uuid::new_v4(),
            professional_id: Uuid::new_v4(),
            specialty_id: None,
            date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            expires_at: now - chrono::Duration::seconds(10),
        };
        assert_eq!(reservation.remaining_seconds(now), 0);
        assert!(reservation.is_expired(now));
    }
}
