use std::collections::{BTreeMap, HashSet};

use chrono::{Days, NaiveDate, NaiveTime};
use uuid::Uuid;

use shared_api::{DayAvailability, SlotEntry};
use shared_models::{CalendarDay, Scope, Slot};

/// What happened when a professional was removed from a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRemoval {
    NotPresent,
    Removed,
    /// The eligible set became empty, so the slot itself was deleted.
    SlotDeleted,
}

/// Local projection of bookable slots for the active scope: one calendar
/// day per date in the window, plus the detailed slot list for the
/// currently selected date. Fetches are authoritative; push events apply
/// deltas between them.
#[derive(Debug, Default)]
pub struct AvailabilityView {
    scope: Option<Scope>,
    days: BTreeMap<NaiveDate, CalendarDay>,
    selected_date: Option<NaiveDate>,
    slots: BTreeMap<NaiveTime, Slot>,
    candidate_scopes: HashSet<Uuid>,
}

impl AvailabilityView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn selected_date(&self) -> Option<NaiveDate> {
        self.selected_date
    }

    /// Replace the active scope. Everything displayed belongs to the scope,
    /// so the projection resets with it.
    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = Some(scope);
        self.days.clear();
        self.slots.clear();
        self.selected_date = None;
    }

    pub fn clear_scope(&mut self) {
        self.scope = None;
        self.days.clear();
        self.slots.clear();
        self.selected_date = None;
    }

    pub fn in_window(&self, date: NaiveDate) -> bool {
        self.scope
            .as_ref()
            .is_some_and(|scope| scope.window.contains(date))
    }

    /// Load a fetched window of days. Dates the server did not mention are
    /// kept visible with a zero count so the calendar stays dense.
    pub fn load_days(&mut self, fetched: &[DayAvailability]) {
        let Some(scope) = self.scope.as_ref() else {
            return;
        };

        self.days.clear();
        let mut date = scope.window.from;
        while date <= scope.window.to {
            self.days.insert(date, CalendarDay::new(date, 0));
            match date.checked_add_days(Days::new(1)) {
                Some(next) => date = next,
                None => break,
            }
        }

        for day in fetched {
            if !self.in_window(day.date) {
                continue;
            }
            let count = distinct_available_times(&day.slots);
            self.days.insert(day.date, CalendarDay::new(day.date, count));
        }

        if let Some(selected) = self.selected_date {
            if !self.days.contains_key(&selected) {
                self.selected_date = None;
                self.slots.clear();
            }
        }
    }

    pub fn select_date(&mut self, date: NaiveDate) {
        self.selected_date = Some(date);
        self.slots.clear();
    }

    pub fn clear_selected_date(&mut self) {
        self.selected_date = None;
        self.slots.clear();
    }

    /// Load the detailed slot list for the selected date from a fetch. The
    /// day's count is realigned to the authoritative answer.
    pub fn load_slots(&mut self, date: NaiveDate, entries: &[SlotEntry]) {
        if self.selected_date != Some(date) {
            return;
        }

        self.slots.clear();
        for entry in entries {
            if !entry.is_available {
                continue;
            }
            let slot = self
                .slots
                .entry(entry.time)
                .or_insert_with(|| Slot::new(entry.time));
            slot.eligible_professionals.insert(entry.professional_id);
        }

        let count = self.slots.len() as u32;
        self.days.insert(date, CalendarDay::new(date, count));
    }

    /// Realign one day from an authoritative single-day fetch: the day's
    /// count always, and the detailed slot list too when the day is the
    /// selected one.
    pub fn load_day(&mut self, day: &DayAvailability) {
        if !self.in_window(day.date) {
            return;
        }
        if self.selected_date == Some(day.date) {
            self.load_slots(day.date, &day.slots);
        } else {
            let count = distinct_available_times(&day.slots);
            self.days.insert(day.date, CalendarDay::new(day.date, count));
        }
    }

    pub fn days(&self) -> Vec<CalendarDay> {
        self.days.values().cloned().collect()
    }

    pub fn day(&self, date: NaiveDate) -> Option<&CalendarDay> {
        self.days.get(&date)
    }

    pub fn day_mut(&mut self, date: NaiveDate) -> Option<&mut CalendarDay> {
        self.days.get_mut(&date)
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.slots.values().cloned().collect()
    }

    pub fn slot_at(&self, time: NaiveTime) -> Option<&Slot> {
        self.slots.get(&time)
    }

    pub fn remove_professional_from_slot(
        &mut self,
        date: NaiveDate,
        time: NaiveTime,
        professional_id: Uuid,
    ) -> SlotRemoval {
        if self.selected_date != Some(date) {
            return SlotRemoval::NotPresent;
        }
        let Some(slot) = self.slots.get_mut(&time) else {
            return SlotRemoval::NotPresent;
        };
        if !slot.eligible_professionals.remove(&professional_id) {
            return SlotRemoval::NotPresent;
        }
        if slot.eligible_professionals.is_empty() {
            self.slots.remove(&time);
            if let Some(day) = self.days.get_mut(&date) {
                day.apply_delta(-1);
            }
            return SlotRemoval::SlotDeleted;
        }
        SlotRemoval::Removed
    }

    /// Add a professional to an already-modeled slot. Returns false when the
    /// slot is absent or empty; the caller falls back to a refetch, since a
    /// reappearing slot may carry rule changes a delta cannot express.
    pub fn add_professional_to_slot(
        &mut self,
        date: NaiveDate,
        time: NaiveTime,
        professional_id: Uuid,
    ) -> bool {
        if self.selected_date != Some(date) {
            return false;
        }
        match self.slots.get_mut(&time) {
            Some(slot) if !slot.eligible_professionals.is_empty() => {
                slot.eligible_professionals.insert(professional_id);
                true
            }
            _ => false,
        }
    }

    pub fn set_candidates(&mut self, candidates: impl IntoIterator<Item = Uuid>) {
        self.candidate_scopes = candidates.into_iter().collect();
    }

    pub fn candidates(&self) -> &HashSet<Uuid> {
        &self.candidate_scopes
    }

    pub fn has_candidate(&self, scope_id: &Uuid) -> bool {
        self.candidate_scopes.contains(scope_id)
    }

    pub fn remove_candidate(&mut self, scope_id: &Uuid) -> bool {
        self.candidate_scopes.remove(scope_id)
    }
}

fn distinct_available_times(entries: &[SlotEntry]) -> u32 {
    let times: HashSet<NaiveTime> = entries
        .iter()
        .filter(|entry| entry.is_available)
        .map(|entry| entry.time)
        .collect();
    times.len() as u32
}
