use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, warn};
use uuid::Uuid;

use reservation_cell::{HoldRegistry, HoldState};
use shared_models::PushEvent;

use crate::models::{AvailabilityView, SlotRemoval};

/// What the session layer must do after an event was reconciled. The
/// reconciler itself never performs I/O; every refetch or interruption is
/// reported here and executed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The view was updated in place.
    Applied,
    /// The event was irrelevant to the current projection or a self-echo.
    Ignored,
    /// A reserve RPC for the same slot is in flight; the event is parked in
    /// the hold registry until that call settles.
    Deferred,
    /// The delta could not be applied safely; refetch this date's slots.
    RefetchDay(NaiveDate),
    /// Blocks changed somewhere in the window; refetch the whole window.
    RefetchWindow,
    /// A scope outside the candidate list gained availability; refetch the
    /// candidate list.
    RefetchScopes,
    /// The currently selected scope lost all availability; the flow must
    /// interrupt and return to scope selection.
    ScopeLost,
    /// A block now covers the selected date; the flow must re-derive that
    /// date and step back if it is already past date selection.
    DateBlocked(NaiveDate),
}

/// Applies inbound push events to the availability view, one pure function
/// per event kind, with self-echo suppression against the hold registry.
pub struct EventReconciler {
    holds: Arc<HoldRegistry>,
}

impl EventReconciler {
    pub fn new(holds: Arc<HoldRegistry>) -> Self {
        Self { holds }
    }

    pub fn apply(&self, view: &mut AvailabilityView, event: PushEvent) -> ReconcileOutcome {
        // A "no longer available" event matching our own pending or
        // confirmed hold is not news about someone else.
        if event.announces_unavailability() {
            if let Some(key) = event.slot_key() {
                match self.holds.hold_state(&key) {
                    Some(HoldState::Held) => {
                        debug!(
                            "Suppressing self-echo for held slot {} {}",
                            key.date, key.time
                        );
                        return ReconcileOutcome::Ignored;
                    }
                    Some(HoldState::Pending) => {
                        if self.holds.defer(key, event.clone()) {
                            return ReconcileOutcome::Deferred;
                        }
                    }
                    None => {}
                }
            }
        }

        match event {
            PushEvent::SlotAvailabilityChanged {
                professional_id,
                date,
                time,
                available,
            }
            | PushEvent::SlotEligibilityChanged {
                professional_id,
                date,
                time,
                eligible: available,
            } => self.apply_slot_change(view, professional_id, date, time, available),
            PushEvent::DayCountDelta { date, slots_delta } => {
                self.apply_day_delta(view, date, slots_delta)
            }
            PushEvent::ScopeAvailabilityChanged {
                scope_id,
                has_availability,
            } => self.apply_scope_change(view, scope_id, has_availability),
            PushEvent::BlockRangeChanged {
                professional_id,
                date_from,
                date_to,
                is_blocked,
            } => self.apply_block_change(view, professional_id, date_from, date_to, is_blocked),
        }
    }

    fn apply_slot_change(
        &self,
        view: &mut AvailabilityView,
        professional_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        available: bool,
    ) -> ReconcileOutcome {
        if !view.in_window(date) {
            return ReconcileOutcome::Ignored;
        }

        if !available {
            // Slot detail is only modeled for the selected date; other days
            // are covered by their count deltas.
            return match view.remove_professional_from_slot(date, time, professional_id) {
                SlotRemoval::NotPresent => ReconcileOutcome::Ignored,
                SlotRemoval::Removed | SlotRemoval::SlotDeleted => ReconcileOutcome::Applied,
            };
        }

        if view.selected_date() != Some(date) {
            return ReconcileOutcome::Ignored;
        }

        if view.add_professional_to_slot(date, time, professional_id) {
            ReconcileOutcome::Applied
        } else {
            // Reappearance of an unmodeled slot can coincide with rule
            // changes a pure delta cannot express; ask for the truth.
            ReconcileOutcome::RefetchDay(date)
        }
    }

    fn apply_day_delta(
        &self,
        view: &mut AvailabilityView,
        date: NaiveDate,
        delta: i32,
    ) -> ReconcileOutcome {
        if !view.in_window(date) {
            return ReconcileOutcome::Ignored;
        }

        match view.day_mut(date) {
            Some(day) => {
                if day.apply_delta(delta) {
                    ReconcileOutcome::Applied
                } else {
                    warn!(
                        "Day count delta {} for {} underflowed, refetching",
                        delta, date
                    );
                    ReconcileOutcome::RefetchDay(date)
                }
            }
            None => ReconcileOutcome::RefetchDay(date),
        }
    }

    fn apply_scope_change(
        &self,
        view: &mut AvailabilityView,
        scope_id: Uuid,
        has_availability: bool,
    ) -> ReconcileOutcome {
        if !has_availability {
            let selected = view.scope().is_some_and(|scope| scope.id == scope_id);
            view.remove_candidate(&scope_id);
            if selected {
                return ReconcileOutcome::ScopeLost;
            }
            return ReconcileOutcome::Applied;
        }

        if view.has_candidate(&scope_id) {
            ReconcileOutcome::Ignored
        } else {
            ReconcileOutcome::RefetchScopes
        }
    }

    fn apply_block_change(
        &self,
        view: &mut AvailabilityView,
        _professional_id: Uuid,
        date_from: NaiveDate,
        date_to: NaiveDate,
        _is_blocked: bool,
    ) -> ReconcileOutcome {
        let Some(scope) = view.scope() else {
            return ReconcileOutcome::Ignored;
        };
        if date_to < scope.window.from || date_from > scope.window.to {
            return ReconcileOutcome::Ignored;
        }

        // Blocks (and lifted blocks) change slot derivation rules; deltas
        // cannot express them, so the affected range is refetched.
        if let Some(selected) = view.selected_date() {
            if selected >= date_from && selected <= date_to {
                return ReconcileOutcome::DateBlocked(selected);
            }
        }
        ReconcileOutcome::RefetchWindow
    }
}
