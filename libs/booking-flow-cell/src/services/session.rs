use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use availability_cell::{AvailabilityView, EventReconciler, ReconcileOutcome};
use push_channel_cell::{ChannelState, PushTransport, SubscriptionChannel, WebSocketTransport};
use reservation_cell::{HoldRegistry, ReservationCoordinator, ReservationError};
use shared_api::{BookingConfirmation, BookingRequest, SchedulingApiClient};
use shared_config::AppConfig;
use shared_models::{
    CalendarDay, DateWindow, PushEvent, Reservation, Scope, ScopeKind, Slot, SlotKey,
};

use crate::error::FlowError;
use crate::models::{BookingStep, FlowNotice};

#[derive(Default)]
struct Selection {
    time: Option<NaiveTime>,
    professional: Option<Uuid>,
    candidate_kind: Option<ScopeKind>,
}

struct SessionInner {
    api: Arc<SchedulingApiClient>,
    channel: SubscriptionChannel,
    coordinator: ReservationCoordinator,
    reconciler: EventReconciler,
    view: RwLock<AvailabilityView>,
    selection: RwLock<Selection>,
    /// Bumped whenever the active scope changes or the flow resets; fetches
    /// carry the value they were issued under and responses arriving after
    /// it moved on are discarded.
    generation: AtomicU64,
    /// Flicker guard around the final booking call: while set, inbound push
    /// events are dropped instead of applied.
    suppress_events: AtomicBool,
    suppressed_dirty: AtomicBool,
    step_tx: watch::Sender<BookingStep>,
    days_tx: watch::Sender<Vec<CalendarDay>>,
    slots_tx: watch::Sender<Vec<Slot>>,
    notice_tx: broadcast::Sender<FlowNotice>,
}

impl SessionInner {
    fn current_step(&self) -> BookingStep {
        *self.step_tx.borrow()
    }

    fn set_step(&self, target: BookingStep) {
        // send_replace keeps the stored step current even when nobody is
        // subscribed at that moment.
        self.step_tx.send_replace(target);
    }

    /// Move to `target` when the step machine permits it; interleaved
    /// interruptions may already have moved the flow elsewhere, in which
    /// case the move is dropped.
    fn force_step(&self, target: BookingStep) {
        let current = self.current_step();
        if current != target && current.can_transition_to(&target) {
            self.set_step(target);
        }
    }

    fn transition(&self, target: BookingStep) -> Result<(), FlowError> {
        let current = self.current_step();
        if !current.can_transition_to(&target) {
            return Err(FlowError::InvalidTransition {
                from: current,
                to: target,
            });
        }
        self.set_step(target);
        Ok(())
    }

    fn notify(&self, notice: FlowNotice) {
        let _ = self.notice_tx.send(notice);
    }

    async fn publish_view(&self) {
        let view = self.view.read().await;
        self.days_tx.send_replace(view.days());
        self.slots_tx.send_replace(view.slots());
    }

    async fn active_scope(&self) -> Option<Scope> {
        self.view.read().await.scope().cloned()
    }

    async fn clear_selection(&self) {
        let mut selection = self.selection.write().await;
        selection.time = None;
        selection.professional = None;
    }

    /// Refetch the whole active window, including the selected day's slots
    /// when one is selected.
    async fn refetch_window(&self) -> Result<(), FlowError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(scope) = self.active_scope().await else {
            return Ok(());
        };

        let fetched = self.api.get_availability(&scope).await?;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding stale window fetch for {}", scope.group_key());
            return Ok(());
        }

        {
            let mut view = self.view.write().await;
            view.load_days(&fetched);
            if let Some(selected) = view.selected_date() {
                let empty = Vec::new();
                let entries = fetched
                    .iter()
                    .find(|day| day.date == selected)
                    .map(|day| day.slots.as_slice())
                    .unwrap_or(&empty);
                view.load_slots(selected, entries);
            }
        }
        self.publish_view().await;
        Ok(())
    }

    /// Refetch a single day and realign the local projection with the
    /// authoritative answer.
    async fn refetch_day(&self, date: NaiveDate) -> Result<(), FlowError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(mut scope) = self.active_scope().await else {
            return Ok(());
        };
        scope.window = DateWindow {
            from: date,
            to: date,
        };

        let fetched = self.api.get_availability(&scope).await?;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding stale day fetch for {}", date);
            return Ok(());
        }

        {
            let mut view = self.view.write().await;
            match fetched.iter().find(|day| day.date == date) {
                Some(day) => view.load_day(day),
                // The server reports nothing for the day: it is empty now.
                None => view.load_day(&shared_api::DayAvailability {
                    date,
                    slots: Vec::new(),
                }),
            }
        }
        self.publish_view().await;
        Ok(())
    }

    async fn refetch_candidates(&self) -> Result<(), FlowError> {
        let Some(kind) = self.selection.read().await.candidate_kind else {
            return Ok(());
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let scopes = self.api.get_scopes(kind).await?;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(());
        }
        self.view.write().await.set_candidates(scopes);
        Ok(())
    }

    /// The selected scope lost all availability: interrupt whatever the user
    /// was doing and return them to scope selection.
    async fn interrupt_scope_lost(&self) {
        info!("Selected scope lost all availability, interrupting the flow");
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.coordinator.release().await;
        if let Some(scope) = self.active_scope().await {
            self.channel.leave_group(&scope.group_key()).await;
        }
        self.view.write().await.clear_scope();
        self.clear_selection().await;
        self.publish_view().await;
        self.force_step(BookingStep::ScopeSelection);
        self.notify(FlowNotice::ScopeUnavailable);
    }

    /// A block now covers the selected date. Past date selection the flow
    /// steps back with a notice; either way the day is re-derived from a
    /// fetch.
    async fn interrupt_date_blocked(&self, date: NaiveDate) {
        let step = self.current_step();
        if matches!(
            step,
            BookingStep::TimeSelection
                | BookingStep::ProfessionalSelection
                | BookingStep::Confirmation
        ) {
            self.coordinator.release().await;
            self.clear_selection().await;
            self.view.write().await.clear_selected_date();
            self.force_step(BookingStep::DateSelection);
            self.notify(FlowNotice::DateBlocked { date });
        }
        if let Err(e) = self.refetch_day(date).await {
            warn!("Day refetch after block change failed: {}", e);
        }
    }

    /// The local TTL ran out before the hold was promoted or released. The
    /// coordinator has already dropped the hold; the flow returns to slot
    /// picking over a fresh list.
    async fn handle_expiry(&self) {
        if self.suppress_events.load(Ordering::SeqCst) {
            // The booking call is in flight; the server decides the outcome.
            return;
        }
        if !self.current_step().holds_reservation() {
            return;
        }

        self.clear_selection().await;
        self.force_step(BookingStep::TimeSelection);
        self.notify(FlowNotice::ReservationExpired);

        let selected = self.view.read().await.selected_date();
        if let Some(date) = selected {
            if let Err(e) = self.refetch_day(date).await {
                warn!("Slot refetch after expiry failed: {}", e);
            }
        }
    }
}

/// Assembles the scheduling cells into one booking session: the push
/// channel feeds an ordered event queue, the reconciler folds events into
/// the availability view, and the coordinator guards the single provisional
/// hold while the user walks the steps.
pub struct BookingSession {
    inner: Arc<SessionInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl BookingSession {
    /// Production wiring: WebSocket push transport against the configured
    /// endpoints.
    pub fn new(config: &AppConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    /// Same wiring with the push transport substituted, the seam tests use.
    pub fn with_transport(config: &AppConfig, transport: Arc<dyn PushTransport>) -> Self {
        let api = Arc::new(SchedulingApiClient::new(config));
        let (channel, channel_rx) =
            SubscriptionChannel::new(transport, config.scheduling_push_url.as_str());

        // Channel frames and replayed deferred events share one ordered
        // queue with a single consumer, so application order is the
        // delivery order.
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let holds = Arc::new(HoldRegistry::new());
        let coordinator =
            ReservationCoordinator::new(Arc::clone(&api), Arc::clone(&holds), queue_tx.clone());
        let reconciler = EventReconciler::new(holds);

        let (step_tx, _) = watch::channel(BookingStep::ScopeSelection);
        let (days_tx, _) = watch::channel(Vec::new());
        let (slots_tx, _) = watch::channel(Vec::new());
        let (notice_tx, _) = broadcast::channel(32);

        let inner = Arc::new(SessionInner {
            api,
            channel,
            coordinator,
            reconciler,
            view: RwLock::new(AvailabilityView::new()),
            selection: RwLock::new(Selection::default()),
            generation: AtomicU64::new(0),
            suppress_events: AtomicBool::new(false),
            suppressed_dirty: AtomicBool::new(false),
            step_tx,
            days_tx,
            slots_tx,
            notice_tx,
        });

        let tasks = vec![
            tokio::spawn(forward_events(channel_rx, queue_tx)),
            tokio::spawn(run_pump(Arc::clone(&inner), queue_rx)),
            tokio::spawn(run_expiry(
                Arc::clone(&inner),
                inner.coordinator.subscribe_expiry(),
            )),
            tokio::spawn(run_connection_watch(
                Arc::clone(&inner),
                inner.channel.state(),
            )),
        ];

        Self { inner, tasks }
    }

    /// Bring the push channel up. Resolves once connected; reconnects after
    /// that are automatic.
    pub async fn connect(&self) -> Result<(), FlowError> {
        self.inner.channel.connect().await.map_err(FlowError::from)
    }

    /// Fetch the bookable scope ids backing the scope picker.
    pub async fn load_candidates(&self, kind: ScopeKind) -> Result<Vec<Uuid>, FlowError> {
        let scopes = self.inner.api.get_scopes(kind).await?;
        self.inner.selection.write().await.candidate_kind = Some(kind);
        self.inner
            .view
            .write()
            .await
            .set_candidates(scopes.iter().copied());
        Ok(scopes)
    }

    /// Activate a scope: swap push groups, fetch its window and move to
    /// date selection. Re-selecting mid-flow restarts the flow, releasing
    /// any hold.
    pub async fn select_scope(&self, scope: Scope) -> Result<(), FlowError> {
        let inner = &self.inner;
        let current = inner.current_step();
        if current.is_terminal() {
            return Err(FlowError::InvalidTransition {
                from: current,
                to: BookingStep::DateSelection,
            });
        }

        inner.coordinator.release().await;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = inner.active_scope().await {
            if previous.group_key() != scope.group_key() {
                inner.channel.leave_group(&previous.group_key()).await;
            }
        }
        inner.channel.join_group(&scope.group_key()).await;
        inner.view.write().await.set_scope(scope.clone());
        inner.clear_selection().await;

        let fetched = inner.api.get_availability(&scope).await?;
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding stale scope fetch for {}", scope.group_key());
            return Ok(());
        }

        inner.view.write().await.load_days(&fetched);
        inner.publish_view().await;
        inner.force_step(BookingStep::DateSelection);
        Ok(())
    }

    /// Pick a day with availability and fetch its slots.
    pub async fn select_date(&self, date: NaiveDate) -> Result<(), FlowError> {
        let inner = &self.inner;
        let current = inner.current_step();
        if current != BookingStep::DateSelection {
            return Err(FlowError::InvalidTransition {
                from: current,
                to: BookingStep::TimeSelection,
            });
        }

        {
            let view = inner.view.read().await;
            match view.day(date) {
                Some(day) if day.available => {}
                _ => return Err(FlowError::DayUnavailable(date)),
            }
        }

        let generation = inner.generation.load(Ordering::SeqCst);
        let Some(mut scope) = inner.active_scope().await else {
            return Err(FlowError::NoActiveScope);
        };
        scope.window = DateWindow {
            from: date,
            to: date,
        };

        let fetched = inner.api.get_availability(&scope).await?;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return Ok(());
        }

        {
            let mut view = inner.view.write().await;
            view.select_date(date);
            let empty = Vec::new();
            let entries = fetched
                .iter()
                .find(|day| day.date == date)
                .map(|day| day.slots.as_slice())
                .unwrap_or(&empty);
            view.load_slots(date, entries);
        }
        inner.publish_view().await;
        inner.transition(BookingStep::TimeSelection)
    }

    /// Pick a slot and request the provisional hold on it. One eligible
    /// professional goes straight to confirmation; several go through
    /// professional selection. A conflict keeps the user here over a
    /// refreshed slot list.
    pub async fn select_slot(&self, time: NaiveTime) -> Result<(), FlowError> {
        let inner = &self.inner;
        let current = inner.current_step();
        if current != BookingStep::TimeSelection {
            return Err(FlowError::InvalidTransition {
                from: current,
                to: BookingStep::Confirmation,
            });
        }

        let (scope, date, slot) = {
            let view = inner.view.read().await;
            let scope = view.scope().cloned().ok_or(FlowError::NoActiveScope)?;
            let date = view.selected_date().ok_or(FlowError::NoSelectedDate)?;
            let slot = view
                .slot_at(time)
                .cloned()
                .ok_or(FlowError::UnknownSlot(time))?;
            (scope, date, slot)
        };
        let professional = slot
            .tentative_professional()
            .ok_or(FlowError::UnknownSlot(time))?;
        let key = SlotKey {
            professional_id: professional,
            date,
            time,
        };
        let specialty_id = match scope.kind {
            ScopeKind::Specialty => Some(scope.id),
            ScopeKind::Professional => None,
        };

        match inner.coordinator.reserve(key, specialty_id).await {
            Ok(_reservation) => {
                {
                    let mut selection = inner.selection.write().await;
                    selection.time = Some(time);
                    selection.professional = None;
                }
                let target = if slot.eligible_professionals.len() > 1 {
                    BookingStep::ProfessionalSelection
                } else {
                    BookingStep::Confirmation
                };
                inner.transition(target)
            }
            Err(ReservationError::Conflict) => {
                inner.notify(FlowNotice::SlotTaken);
                if let Err(e) = inner.refetch_day(date).await {
                    warn!("Slot refetch after conflict failed: {}", e);
                }
                Err(FlowError::SlotTaken)
            }
            // A newer attempt is already driving the UI; this one is moot.
            Err(ReservationError::Superseded) => Ok(()),
            Err(ReservationError::Api(e)) => Err(FlowError::Api(e)),
        }
    }

    /// Finalize the professional choice from the reserved slot's eligible
    /// set. The hold is not re-issued.
    pub async fn select_professional(&self, professional_id: Uuid) -> Result<(), FlowError> {
        let inner = &self.inner;
        let current = inner.current_step();
        if current != BookingStep::ProfessionalSelection {
            return Err(FlowError::InvalidTransition {
                from: current,
                to: BookingStep::Confirmation,
            });
        }

        let time = inner
            .selection
            .read()
            .await
            .time
            .ok_or(FlowError::NoSelectedSlot)?;
        let eligible = {
            let view = inner.view.read().await;
            view.slot_at(time)
                .is_some_and(|slot| slot.eligible_professionals.contains(&professional_id))
        };
        if !eligible {
            return Err(FlowError::NotEligible(professional_id));
        }

        inner.selection.write().await.professional = Some(professional_id);
        inner.transition(BookingStep::Confirmation)
    }

    /// Promote the hold into a confirmed booking. While the call is in
    /// flight push events are suppressed; a failure repairs anything that
    /// was dropped with a full refetch and leaves the user here to retry.
    pub async fn confirm(&self) -> Result<BookingConfirmation, FlowError> {
        let inner = &self.inner;
        let current = inner.current_step();
        if current != BookingStep::Confirmation {
            return Err(FlowError::InvalidTransition {
                from: current,
                to: BookingStep::Completed,
            });
        }
        let reservation = inner
            .coordinator
            .active()
            .await
            .ok_or(FlowError::NoActiveReservation)?;
        let professional_id = inner
            .selection
            .read()
            .await
            .professional
            .unwrap_or(reservation.professional_id);

        inner.suppress_events.store(true, Ordering::SeqCst);
        inner.suppressed_dirty.store(false, Ordering::SeqCst);
        let result = inner
            .api
            .create_booking(&BookingRequest {
                reservation_id: reservation.id,
                professional_id,
            })
            .await;
        inner.suppress_events.store(false, Ordering::SeqCst);

        match result {
            Ok(confirmation) => {
                inner.coordinator.complete().await;
                inner.transition(BookingStep::Completed)?;
                info!("Booking {} confirmed", confirmation.appointment_id);
                Ok(confirmation)
            }
            Err(e) => {
                if inner.suppressed_dirty.swap(false, Ordering::SeqCst) {
                    if let Err(refetch) = inner.refetch_window().await {
                        warn!("Repair refetch after failed booking failed: {}", refetch);
                    }
                }
                Err(FlowError::Api(e))
            }
        }
    }

    /// One step backward. Leaving the reserved region releases the hold and
    /// lands on slot picking over a refreshed list.
    pub async fn go_back(&self) -> Result<BookingStep, FlowError> {
        let inner = &self.inner;
        let current = inner.current_step();
        let target = match current {
            BookingStep::DateSelection => BookingStep::ScopeSelection,
            BookingStep::TimeSelection => BookingStep::DateSelection,
            BookingStep::ProfessionalSelection | BookingStep::Confirmation => {
                BookingStep::TimeSelection
            }
            other => {
                return Err(FlowError::InvalidTransition {
                    from: other,
                    to: other,
                })
            }
        };

        if current.holds_reservation() {
            inner.coordinator.release().await;
        }
        inner.clear_selection().await;

        match target {
            BookingStep::ScopeSelection => {
                inner.generation.fetch_add(1, Ordering::SeqCst);
                if let Some(scope) = inner.active_scope().await {
                    inner.channel.leave_group(&scope.group_key()).await;
                }
                inner.view.write().await.clear_scope();
                inner.publish_view().await;
            }
            BookingStep::DateSelection => {
                inner.view.write().await.clear_selected_date();
                inner.publish_view().await;
            }
            BookingStep::TimeSelection => {
                // The released slot may already be gone to someone else.
                let selected = inner.view.read().await.selected_date();
                if let Some(date) = selected {
                    if let Err(e) = inner.refetch_day(date).await {
                        warn!("Slot refetch after step back failed: {}", e);
                    }
                }
            }
            _ => {}
        }

        inner.force_step(target);
        Ok(target)
    }

    /// Tear the session down: best-effort release of any hold, push channel
    /// shutdown, flow cancelled unless already completed.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.coordinator.release().await;
        inner.channel.shutdown().await;
        if !inner.current_step().is_terminal() {
            inner.set_step(BookingStep::Cancelled);
        }
    }

    pub fn current_step(&self) -> BookingStep {
        self.inner.current_step()
    }

    pub fn step(&self) -> watch::Receiver<BookingStep> {
        self.inner.step_tx.subscribe()
    }

    pub fn days(&self) -> watch::Receiver<Vec<CalendarDay>> {
        self.inner.days_tx.subscribe()
    }

    pub fn slots(&self) -> watch::Receiver<Vec<Slot>> {
        self.inner.slots_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<FlowNotice> {
        self.inner.notice_tx.subscribe()
    }

    pub fn remaining_seconds(&self) -> watch::Receiver<u32> {
        self.inner.coordinator.remaining_seconds()
    }

    pub fn connection(&self) -> watch::Receiver<ChannelState> {
        self.inner.channel.state()
    }

    pub async fn candidates(&self) -> Vec<Uuid> {
        self.inner
            .view
            .read()
            .await
            .candidates()
            .iter()
            .copied()
            .collect()
    }

    pub async fn active_reservation(&self) -> Option<Reservation> {
        self.inner.coordinator.active().await
    }
}

impl Drop for BookingSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        // Abandoning the session mid-hold still sends the best-effort
        // release; the hold dies by TTL if this never lands.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let coordinator = self.inner.coordinator.clone();
            let channel = self.inner.channel.clone();
            handle.spawn(async move {
                coordinator.release().await;
                channel.shutdown().await;
            });
        }
    }
}

async fn forward_events(
    mut channel_rx: mpsc::UnboundedReceiver<PushEvent>,
    queue_tx: mpsc::UnboundedSender<PushEvent>,
) {
    while let Some(event) = channel_rx.recv().await {
        if queue_tx.send(event).is_err() {
            return;
        }
    }
}

/// The single consumer of the ordered event queue: every inbound event goes
/// through the reconciler exactly once, and whatever follow-up it demands
/// (refetches, interruptions) runs here before the next event is taken.
async fn run_pump(inner: Arc<SessionInner>, mut queue_rx: mpsc::UnboundedReceiver<PushEvent>) {
    while let Some(event) = queue_rx.recv().await {
        if inner.suppress_events.load(Ordering::SeqCst) {
            inner.suppressed_dirty.store(true, Ordering::SeqCst);
            continue;
        }

        let outcome = {
            let mut view = inner.view.write().await;
            inner.reconciler.apply(&mut view, event)
        };

        match outcome {
            ReconcileOutcome::Applied => inner.publish_view().await,
            ReconcileOutcome::Ignored | ReconcileOutcome::Deferred => {}
            ReconcileOutcome::RefetchDay(date) => {
                if let Err(e) = inner.refetch_day(date).await {
                    warn!("Day refetch for {} failed: {}", date, e);
                }
            }
            ReconcileOutcome::RefetchWindow => {
                if let Err(e) = inner.refetch_window().await {
                    warn!("Window refetch failed: {}", e);
                }
            }
            ReconcileOutcome::RefetchScopes => {
                if let Err(e) = inner.refetch_candidates().await {
                    warn!("Candidate refetch failed: {}", e);
                }
            }
            ReconcileOutcome::ScopeLost => inner.interrupt_scope_lost().await,
            ReconcileOutcome::DateBlocked(date) => inner.interrupt_date_blocked(date).await,
        }
    }
}

async fn run_expiry(inner: Arc<SessionInner>, mut expiry_rx: broadcast::Receiver<Uuid>) {
    loop {
        match expiry_rx.recv().await {
            Ok(_id) => inner.handle_expiry().await,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn run_connection_watch(
    inner: Arc<SessionInner>,
    mut state_rx: watch::Receiver<ChannelState>,
) {
    let mut was_connected = state_rx.borrow().is_connected();
    let mut ever_connected = was_connected;

    while state_rx.changed().await.is_ok() {
        let connected = state_rx.borrow().is_connected();
        if connected == was_connected {
            continue;
        }
        was_connected = connected;

        if connected {
            if ever_connected {
                inner.notify(FlowNotice::ConnectionRestored);
                // Events sent while disconnected are gone; the fetch is the
                // only way back to the authoritative state.
                if let Err(e) = inner.refetch_window().await {
                    warn!("Refetch after reconnect failed: {}", e);
                }
            }
            ever_connected = true;
        } else {
            inner.notify(FlowNotice::ConnectionLost);
        }
    }
}
