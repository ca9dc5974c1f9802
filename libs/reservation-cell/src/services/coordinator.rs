use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_api::{CreateReservationRequest, SchedulingApiClient};
use shared_models::{PushEvent, Reservation, SlotKey};

use crate::error::ReservationError;
use crate::services::registry::HoldRegistry;

/// The active reservation together with the attempt that registered it,
/// so registry entries are only ever cleared by their owner.
#[derive(Clone)]
struct ActiveHold {
    reservation: Reservation,
    attempt: u64,
}

struct CoordinatorInner {
    api: Arc<SchedulingApiClient>,
    holds: Arc<HoldRegistry>,
    /// Events parked behind a failed reserve are pushed back into the
    /// session's ordered event queue through this sender.
    replay_tx: mpsc::UnboundedSender<PushEvent>,
    active: RwLock<Option<ActiveHold>>,
    attempt_seq: AtomicU64,
    remaining_tx: watch::Sender<u32>,
    expired_tx: broadcast::Sender<Uuid>,
    countdown: Mutex<Option<JoinHandle<()>>>,
}

/// Manages this session's single provisional hold: requesting it, releasing
/// it, and deriving the displayed countdown from the authoritative expiry
/// timestamp. Cloning shares the same coordinator.
pub struct ReservationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Clone for ReservationCoordinator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ReservationCoordinator {
    pub fn new(
        api: Arc<SchedulingApiClient>,
        holds: Arc<HoldRegistry>,
        replay_tx: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        let (remaining_tx, _) = watch::channel(0);
        let (expired_tx, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(CoordinatorInner {
                api,
                holds,
                replay_tx,
                active: RwLock::new(None),
                attempt_seq: AtomicU64::new(0),
                remaining_tx,
                expired_tx,
                countdown: Mutex::new(None),
            }),
        }
    }

    /// Request a provisional hold on one slot+professional pair. A conflict
    /// answer creates no local state. A grant that resolves after a newer
    /// attempt has already started is auto-released: most recent intent
    /// wins.
    pub async fn reserve(
        &self,
        key: SlotKey,
        specialty_id: Option<Uuid>,
    ) -> Result<Reservation, ReservationError> {
        let attempt = self.inner.attempt_seq.fetch_add(1, Ordering::SeqCst) + 1;

        // One hold per session: starting a new attempt retires any previous one.
        self.release().await;
        self.inner.holds.begin(key, attempt);

        let request = CreateReservationRequest {
            professional_id: key.professional_id,
            specialty_id,
            date: key.date,
            time: key.time,
        };
        let result = self.inner.api.create_reservation(&request).await;
        let superseded = self.inner.attempt_seq.load(Ordering::SeqCst) != attempt;

        let grant = match result {
            Ok(grant) => grant,
            Err(e) => {
                self.replay_deferred(key, attempt);
                return Err(e.into());
            }
        };

        if superseded {
            debug!(
                "Reservation {} resolved after a newer attempt, auto-releasing",
                grant.id
            );
            self.spawn_delete(grant.id);
            self.replay_deferred(key, attempt);
            return Err(ReservationError::Superseded);
        }

        let reservation = Reservation {
            id: grant.id,
            professional_id: key.professional_id,
            specialty_id,
            date: key.date,
            time: key.time,
            expires_at: grant.expires_at,
        };

        self.inner.holds.confirm(key, attempt);
        *self.inner.active.write().await = Some(ActiveHold {
            reservation: reservation.clone(),
            attempt,
        });
        self.inner
            .remaining_tx
            .send_replace(reservation.remaining_seconds(Utc::now()));
        self.start_countdown().await;

        info!(
            "Holding slot {} {} for professional {} until {}",
            key.date, key.time, key.professional_id, reservation.expires_at
        );
        Ok(reservation)
    }

    /// Drop the active hold, if any. The delete RPC is fire-and-forget:
    /// the server treats unknown or expired ids as a no-op, and a transport
    /// failure only means the hold dies by TTL instead.
    pub async fn release(&self) {
        let hold = self.inner.active.write().await.take();
        let Some(hold) = hold else {
            return;
        };

        self.inner
            .holds
            .clear(&hold.reservation.slot_key(), hold.attempt);
        self.stop_countdown().await;
        self.inner.remaining_tx.send_replace(0);
        debug!("Releasing reservation {}", hold.reservation.id);
        self.spawn_delete(hold.reservation.id);
    }

    /// The hold was promoted into a confirmed booking: forget it locally
    /// without deleting it server-side.
    pub async fn complete(&self) {
        let hold = self.inner.active.write().await.take();
        if let Some(hold) = hold {
            self.inner
                .holds
                .clear(&hold.reservation.slot_key(), hold.attempt);
            self.stop_countdown().await;
            self.inner.remaining_tx.send_replace(0);
        }
    }

    pub async fn active(&self) -> Option<Reservation> {
        self.inner
            .active
            .read()
            .await
            .as_ref()
            .map(|hold| hold.reservation.clone())
    }

    /// Seconds left on the active hold, recomputed from `expires_at` every
    /// tick. Zero whenever no hold is active.
    pub fn remaining_seconds(&self) -> watch::Receiver<u32> {
        self.inner.remaining_tx.subscribe()
    }

    /// Fires with the reservation id when the local countdown reaches zero
    /// before the hold was promoted or released.
    pub fn subscribe_expiry(&self) -> broadcast::Receiver<Uuid> {
        self.inner.expired_tx.subscribe()
    }

    fn replay_deferred(&self, key: SlotKey, attempt: u64) {
        for event in self.inner.holds.settle_failed(key, attempt) {
            let _ = self.inner.replay_tx.send(event);
        }
    }

    fn spawn_delete(&self, id: Uuid) {
        let api = Arc::clone(&self.inner.api);
        tokio::spawn(async move {
            if let Err(e) = api.delete_reservation(id).await {
                warn!("Best-effort reservation release failed: {}", e);
            }
        });
    }

    async fn start_countdown(&self) {
        let mut countdown = self.inner.countdown.lock().await;
        if let Some(handle) = countdown.take() {
            handle.abort();
        }
        *countdown = Some(tokio::spawn(run_countdown(Arc::clone(&self.inner))));
    }

    async fn stop_countdown(&self) {
        if let Some(handle) = self.inner.countdown.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_countdown(inner: Arc<CoordinatorInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;

        let hold = inner.active.read().await.clone();
        let Some(hold) = hold else {
            inner.remaining_tx.send_replace(0);
            return;
        };

        let remaining = hold.reservation.remaining_seconds(Utc::now());
        inner.remaining_tx.send_replace(remaining);

        if remaining == 0 {
            warn!(
                "Reservation {} expired before confirmation",
                hold.reservation.id
            );
            inner.active.write().await.take();
            inner.holds.clear(&hold.reservation.slot_key(), hold.attempt);
            let _ = inner.expired_tx.send(hold.reservation.id);
            return;
        }
    }
}
