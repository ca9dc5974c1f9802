use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use shared_models::{PushEvent, SlotKey};

/// Where a slot+professional pair stands relative to this session's own
/// reservation activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    /// A reserve RPC for this key is in flight; its outcome is unknown.
    Pending,
    /// This session holds a confirmed reservation on this key.
    Held,
}

struct Entry {
    /// The reserve attempt that owns this entry. A newer attempt on the
    /// same key takes the entry over; a settle or clear from an older
    /// attempt is then a no-op, so the older attempt can never unregister
    /// its replacement.
    attempt: u64,
    state: HoldState,
    deferred: Vec<PushEvent>,
}

/// Registry of this session's in-flight and confirmed holds, keyed by
/// SlotKey. The reconciler consults it before applying any event that
/// reports a slot as taken: a `Held` match is the session's own action
/// echoed back and is dropped; a `Pending` match is deferred here until the
/// reserve RPC settles, so the user never sees their own attempt reported
/// as lost to someone else.
#[derive(Default)]
pub struct HoldRegistry {
    state: Mutex<HashMap<SlotKey, Entry>>,
}

impl HoldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold_state(&self, key: &SlotKey) -> Option<HoldState> {
        self.state.lock().unwrap().get(key).map(|entry| entry.state)
    }

    /// Mark a reserve attempt as in flight. Events already parked behind an
    /// older attempt on the same key stay parked; they settle with this one.
    pub fn begin(&self, key: SlotKey, attempt: u64) {
        let mut holds = self.state.lock().unwrap();
        let entry = holds.entry(key).or_insert_with(|| Entry {
            attempt,
            state: HoldState::Pending,
            deferred: Vec::new(),
        });
        entry.attempt = attempt;
        entry.state = HoldState::Pending;
    }

    /// Park an event behind the pending attempt for this key. Returns false
    /// when no attempt is pending, in which case the caller applies the
    /// event normally.
    pub fn defer(&self, key: SlotKey, event: PushEvent) -> bool {
        let mut holds = self.state.lock().unwrap();
        match holds.get_mut(&key) {
            Some(entry) if entry.state == HoldState::Pending => {
                entry.deferred.push(event);
                true
            }
            _ => false,
        }
    }

    /// The reserve RPC succeeded: the key is now held and everything parked
    /// behind it was this session's own echo.
    pub fn confirm(&self, key: SlotKey, attempt: u64) {
        let mut holds = self.state.lock().unwrap();
        let Some(entry) = holds.get_mut(&key) else {
            return;
        };
        if entry.attempt != attempt {
            return;
        }
        entry.state = HoldState::Held;
        let dropped = std::mem::take(&mut entry.deferred).len();
        if dropped > 0 {
            debug!("Dropped {} self-echo event(s) for confirmed hold", dropped);
        }
    }

    /// The reserve RPC failed or was superseded: forget the key and hand
    /// back the parked events so they can be replayed in order. Empty when
    /// the key has since been taken over by a newer attempt.
    pub fn settle_failed(&self, key: SlotKey, attempt: u64) -> Vec<PushEvent> {
        let mut holds = self.state.lock().unwrap();
        match holds.get(&key) {
            Some(entry) if entry.attempt == attempt => holds
                .remove(&key)
                .map(|entry| entry.deferred)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Drop a confirmed hold (release, expiry, or booking promotion).
    pub fn clear(&self, key: &SlotKey, attempt: u64) {
        let mut holds = self.state.lock().unwrap();
        if holds.get(key).is_some_and(|entry| entry.attempt == attempt) {
            holds.remove(key);
        }
    }
}
