use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use push_channel_cell::{ChannelError, PushStream, PushTransport};
use shared_config::AppConfig;

pub struct TestConfig {
    pub api_url: String,
    pub push_url: String,
    pub auth_token: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:54321".to_string(),
            push_url: "ws://localhost:54322/push".to_string(),
            auth_token: "test-token".to_string(),
        }
    }
}

impl TestConfig {
    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            scheduling_api_url: self.api_url.clone(),
            scheduling_push_url: self.push_url.clone(),
            scheduling_auth_token: self.auth_token.clone(),
        }
    }
}

enum SessionFrame {
    Text(String),
    Close,
}

enum PlannedSession {
    RefuseTransient,
    RefuseAuth,
    Accept {
        frame_rx: mpsc::UnboundedReceiver<SessionFrame>,
        sent_log: Arc<Mutex<Vec<String>>>,
    },
}

/// In-memory `PushTransport` driven by a script: each expected connection
/// is queued ahead of time and can be fed frames, closed, or refused. Every
/// client->server message is recorded per session so tests can assert on
/// join/leave traffic.
pub struct ScriptedTransport {
    sessions: Mutex<VecDeque<PlannedSession>>,
    connect_attempts: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(VecDeque::new()),
            connect_attempts: AtomicUsize::new(0),
        })
    }

    /// Queue one accepted connection; the returned handle feeds it.
    pub fn expect_session(&self) -> SessionHandle {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let sent_log = Arc::new(Mutex::new(Vec::new()));
        self.sessions
            .lock()
            .unwrap()
            .push_back(PlannedSession::Accept {
                frame_rx,
                sent_log: Arc::clone(&sent_log),
            });
        SessionHandle { frame_tx, sent_log }
    }

    /// Queue one refused connection attempt (transient failure).
    pub fn refuse_connect(&self) {
        self.sessions
            .lock()
            .unwrap()
            .push_back(PlannedSession::RefuseTransient);
    }

    /// Queue one auth rejection (terminal failure).
    pub fn refuse_auth(&self) {
        self.sessions
            .lock()
            .unwrap()
            .push_back(PlannedSession::RefuseAuth);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self, _url: &str) -> Result<Box<dyn PushStream>, ChannelError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        loop {
            let planned = self.sessions.lock().unwrap().pop_front();
            match planned {
                // Script exhausted: stall like an unreachable server until
                // the test plans the next session.
                None => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
                Some(PlannedSession::RefuseTransient) => {
                    return Err(ChannelError::ConnectFailed("scripted refusal".to_string()))
                }
                Some(PlannedSession::RefuseAuth) => return Err(ChannelError::AuthRejected),
                Some(PlannedSession::Accept { frame_rx, sent_log }) => {
                    return Ok(Box::new(ScriptedStream { frame_rx, sent_log }))
                }
            }
        }
    }
}

/// Test-side controls for one scripted connection.
pub struct SessionHandle {
    frame_tx: mpsc::UnboundedSender<SessionFrame>,
    sent_log: Arc<Mutex<Vec<String>>>,
}

impl SessionHandle {
    pub fn push_frame(&self, text: impl Into<String>) {
        let _ = self.frame_tx.send(SessionFrame::Text(text.into()));
    }

    /// Simulate the server closing the connection.
    pub fn close(&self) {
        let _ = self.frame_tx.send(SessionFrame::Close);
    }

    /// Client->server messages sent over this connection, in order.
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_log.lock().unwrap().clone()
    }
}

struct ScriptedStream {
    frame_rx: mpsc::UnboundedReceiver<SessionFrame>,
    sent_log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PushStream for ScriptedStream {
    async fn next_text(&mut self) -> Option<Result<String, ChannelError>> {
        match self.frame_rx.recv().await {
            Some(SessionFrame::Text(text)) => Some(Ok(text)),
            Some(SessionFrame::Close) | None => None,
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.sent_log.lock().unwrap().push(text);
        Ok(())
    }
}

/// Raw push frames as the server emits them.
pub struct PushFrames;

impl PushFrames {
    pub fn slot_updated(
        professional_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        available: bool,
    ) -> String {
        json!({
            "type": "SlotUpdated",
            "professional_id": professional_id,
            "date": date.to_string(),
            "time": time.format("%H:%M:%S").to_string(),
            "available": available,
        })
        .to_string()
    }

    pub fn day_updated(date: NaiveDate, slots_delta: i32) -> String {
        json!({
            "type": "DayUpdated",
            "date": date.to_string(),
            "slots_delta": slots_delta,
        })
        .to_string()
    }

    pub fn scope_availability_updated(scope_id: Uuid, has_availability: bool) -> String {
        json!({
            "type": "ScopeAvailabilityUpdated",
            "scope_id": scope_id,
            "has_availability": has_availability,
        })
        .to_string()
    }

    pub fn slot_eligibility_updated(
        professional_id: Uuid,
        date: NaiveDate,
        time: NaiveTime,
        eligible: bool,
    ) -> String {
        json!({
            "type": "SlotEligibilityUpdated",
            "professional_id": professional_id,
            "date": date.to_string(),
            "time": time.format("%H:%M:%S").to_string(),
            "eligible": eligible,
        })
        .to_string()
    }

    pub fn block_range_changed(
        professional_id: Uuid,
        date_from: NaiveDate,
        date_to: NaiveDate,
        is_blocked: bool,
    ) -> String {
        json!({
            "type": "BlockRangeChanged",
            "professional_id": professional_id,
            "date_from": date_from.to_string(),
            "date_to": date_to.to_string(),
            "is_blocked": is_blocked,
        })
        .to_string()
    }
}

/// RPC response bodies for wiremock doubles.
pub struct MockSchedulingResponses;

impl MockSchedulingResponses {
    pub fn availability_day(date: NaiveDate, slots: &[(NaiveTime, Uuid)]) -> Value {
        json!({
            "date": date.to_string(),
            "slots": slots
                .iter()
                .map(|(time, professional_id)| json!({
                    "time": time.format("%H:%M:%S").to_string(),
                    "professional_id": professional_id,
                    "is_available": true,
                }))
                .collect::<Vec<_>>(),
        })
    }

    pub fn reservation_grant(id: Uuid, ttl_seconds: i64) -> Value {
        json!({
            "id": id,
            "expires_at": (chrono::Utc::now() + chrono::Duration::seconds(ttl_seconds)).to_rfc3339(),
        })
    }

    pub fn booking_confirmation(appointment_id: Uuid) -> Value {
        json!({ "appointment_id": appointment_id })
    }
}
