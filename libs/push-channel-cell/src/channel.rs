use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared_models::{ClientMessage, PushEvent};

use crate::error::ChannelError;
use crate::transport::{PushStream, PushTransport};

/// Consecutive failed attempts walk this schedule; a successful connect
/// resets it to the start.
const BACKOFF_SECONDS: [u64; 5] = [0, 2, 5, 10, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    /// Permanent failure (auth rejection). No further reconnect attempts;
    /// recovery is the caller's responsibility.
    Terminal,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }
}

enum ChannelCommand {
    Join(String),
    Leave(String),
    Shutdown,
}

struct ChannelInner {
    transport: Arc<dyn PushTransport>,
    url: String,
    groups: RwLock<HashSet<String>>,
    state_tx: watch::Sender<ChannelState>,
    // Taken by the run loop on startup so the event queue closes with it.
    event_tx: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelCommand>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelInner {
    fn set_state(&self, state: ChannelState) {
        // send_replace keeps the stored state current even when nobody is
        // watching at that moment.
        self.state_tx.send_replace(state);
    }
}

/// Every inbound frame funnels through here into the one ordered event
/// queue. Frames that do not parse as a known event are dropped, never
/// propagated.
fn dispatch(event_tx: &mpsc::UnboundedSender<PushEvent>, text: &str) {
    match serde_json::from_str::<PushEvent>(text) {
        Ok(event) => {
            let _ = event_tx.send(event);
        }
        Err(e) => warn!("Dropping malformed push frame: {}", e),
    }
}

/// Owns the push-channel connection lifecycle for one booking session:
/// connect, reconnect with backoff, and group membership. Cloning shares
/// the same underlying channel.
pub struct SubscriptionChannel {
    inner: Arc<ChannelInner>,
}

impl Clone for SubscriptionChannel {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SubscriptionChannel {
    /// Returns the channel and the receiving end of its ordered event
    /// queue; the caller feeds the receiver into one reconciler loop.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        url: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChannelState::Idle);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                transport,
                url: url.into(),
                groups: RwLock::new(HashSet::new()),
                state_tx,
                event_tx: Mutex::new(Some(event_tx)),
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                run_handle: Mutex::new(None),
            }),
        };

        (channel, event_rx)
    }

    /// Start the connection loop and wait until the channel is connected.
    /// Idempotent: concurrent calls share the single in-flight attempt and
    /// all resolve on the same outcome.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        {
            let mut handle = self.inner.run_handle.lock().await;
            let running = handle.as_ref().is_some_and(|h| !h.is_finished());
            if !running {
                if self.inner.command_rx.lock().await.is_none() {
                    // The loop already ran and terminated; this channel's
                    // lifetime is over.
                    return Err(ChannelError::Closed);
                }
                let inner = Arc::clone(&self.inner);
                *handle = Some(tokio::spawn(run(inner)));
            }
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                ChannelState::Connected => return Ok(()),
                ChannelState::Terminal => return Err(ChannelError::AuthRejected),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ChannelError::Closed);
            }
        }
    }

    pub async fn join_group(&self, group: &str) {
        let inserted = self.inner.groups.write().await.insert(group.to_string());
        if inserted {
            let _ = self
                .inner
                .command_tx
                .send(ChannelCommand::Join(group.to_string()));
        }
    }

    pub async fn leave_group(&self, group: &str) {
        let removed = self.inner.groups.write().await.remove(group);
        if removed {
            let _ = self
                .inner
                .command_tx
                .send(ChannelCommand::Leave(group.to_string()));
        }
    }

    pub async fn joined_groups(&self) -> HashSet<String> {
        self.inner.groups.read().await.clone()
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state_tx.borrow().is_connected()
    }

    /// Stop the connection loop. The event queue closes once the loop has
    /// exited.
    pub async fn shutdown(&self) {
        let _ = self.inner.command_tx.send(ChannelCommand::Shutdown);
        if let Some(handle) = self.inner.run_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn run(inner: Arc<ChannelInner>) {
    let mut command_rx = match inner.command_rx.lock().await.take() {
        Some(rx) => rx,
        None => return,
    };
    let event_tx = match inner.event_tx.lock().await.take() {
        Some(tx) => tx,
        None => return,
    };

    let mut backoff_idx = 0usize;
    'reconnect: loop {
        let delay = BACKOFF_SECONDS[backoff_idx.min(BACKOFF_SECONDS.len() - 1)];
        if delay > 0 {
            debug!("Reconnecting push channel in {}s", delay);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        backoff_idx = (backoff_idx + 1).min(BACKOFF_SECONDS.len() - 1);

        inner.set_state(ChannelState::Connecting);
        let mut stream = match inner.transport.connect(&inner.url).await {
            Ok(stream) => stream,
            Err(e) if e.is_terminal() => {
                warn!("Push channel failed permanently: {}", e);
                inner.set_state(ChannelState::Terminal);
                return;
            }
            Err(e) => {
                debug!("Push channel connect attempt failed: {}", e);
                inner.set_state(ChannelState::Disconnected);
                continue;
            }
        };

        // Group membership is ephemeral server-side state, lost on every
        // disconnect; rebuild the full set before reporting Connected.
        let groups: Vec<String> = inner.groups.read().await.iter().cloned().collect();
        for group in &groups {
            let message = ClientMessage::JoinScopeGroup {
                group: group.clone(),
            };
            if let Err(e) = send_message(stream.as_mut(), &message).await {
                warn!("Failed to rejoin group {}: {}", group, e);
                inner.set_state(ChannelState::Disconnected);
                continue 'reconnect;
            }
        }

        backoff_idx = 0;
        inner.set_state(ChannelState::Connected);
        info!("Push channel connected, {} group(s) joined", groups.len());

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    None | Some(ChannelCommand::Shutdown) => {
                        debug!("Push channel shutting down");
                        inner.set_state(ChannelState::Disconnected);
                        return;
                    }
                    Some(ChannelCommand::Join(group)) => {
                        let message = ClientMessage::JoinScopeGroup { group };
                        if send_message(stream.as_mut(), &message).await.is_err() {
                            inner.set_state(ChannelState::Disconnected);
                            continue 'reconnect;
                        }
                    }
                    Some(ChannelCommand::Leave(group)) => {
                        let message = ClientMessage::LeaveScopeGroup { group };
                        if send_message(stream.as_mut(), &message).await.is_err() {
                            inner.set_state(ChannelState::Disconnected);
                            continue 'reconnect;
                        }
                    }
                },
                frame = stream.next_text() => match frame {
                    None => {
                        info!("Push channel closed by server");
                        inner.set_state(ChannelState::Disconnected);
                        continue 'reconnect;
                    }
                    Some(Err(e)) => {
                        warn!("Push channel read error: {}", e);
                        inner.set_state(ChannelState::Disconnected);
                        continue 'reconnect;
                    }
                    Some(Ok(text)) => dispatch(&event_tx, &text),
                }
            }
        }
    }
}

async fn send_message(
    stream: &mut dyn PushStream,
    message: &ClientMessage,
) -> Result<(), ChannelError> {
    let text =
        serde_json::to_string(message).map_err(|e| ChannelError::Transport(e.to_string()))?;
    stream.send_text(text).await
}
