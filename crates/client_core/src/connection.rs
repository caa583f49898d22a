//! Persistent duplex connection to the now-playing service: a
//! connect/reconnect state machine with a capped exponential backoff budget
//! and action-tag dispatch of inbound messages.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, Stream, StreamExt};
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use shared::{
    domain::ConnectionState,
    error::SessionError,
    protocol::{InboundMessage, OutboundCommand},
};

use crate::credentials::CredentialManager;

/// One handler per action tag; re-registering a tag replaces the previous
/// handler (last registration wins).
pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// The reconnect budget ran out; the manager stays disconnected until an
    /// explicit `connect()`.
    Exhausted { attempts: u32 },
    /// Credentials could not be refreshed while opening the connection.
    AuthExpired,
}

/// Reconnect budget: attempt count plus current backoff delay, owned by the
/// connection task and reset only on a successful open. A dropped connection
/// consumes an attempt just like a failed dial.
#[derive(Debug)]
pub struct RetryBudget {
    failures: u32,
    delay: Duration,
}

impl RetryBudget {
    pub const INITIAL_DELAY: Duration = Duration::from_millis(1000);
    pub const MAX_DELAY: Duration = Duration::from_millis(30_000);
    pub const MAX_ATTEMPTS: u32 = 5;

    pub fn new() -> Self {
        Self {
            failures: 0,
            delay: Self::INITIAL_DELAY,
        }
    }

    /// Records a failed attempt. Returns the delay to wait before the next
    /// attempt, or `None` once the budget is exhausted.
    pub fn register_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= Self::MAX_ATTEMPTS {
            return None;
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX_DELAY);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = Self::INITIAL_DELAY;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    state: ConnectionState,
    // Bumped by connect()/disconnect(); a task whose generation is stale must
    // not commit any further state transition.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    credentials: Arc<CredentialManager>,
    ws_url: String,
    handlers: RwLock<HashMap<String, InboundHandler>>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(credentials: Arc<CredentialManager>, ws_url: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            credentials,
            ws_url: ws_url.into(),
            handlers: RwLock::new(HashMap::new()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                task: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Registers the handler for one action tag, replacing any previous one.
    pub async fn on(&self, action: impl Into<String>, handler: InboundHandler) {
        self.handlers.write().await.insert(action.into(), handler);
    }

    /// Starts the connection task. A no-op unless currently disconnected.
    pub async fn connect(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnected {
                return;
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            let _ = self
                .events
                .send(ConnectionEvent::StateChanged(ConnectionState::Connecting));
            inner.generation
        };

        let manager = Arc::clone(self);
        let task = tokio::spawn(manager.run(generation));

        let mut inner = self.inner.lock().await;
        if inner.generation == generation {
            inner.task = Some(task);
        } else {
            // disconnect() raced us; the task must not live on.
            task.abort();
        }
    }

    /// Terminal from any state: cancels pending backoff and suppresses an
    /// in-flight connect from completing into `connected`.
    pub async fn disconnect(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.outbound = None;
            if inner.state != ConnectionState::Disconnected {
                inner.state = ConnectionState::Disconnected;
                let _ = self.events.send(ConnectionEvent::StateChanged(
                    ConnectionState::Disconnected,
                ));
            }
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Asks the service for the session's current now-playing state.
    pub async fn request_current_state(&self) -> bool {
        self.send_command(&OutboundCommand::GetCurrentSong).await
    }

    pub async fn start_polling(&self, interval_secs: u64) -> bool {
        self.send_command(&OutboundCommand::StartCurrentSongPolling {
            interval: interval_secs,
        })
        .await
    }

    pub async fn stop_polling(&self) -> bool {
        self.send_command(&OutboundCommand::StopCurrentSongPolling)
            .await
    }

    /// Best-effort send: returns whether the send was attempted. Callers must
    /// not assume delivery.
    async fn send_command(&self, command: &OutboundCommand) -> bool {
        let inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = &inner.outbound else {
            return false;
        };
        match serde_json::to_string(command) {
            Ok(text) => outbound.send(Message::Text(text)).is_ok(),
            Err(err) => {
                warn!("failed to encode outbound command: {err}");
                false
            }
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut budget = RetryBudget::new();
        loop {
            let token = match self.credentials.get_valid_token().await {
                Ok(token) => token,
                Err(SessionError::AuthExpired) => {
                    warn!("cannot open connection: credentials expired");
                    self.set_state(generation, ConnectionState::Disconnected)
                        .await;
                    let _ = self.events.send(ConnectionEvent::AuthExpired);
                    return;
                }
                Err(err) => {
                    warn!("cannot fetch token for connection handshake: {err}");
                    if !self.backoff_or_give_up(generation, &mut budget).await {
                        return;
                    }
                    continue;
                }
            };

            let url = match self.handshake_url(&token) {
                Ok(url) => url,
                Err(err) => {
                    warn!(ws_url = %self.ws_url, "invalid connection url: {err}");
                    self.set_state(generation, ConnectionState::Disconnected)
                        .await;
                    return;
                }
            };

            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    if !self.set_state(generation, ConnectionState::Connected).await {
                        return;
                    }
                    budget.reset();
                    info!("connection established");

                    let (mut write, mut read) = stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.generation != generation {
                            return;
                        }
                        inner.outbound = Some(tx);
                    }
                    let writer = tokio::spawn(async move {
                        while let Some(message) = rx.recv().await {
                            if write.send(message).await.is_err() {
                                break;
                            }
                        }
                    });

                    let normal_close = self.read_loop(&mut read).await;
                    writer.abort();
                    {
                        let mut inner = self.inner.lock().await;
                        if inner.generation != generation {
                            return;
                        }
                        inner.outbound = None;
                    }

                    if normal_close {
                        info!("connection closed normally");
                        self.set_state(generation, ConnectionState::Disconnected)
                            .await;
                        return;
                    }

                    warn!("connection dropped; scheduling reconnect");
                    if !self.backoff_or_give_up(generation, &mut budget).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        attempt = budget.failures() + 1,
                        "connect attempt failed: {err}"
                    );
                    if !self.backoff_or_give_up(generation, &mut budget).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns whether the caller should keep trying. On exhaustion the state
    /// is left `Disconnected` and an `Exhausted` event is emitted.
    async fn backoff_or_give_up(&self, generation: u64, budget: &mut RetryBudget) -> bool {
        match budget.register_failure() {
            Some(delay) => {
                if !self
                    .set_state(generation, ConnectionState::Reconnecting)
                    .await
                {
                    return false;
                }
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    "waiting before reconnect attempt"
                );
                tokio::time::sleep(delay).await;
                self.set_state(generation, ConnectionState::Connecting).await
            }
            None => {
                warn!(
                    attempts = RetryBudget::MAX_ATTEMPTS,
                    "reconnect budget exhausted; staying offline"
                );
                self.set_state(generation, ConnectionState::Disconnected)
                    .await;
                let _ = self.events.send(ConnectionEvent::Exhausted {
                    attempts: RetryBudget::MAX_ATTEMPTS,
                });
                false
            }
        }
    }

    /// Returns whether the close was a normal (code 1000) close.
    async fn read_loop<S>(&self, read: &mut S) -> bool
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => self.dispatch(&text).await,
                Ok(Message::Close(frame)) => {
                    return frame.map(|f| f.code == CloseCode::Normal).unwrap_or(false);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("connection receive failed: {err}");
                    return false;
                }
            }
        }
        false
    }

    async fn dispatch(&self, text: &str) {
        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                // Unknown action tags fall out here; dropping them is the
                // contract, not an error.
                debug!("dropping unrecognized inbound message: {err}");
                return;
            }
        };
        let handler = self.handlers.read().await.get(message.action()).cloned();
        match handler {
            Some(handler) => handler(message),
            None => debug!(action = message.action(), "no handler registered; dropping"),
        }
    }

    /// Embeds the current valid token in the handshake URL. A token expiring
    /// mid-connection is not rotated on the open socket; reconnection fetches
    /// a fresh one.
    fn handshake_url(&self, token: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.ws_url)?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    async fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return false;
        }
        if inner.state != state {
            inner.state = state;
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
