//! Client engine for shared listening sessions: credentials, the persistent
//! now-playing connection, room presence, and live comment feeds, composed
//! behind one facade the UI talks to.

pub mod comments;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod docstore;
pub mod presence;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
};

use reqwest::{Client, StatusCode};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use shared::{
    domain::{CommentDoc, CommentId, ConnectionState, CurrentSong, RoomId, Session, UserId},
    error::SessionError,
    protocol::{CurrentSongHttpResponse, InboundMessage, SeekRequest, SeekResponse, UserProfile},
};
use storage::Storage;

use crate::{
    comments::CommentService,
    config::Settings,
    connection::{ConnectionEvent, ConnectionManager, InboundHandler},
    credentials::CredentialManager,
    docstore::DocumentStore,
    presence::{PresenceStore, RoomPresence},
};

const SESSION_EVENT_CAPACITY: usize = 256;

/// Everything the UI reacts to, in one stream.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    CurrentSongUpdated(Option<CurrentSong>),
    PollingStarted { interval: u64 },
    CommentsUpdated { room_id: RoomId, comments: Vec<CommentDoc> },
    ListenersUpdated { room_id: RoomId, listeners: u64 },
    /// Reconnects are exhausted; the session stays offline until `connect()`.
    Offline { attempts: u32 },
    /// Credentials are gone for good; the UI must return to login.
    SessionExpired,
    /// Recoverable, user-visible condition (failed like, denied seek, ...).
    Notice(String),
}

struct SessionState {
    room_comments: HashMap<RoomId, Vec<CommentDoc>>,
    likes_in_flight: HashSet<CommentId>,
}

/// Facade over the whole client engine. Cheap to share as an `Arc`; all
/// methods take `&self`.
pub struct ListenSession {
    http: Client,
    settings: Settings,
    storage: Storage,
    credentials: Arc<CredentialManager>,
    connection: Arc<ConnectionManager>,
    presence: PresenceStore,
    comments: CommentService,
    current_song: StdMutex<Option<CurrentSong>>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    forwarder: StdMutex<Option<JoinHandle<()>>>,
}

impl ListenSession {
    pub async fn new(settings: Settings, storage: Storage, store: Arc<dyn DocumentStore>) -> Arc<Self> {
        let credentials = Arc::new(CredentialManager::new(
            settings.auth_base_url.clone(),
            storage.clone(),
        ));
        let connection = ConnectionManager::new(Arc::clone(&credentials), settings.ws_url.clone());
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        let session = Arc::new(Self {
            http: Client::new(),
            settings,
            storage,
            credentials,
            connection,
            presence: PresenceStore::new(Arc::clone(&store)),
            comments: CommentService::new(store),
            current_song: StdMutex::new(None),
            state: Mutex::new(SessionState {
                room_comments: HashMap::new(),
                likes_in_flight: HashSet::new(),
            }),
            events,
            forwarder: StdMutex::new(None),
        });

        session.register_inbound_handlers().await;
        session.spawn_connection_forwarder();
        session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // --- credentials -----------------------------------------------------

    /// Restores the persisted session, if any.
    pub async fn restore(&self) -> anyhow::Result<bool> {
        self.credentials.restore().await
    }

    /// Installs a freshly authorized session (post-OAuth callback).
    pub async fn login_with(&self, session: Session) -> anyhow::Result<()> {
        self.credentials.install(session).await
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.credentials.current_session().await
    }

    /// User-initiated logout: closes the connection and wipes credentials.
    pub async fn logout(&self) {
        self.connection.disconnect().await;
        self.credentials.logout().await;
    }

    // --- connection ------------------------------------------------------

    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn request_current_state(&self) -> bool {
        self.connection.request_current_state().await
    }

    pub async fn start_polling(&self) -> bool {
        self.connection
            .start_polling(self.settings.poll_interval_secs)
            .await
    }

    pub async fn stop_polling(&self) -> bool {
        self.connection.stop_polling().await
    }

    /// Last known now-playing state, from pushes or the HTTP fallback.
    pub fn current_song(&self) -> Option<CurrentSong> {
        self.current_song.lock().ok().and_then(|song| song.clone())
    }

    /// One-shot HTTP fetch of the now-playing state, for when the persistent
    /// connection is down.
    pub async fn fetch_current_song(&self) -> Result<Option<CurrentSong>, SessionError> {
        let token = self.bearer_token().await?;
        let response: CurrentSongHttpResponse = self
            .http
            .get(format!("{}/spotify/current", self.settings.api_base_url))
            .query(&[("token", token.as_str())])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)?;

        let song = if response.message.is_some() {
            // "no track playing" style answers carry a message, not a song.
            None
        } else {
            response.song
        };
        self.cache_song(song.clone());
        let _ = self.events.send(SessionEvent::CurrentSongUpdated(song.clone()));
        Ok(song)
    }

    // --- profile / transport control -------------------------------------

    pub async fn me(&self) -> Result<UserProfile, SessionError> {
        let token = self.bearer_token().await?;
        let profile: UserProfile = self
            .http
            .get(format!("{}/me", self.settings.api_base_url))
            .bearer_auth(&token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)?;

        if let Err(err) = self.storage.save_profile(&profile).await {
            warn!("failed to cache profile: {err}");
        }
        Ok(profile)
    }

    /// Profile cached by the last successful `me()`, for offline display.
    pub async fn cached_profile(&self) -> Option<UserProfile> {
        let user_id = self.credentials.user_id().await.ok()?;
        self.storage.load_profile(&user_id).await.ok().flatten()
    }

    pub async fn profile(&self, user_id: &UserId) -> Result<UserProfile, SessionError> {
        let token = self.bearer_token().await?;
        self.http
            .get(format!("{}/user/{}", self.settings.api_base_url, user_id))
            .bearer_auth(&token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)
    }

    /// Seeks the shared playback. A 403 means the account lacks playback
    /// control entitlement; that is surfaced as a notice, not a crash.
    pub async fn seek(&self, timestamp_ms: i64) -> Result<String, SessionError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .post(format!("{}/seek", self.settings.api_base_url))
            .bearer_auth(&token)
            .json(&SeekRequest { timestamp_ms })
            .send()
            .await
            .map_err(transient)?;

        if response.status() == StatusCode::FORBIDDEN {
            let detail = response.text().await.unwrap_or_default();
            let _ = self.events.send(SessionEvent::Notice(
                "playback control is not available on this account".into(),
            ));
            return Err(SessionError::EntitlementDenied(detail));
        }

        let body: SeekResponse = response
            .error_for_status()
            .map_err(transient)?
            .json()
            .await
            .map_err(transient)?;
        Ok(body.seeked_to_readable)
    }

    // --- rooms ------------------------------------------------------------

    /// Joins a room: registers presence and starts the live comment feed.
    /// The returned handle leaves the room when released or dropped.
    pub async fn join_room(self: &Arc<Self>, room_id: &RoomId) -> Result<RoomHandle, SessionError> {
        let guard = self.presence.enter(room_id).await?;
        let mut feed = self.comments.subscribe(room_id.clone());

        let session = Arc::clone(self);
        let feed_room = room_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(view) = feed.next().await {
                {
                    let mut state = session.state.lock().await;
                    state
                        .room_comments
                        .insert(feed_room.clone(), view.comments.clone());
                }
                let _ = session.events.send(SessionEvent::ListenersUpdated {
                    room_id: feed_room.clone(),
                    listeners: view.listeners,
                });
                let _ = session.events.send(SessionEvent::CommentsUpdated {
                    room_id: feed_room.clone(),
                    comments: view.comments,
                });
            }
        });

        info!(room_id = %room_id, "joined room");
        Ok(RoomHandle {
            room_id: room_id.clone(),
            presence: Some(guard),
            pump,
        })
    }

    /// Locally cached comment view for a room, as last published by its feed.
    pub async fn room_comments(&self, room_id: &RoomId) -> Vec<CommentDoc> {
        self.state
            .lock()
            .await
            .room_comments
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn listener_count(&self, room_id: &RoomId) -> Result<u64, SessionError> {
        Ok(self.presence.listener_count(room_id).await?)
    }

    pub async fn post_comment(
        &self,
        room_id: &RoomId,
        content: impl Into<String>,
        time_ms: Option<i64>,
    ) -> Result<CommentDoc, SessionError> {
        let author = self.credentials.user_id().await?;
        match self.comments.post_comment(room_id, &author, content, time_ms).await {
            Ok(comment) => Ok(comment),
            Err(err) => {
                let _ = self
                    .events
                    .send(SessionEvent::Notice("couldn't post your comment".into()));
                Err(err.into())
            }
        }
    }

    pub async fn remove_comment(
        &self,
        room_id: &RoomId,
        comment_id: &CommentId,
    ) -> Result<(), SessionError> {
        let user_id = self.credentials.user_id().await?;
        self.comments.remove_comment(room_id, comment_id, &user_id).await
    }

    /// Optimistic like toggle: the cached view is flipped and republished
    /// before the store write, rolled back if the write fails. Repeated
    /// toggles on one comment are serialized; a toggle arriving while one is
    /// already in flight is dropped.
    pub async fn toggle_like(
        &self,
        room_id: &RoomId,
        comment_id: &CommentId,
    ) -> Result<(), SessionError> {
        let user_id = self.credentials.user_id().await?;

        let (was_liked, optimistic) = {
            let mut state = self.state.lock().await;
            if !state.likes_in_flight.insert(comment_id.clone()) {
                return Ok(());
            }
            match flip_cached_like(&mut state.room_comments, room_id, comment_id, &user_id) {
                Some((was, view)) => (was, Some(view)),
                // Not in the local view; no optimistic state to maintain.
                None => (false, None),
            }
        };
        if let Some(comments) = optimistic {
            let _ = self.events.send(SessionEvent::CommentsUpdated {
                room_id: room_id.clone(),
                comments,
            });
        }

        let outcome = match self.comments.toggle_like(comment_id, &user_id, was_liked).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(comment_id = %comment_id, "like toggle failed, rolling back: {err}");
                let rolled_back = {
                    let mut state = self.state.lock().await;
                    flip_cached_like(&mut state.room_comments, room_id, comment_id, &user_id)
                };
                if let Some((_, comments)) = rolled_back {
                    let _ = self.events.send(SessionEvent::CommentsUpdated {
                        room_id: room_id.clone(),
                        comments,
                    });
                }
                let _ = self
                    .events
                    .send(SessionEvent::Notice("couldn't update that like".into()));
                Err(err.into())
            }
        };

        self.state.lock().await.likes_in_flight.remove(comment_id);
        outcome
    }

    // --- internals --------------------------------------------------------

    async fn register_inbound_handlers(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let handler: InboundHandler = Arc::new(move |message| {
            let Some(session) = session.upgrade() else {
                return;
            };
            match message {
                InboundMessage::CurrentSongUpdate { song }
                | InboundMessage::CurrentSongResponse { song } => {
                    session.cache_song(song.clone());
                    let _ = session.events.send(SessionEvent::CurrentSongUpdated(song));
                }
                InboundMessage::PollingStarted { interval } => {
                    let _ = session.events.send(SessionEvent::PollingStarted { interval });
                }
            }
        });
        self.connection
            .on("current_song_update", Arc::clone(&handler))
            .await;
        self.connection
            .on("current_song_response", Arc::clone(&handler))
            .await;
        self.connection.on("polling_started", handler).await;
    }

    fn spawn_connection_forwarder(self: &Arc<Self>) {
        let mut rx = self.connection.subscribe();
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(session) = session.upgrade() else {
                    return;
                };
                match event {
                    ConnectionEvent::StateChanged(state) => {
                        let _ = session.events.send(SessionEvent::ConnectionChanged(state));
                    }
                    ConnectionEvent::Exhausted { attempts } => {
                        let _ = session.events.send(SessionEvent::Offline { attempts });
                    }
                    ConnectionEvent::AuthExpired => session.force_logout().await,
                }
            }
        });
        if let Ok(mut slot) = self.forwarder.lock() {
            *slot = Some(task);
        }
    }

    /// Unrecoverable credential failure: wipe the session and tell the UI.
    async fn force_logout(&self) {
        warn!("credentials expired beyond refresh; forcing logout");
        self.connection.disconnect().await;
        self.credentials.logout().await;
        let _ = self.events.send(SessionEvent::SessionExpired);
    }

    async fn bearer_token(&self) -> Result<String, SessionError> {
        match self.credentials.get_valid_token().await {
            Ok(token) => Ok(token),
            Err(SessionError::AuthExpired) => {
                self.force_logout().await;
                Err(SessionError::AuthExpired)
            }
            Err(err) => Err(err),
        }
    }

    fn cache_song(&self, song: Option<CurrentSong>) {
        if let Ok(mut guard) = self.current_song.lock() {
            *guard = song;
        }
    }
}

impl Drop for ListenSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.forwarder.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Membership in one room: presence registration plus the live comment feed
/// pump. `leave()` is the orderly exit; dropping the handle leaves too, via
/// the presence guard's drop path.
pub struct RoomHandle {
    room_id: RoomId,
    presence: Option<RoomPresence>,
    pump: JoinHandle<()>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn leave(mut self) {
        self.pump.abort();
        if let Some(guard) = self.presence.take() {
            guard.release().await;
        }
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Flips `user_id` in the cached comment's like set and returns the prior
/// liked state with the updated room view, or `None` when the comment is not
/// in the local cache.
fn flip_cached_like(
    cache: &mut HashMap<RoomId, Vec<CommentDoc>>,
    room_id: &RoomId,
    comment_id: &CommentId,
    user_id: &UserId,
) -> Option<(bool, Vec<CommentDoc>)> {
    let comments = cache.get_mut(room_id)?;
    let comment = comments.iter_mut().find(|c| &c.id == comment_id)?;
    let was_liked = comment.liked_by_contains(user_id);
    if was_liked {
        comment.liked_by.retain(|id| id != user_id);
    } else {
        comment.liked_by.push(user_id.clone());
    }
    Some((was_liked, comments.clone()))
}

fn transient(err: reqwest::Error) -> SessionError {
    SessionError::Transient(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
