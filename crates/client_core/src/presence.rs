//! Aggregate listener counting per room, with scoped acquisition so every
//! exit path (navigation, drop, session replacement) decrements the count.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use tracing::{debug, warn};

use shared::domain::{RoomDoc, RoomId};

use crate::docstore::{DocumentStore, StoreResult};

/// Presence is an aggregate count, not a set of listener identities: two tabs
/// of one user count twice, and a crash without cleanup can leave drift. Reads
/// clamp at zero so drift never surfaces as a negative count.
#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn DocumentStore>,
}

impl PresenceStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Enters a room, creating the room document on first entry, and returns
    /// a guard whose release (explicit or on drop) leaves it again.
    pub async fn enter(&self, room_id: &RoomId) -> StoreResult<RoomPresence> {
        self.enter_room(room_id).await?;
        Ok(RoomPresence {
            presence: self.clone(),
            room_id: room_id.clone(),
            released: AtomicBool::new(false),
        })
    }

    pub async fn enter_room(&self, room_id: &RoomId) -> StoreResult<()> {
        match self.store.get_room(room_id).await? {
            None => {
                debug!(room_id = %room_id, "creating room for first listener");
                self.store
                    .put_room(RoomDoc {
                        room_id: room_id.clone(),
                        comment_ids: Vec::new(),
                        listeners: 1,
                        created_at: Utc::now(),
                    })
                    .await
            }
            Some(_) => self.adjust(room_id, 1).await,
        }
    }

    pub async fn leave_room(&self, room_id: &RoomId) -> StoreResult<()> {
        match self.store.get_room(room_id).await? {
            None => {
                // Defensive path: a leave without a surviving room document
                // still records the decrement. The stored count may read -1;
                // listener_count() clamps it away.
                self.store
                    .put_room(RoomDoc {
                        room_id: room_id.clone(),
                        comment_ids: Vec::new(),
                        listeners: 0,
                        created_at: Utc::now(),
                    })
                    .await?;
                self.adjust(room_id, -1).await
            }
            Some(_) => self.adjust(room_id, -1).await,
        }
    }

    /// Display-facing listener count for a room, zero when absent.
    pub async fn listener_count(&self, room_id: &RoomId) -> StoreResult<u64> {
        Ok(self
            .store
            .get_room(room_id)
            .await?
            .map(|room| room.listener_count())
            .unwrap_or(0))
    }

    async fn adjust(&self, room_id: &RoomId, delta: i64) -> StoreResult<()> {
        match self.store.adjust_listeners(room_id, delta).await {
            // The room vanished under a concurrent cleanup; the count it held
            // is gone with it.
            Err(err) if err.is_benign() => Ok(()),
            other => other,
        }
    }
}

/// Scoped room membership. `release()` is the orderly path; `Drop` covers
/// every other exit by spawning the decrement onto the runtime.
pub struct RoomPresence {
    presence: PresenceStore,
    room_id: RoomId,
    released: AtomicBool,
}

impl RoomPresence {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn release(self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.presence.leave_room(&self.room_id).await {
            warn!(room_id = %self.room_id, "failed to leave room: {err}");
        }
    }
}

impl Drop for RoomPresence {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let presence = self.presence.clone();
        let room_id = self.room_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = presence.leave_room(&room_id).await {
                        warn!(room_id = %room_id, "failed to leave room on drop: {err}");
                    }
                });
            }
            Err(_) => warn!(
                room_id = %room_id,
                "room presence dropped outside a runtime; listener count will drift"
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
