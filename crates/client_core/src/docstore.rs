//! Interface to the external document store holding the `rooms` and
//! `comments` collections, plus an in-process implementation used by tests
//! and the demo app.
//!
//! The store is the single source of truth: every other component treats its
//! own copies as caches that a subscription may overwrite at any time.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use shared::{
    domain::{CommentDoc, CommentId, RoomDoc, RoomId, UserId},
    error::StoreError,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// State of a single watched room document; `None` means absent or deleted.
pub type RoomSnapshot = Option<RoomDoc>;

#[derive(Debug, Clone)]
pub struct NewComment {
    pub author_id: UserId,
    pub content: String,
    pub time_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeOp {
    Add,
    Remove,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_room(&self, room_id: &RoomId) -> StoreResult<Option<RoomDoc>>;

    /// Creates or replaces the room document.
    async fn put_room(&self, room: RoomDoc) -> StoreResult<()>;

    /// Atomic delta against the listener counter. Must not be implemented as
    /// read-then-write; concurrent enters/leaves on one room are the common
    /// case. `NotFound` when the room document is absent.
    async fn adjust_listeners(&self, room_id: &RoomId, delta: i64) -> StoreResult<()>;

    /// Appends a comment id to the room's ordered reference list (set
    /// semantics: an id already present is not duplicated).
    async fn append_comment_ref(&self, room_id: &RoomId, comment_id: &CommentId)
        -> StoreResult<()>;

    /// Replaces the room's comment reference list wholesale.
    async fn set_comment_refs(
        &self,
        room_id: &RoomId,
        comment_ids: Vec<CommentId>,
    ) -> StoreResult<()>;

    /// Idempotent: deleting an absent room succeeds.
    async fn delete_room(&self, room_id: &RoomId) -> StoreResult<()>;

    /// Creates a comment document with a store-assigned id and timestamp.
    async fn insert_comment(&self, comment: NewComment) -> StoreResult<CommentDoc>;

    async fn get_comment(&self, comment_id: &CommentId) -> StoreResult<Option<CommentDoc>>;

    async fn update_liked_by(
        &self,
        comment_id: &CommentId,
        user_id: &UserId,
        op: LikeOp,
    ) -> StoreResult<()>;

    async fn delete_comment(&self, comment_id: &CommentId) -> StoreResult<()>;

    /// Live subscription to one room document. The receiver observes every
    /// committed change to that document in the order the store applied them;
    /// there is no ordering guarantee across rooms.
    async fn watch_room(&self, room_id: &RoomId) -> StoreResult<broadcast::Receiver<RoomSnapshot>>;
}

const WATCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Collections {
    rooms: HashMap<RoomId, RoomDoc>,
    comments: HashMap<CommentId, CommentDoc>,
    watchers: HashMap<RoomId, broadcast::Sender<RoomSnapshot>>,
}

impl Collections {
    fn publish(&mut self, room_id: &RoomId) {
        if let Some(tx) = self.watchers.get(room_id) {
            let _ = tx.send(self.rooms.get(room_id).cloned());
        }
    }
}

/// In-memory document store with the same observable semantics as the hosted
/// backend: atomic deltas, per-document subscriptions, store-assigned ids.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<Collections>,
}

impl MemoryDocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_room(&self, room_id: &RoomId) -> StoreResult<Option<RoomDoc>> {
        Ok(self.inner.lock().await.rooms.get(room_id).cloned())
    }

    async fn put_room(&self, room: RoomDoc) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let room_id = room.room_id.clone();
        inner.rooms.insert(room_id.clone(), room);
        inner.publish(&room_id);
        Ok(())
    }

    async fn adjust_listeners(&self, room_id: &RoomId, delta: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let room = inner.rooms.get_mut(room_id).ok_or(StoreError::NotFound)?;
        room.listeners += delta;
        inner.publish(room_id);
        Ok(())
    }

    async fn append_comment_ref(
        &self,
        room_id: &RoomId,
        comment_id: &CommentId,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let room = inner.rooms.get_mut(room_id).ok_or(StoreError::NotFound)?;
        if !room.comment_ids.iter().any(|id| id == comment_id) {
            room.comment_ids.push(comment_id.clone());
        }
        inner.publish(room_id);
        Ok(())
    }

    async fn set_comment_refs(
        &self,
        room_id: &RoomId,
        comment_ids: Vec<CommentId>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let room = inner.rooms.get_mut(room_id).ok_or(StoreError::NotFound)?;
        room.comment_ids = comment_ids;
        inner.publish(room_id);
        Ok(())
    }

    async fn delete_room(&self, room_id: &RoomId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.rooms.remove(room_id).is_some() {
            inner.publish(room_id);
        }
        Ok(())
    }

    async fn insert_comment(&self, comment: NewComment) -> StoreResult<CommentDoc> {
        let doc = CommentDoc {
            id: CommentId(Uuid::new_v4().to_string()),
            author_id: comment.author_id,
            content: comment.content,
            created_at: Utc::now(),
            liked_by: Vec::new(),
            time_ms: comment.time_ms,
        };
        self.inner
            .lock()
            .await
            .comments
            .insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn get_comment(&self, comment_id: &CommentId) -> StoreResult<Option<CommentDoc>> {
        Ok(self.inner.lock().await.comments.get(comment_id).cloned())
    }

    async fn update_liked_by(
        &self,
        comment_id: &CommentId,
        user_id: &UserId,
        op: LikeOp,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let comment = inner
            .comments
            .get_mut(comment_id)
            .ok_or(StoreError::NotFound)?;
        match op {
            LikeOp::Add => {
                if !comment.liked_by.iter().any(|id| id == user_id) {
                    comment.liked_by.push(user_id.clone());
                }
            }
            LikeOp::Remove => comment.liked_by.retain(|id| id != user_id),
        }
        Ok(())
    }

    async fn delete_comment(&self, comment_id: &CommentId) -> StoreResult<()> {
        self.inner.lock().await.comments.remove(comment_id);
        Ok(())
    }

    async fn watch_room(&self, room_id: &RoomId) -> StoreResult<broadcast::Receiver<RoomSnapshot>> {
        let mut inner = self.inner.lock().await;
        let tx = inner
            .watchers
            .entry(room_id.clone())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

#[cfg(test)]
#[path = "tests/docstore_tests.rs"]
mod tests;
