//! Comment aggregation: keeps a room's ordered comment-id index and the
//! comment documents it references mutually consistent under concurrent
//! add/remove/like traffic, without a transactional store.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{CommentDoc, CommentId, RoomDoc, RoomId, UserId},
    error::SessionError,
};

use crate::docstore::{DocumentStore, LikeOp, NewComment, RoomSnapshot, StoreResult};

/// Resolved view of one room: its comments in index order plus the clamped
/// listener count, as published to feed subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomView {
    pub comments: Vec<CommentDoc>,
    pub listeners: u64,
}

impl RoomView {
    fn empty() -> Self {
        Self {
            comments: Vec::new(),
            listeners: 0,
        }
    }
}

#[derive(Clone)]
pub struct CommentService {
    store: Arc<dyn DocumentStore>,
}

impl CommentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Creates the comment document first, then ensures the room references
    /// it: create-with-id when the room is absent, append otherwise. An
    /// interruption between the two steps leaves an orphan comment, which is
    /// tolerated (removal deletes by id and cleanup never depends on the
    /// index being complete).
    pub async fn post_comment(
        &self,
        room_id: &RoomId,
        author_id: &UserId,
        content: impl Into<String>,
        time_ms: Option<i64>,
    ) -> StoreResult<CommentDoc> {
        let comment = self
            .store
            .insert_comment(NewComment {
                author_id: author_id.clone(),
                content: content.into(),
                time_ms,
            })
            .await?;

        match self.store.get_room(room_id).await? {
            None => {
                self.store
                    .put_room(RoomDoc {
                        room_id: room_id.clone(),
                        comment_ids: vec![comment.id.clone()],
                        listeners: 0,
                        created_at: Utc::now(),
                    })
                    .await?;
            }
            Some(_) => {
                if let Err(err) = self.store.append_comment_ref(room_id, &comment.id).await {
                    if !err.is_benign() {
                        return Err(err);
                    }
                    // The room vanished between the read and the append;
                    // recreate it around the new comment.
                    self.store
                        .put_room(RoomDoc {
                            room_id: room_id.clone(),
                            comment_ids: vec![comment.id.clone()],
                            listeners: 0,
                            created_at: Utc::now(),
                        })
                        .await?;
                }
            }
        }

        info!(room_id = %room_id, comment_id = %comment.id, "comment posted");
        Ok(comment)
    }

    /// Adds or removes `user_id` in the comment's `liked_by` set. A vanished
    /// target is a benign no-op; the optimistic-update rollback belongs to
    /// the caller.
    pub async fn toggle_like(
        &self,
        comment_id: &CommentId,
        user_id: &UserId,
        currently_liked: bool,
    ) -> StoreResult<()> {
        let op = if currently_liked {
            LikeOp::Remove
        } else {
            LikeOp::Add
        };
        match self.store.update_liked_by(comment_id, user_id, op).await {
            Err(err) if err.is_benign() => Ok(()),
            other => other,
        }
    }

    /// Author-only removal. The index entry is detached before the comment
    /// document is destroyed so a concurrent subscriber does not resolve a
    /// dangling id in the normal case; the feed's tombstone tolerance covers
    /// the residual race. Deleting the last referenced comment deletes the
    /// room document immediately.
    pub async fn remove_comment(
        &self,
        room_id: &RoomId,
        comment_id: &CommentId,
        requested_by: &UserId,
    ) -> Result<(), SessionError> {
        if let Some(comment) = self.store.get_comment(comment_id).await? {
            if &comment.author_id != requested_by {
                return Err(SessionError::NotCommentAuthor {
                    user_id: requested_by.to_string(),
                    comment_id: comment_id.to_string(),
                });
            }
        }

        if let Some(room) = self.store.get_room(room_id).await? {
            let remaining: Vec<CommentId> = room
                .comment_ids
                .iter()
                .filter(|id| *id != comment_id)
                .cloned()
                .collect();

            if remaining.is_empty() {
                self.store.delete_room(room_id).await?;
                info!(room_id = %room_id, "room deleted with its last comment");
            } else if remaining.len() != room.comment_ids.len() {
                if let Err(err) = self.store.set_comment_refs(room_id, remaining).await {
                    if !err.is_benign() {
                        return Err(err.into());
                    }
                }
            }
        }

        // Delete by id directly so an orphaned comment never blocks cleanup.
        match self.store.delete_comment(comment_id).await {
            Err(err) if err.is_benign() => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    /// Live ordered comment sequence for one room. The feed task re-resolves
    /// the full index on every room change and is aborted when the returned
    /// feed is dropped.
    pub fn subscribe(&self, room_id: RoomId) -> CommentFeed {
        let store = Arc::clone(&self.store);
        let (tx, updates) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut watch = match store.watch_room(&room_id).await {
                Ok(watch) => watch,
                Err(err) => {
                    warn!(room_id = %room_id, "failed to watch room: {err}");
                    return;
                }
            };

            // Initial snapshot so a subscriber established after the post
            // still observes the current state.
            let initial = store.get_room(&room_id).await.ok().flatten();
            if publish_snapshot(store.as_ref(), &room_id, initial, &tx)
                .await
                .is_err()
            {
                return;
            }

            loop {
                match watch.recv().await {
                    Ok(snapshot) => {
                        if publish_snapshot(store.as_ref(), &room_id, snapshot, &tx)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(room_id = %room_id, skipped, "room watch lagged; re-reading");
                        let current = store.get_room(&room_id).await.ok().flatten();
                        if publish_snapshot(store.as_ref(), &room_id, current, &tx)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        CommentFeed { updates, task }
    }
}

/// Resolves a room snapshot into a published [`RoomView`]. Ids whose comment
/// document no longer resolves are dropped (tombstone tolerance). Observing
/// an empty index triggers the reactive cleanup: whichever client's feed sees
/// the empty list deletes the now-pointless room document; the delete is
/// idempotent so racing cleanups are harmless.
async fn publish_snapshot(
    store: &dyn DocumentStore,
    room_id: &RoomId,
    snapshot: RoomSnapshot,
    tx: &mpsc::UnboundedSender<RoomView>,
) -> Result<(), mpsc::error::SendError<RoomView>> {
    let Some(room) = snapshot else {
        return tx.send(RoomView::empty());
    };

    if room.comment_ids.is_empty() {
        if let Err(err) = store.delete_room(room_id).await {
            if !err.is_benign() {
                warn!(room_id = %room_id, "failed to clean up empty room: {err}");
            }
        }
        return tx.send(RoomView {
            comments: Vec::new(),
            listeners: room.listener_count(),
        });
    }

    let fetched = join_all(room.comment_ids.iter().map(|id| store.get_comment(id))).await;
    let comments = fetched
        .into_iter()
        .filter_map(|result| result.ok().flatten())
        .collect();

    tx.send(RoomView {
        comments,
        listeners: room.listener_count(),
    })
}

/// Handle to a live room subscription; dropping it cancels the feed task.
pub struct CommentFeed {
    updates: mpsc::UnboundedReceiver<RoomView>,
    task: JoinHandle<()>,
}

impl CommentFeed {
    pub async fn next(&mut self) -> Option<RoomView> {
        self.updates.recv().await
    }
}

impl Drop for CommentFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/comments_tests.rs"]
mod tests;
