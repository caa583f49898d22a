use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(CommentId);

/// A client's authenticated identity plus its credential pair and expiry.
///
/// Owned by the credential manager and persisted across restarts; every other
/// component borrows tokens through that manager rather than holding copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// The synchronization unit keyed by a media item id.
///
/// `comment_ids` references comment documents in insertion order; comments are
/// never embedded. `listeners` is stored signed because the defensive
/// leave-without-enter path can legitimately drive it to -1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDoc {
    pub room_id: RoomId,
    pub comment_ids: Vec<CommentId>,
    pub listeners: i64,
    pub created_at: DateTime<Utc>,
}

impl RoomDoc {
    /// Display-facing listener count, clamped at zero.
    pub fn listener_count(&self) -> u64 {
        self.listeners.max(0) as u64
    }
}

/// An authored remark, optionally anchored to an offset within the media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentDoc {
    pub id: CommentId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub liked_by: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<i64>,
}

impl CommentDoc {
    pub fn liked_by_contains(&self, user_id: &UserId) -> bool {
        self.liked_by.iter().any(|id| id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,
    pub duration_ms: i64,
}

/// The media item a session is currently playing, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentSong {
    pub track: TrackInfo,
    pub progress_ms: i64,
    pub is_playing: bool,
}
