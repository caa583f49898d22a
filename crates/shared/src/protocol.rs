use serde::{Deserialize, Serialize};

use crate::domain::CurrentSong;

/// Messages the client pushes over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundCommand {
    GetCurrentSong,
    StartCurrentSongPolling { interval: u64 },
    StopCurrentSongPolling,
}

/// Messages the server pushes to the client, discriminated by `action` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundMessage {
    CurrentSongUpdate {
        #[serde(default)]
        song: Option<CurrentSong>,
    },
    CurrentSongResponse {
        #[serde(default)]
        song: Option<CurrentSong>,
    },
    PollingStarted {
        interval: u64,
    },
}

impl InboundMessage {
    /// The dispatch key used by the connection manager's handler registry.
    pub fn action(&self) -> &'static str {
        match self {
            InboundMessage::CurrentSongUpdate { .. } => "current_song_update",
            InboundMessage::CurrentSongResponse { .. } => "current_song_response",
            InboundMessage::PollingStarted { .. } => "polling_started",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenRefreshRequest {
    pub refresh_token: String,
}

/// Token endpoint response; providers either return a relative `expires_in`
/// or an absolute `expires_at` (epoch seconds), and may rotate the refresh
/// token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileImage {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub images: Vec<ProfileImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeekRequest {
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeekResponse {
    pub seeked_to_readable: String,
}

/// One-shot now-playing response from the HTTP fallback endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentSongHttpResponse {
    #[serde(default, flatten)]
    pub song: Option<CurrentSong>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_messages_parse_by_action_tag() {
        let raw = r#"{"action":"polling_started","interval":5}"#;
        let msg: InboundMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg, InboundMessage::PollingStarted { interval: 5 });
        assert_eq!(msg.action(), "polling_started");
    }

    #[test]
    fn current_song_update_tolerates_missing_song() {
        let raw = r#"{"action":"current_song_update"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg, InboundMessage::CurrentSongUpdate { song: None });
    }

    #[test]
    fn outbound_commands_serialize_with_action_tag() {
        let raw = serde_json::to_string(&OutboundCommand::StartCurrentSongPolling { interval: 3 })
            .expect("serialize");
        assert_eq!(
            raw,
            r#"{"action":"start_current_song_polling","interval":3}"#
        );
    }
}
