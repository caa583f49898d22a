use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base URL of the token-refresh collaborator.
    pub auth_base_url: String,
    /// Base URL of the profile / transport-control / now-playing endpoints.
    pub api_base_url: String,
    /// Persistent-connection endpoint.
    pub ws_url: String,
    /// Client-local credential store.
    pub database_url: String,
    /// Interval passed to `start_current_song_polling`.
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth_base_url: "http://127.0.0.1:8000".into(),
            api_base_url: "http://127.0.0.1:8000".into(),
            ws_url: "ws://127.0.0.1:8000/ws".into(),
            database_url: "sqlite://./data/session.db".into(),
            poll_interval_secs: 3,
        }
    }
}

/// Defaults, overridden by an optional `session.toml`, overridden by env.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("session.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("auth_base_url") {
                settings.auth_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("api_base_url") {
                settings.api_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("ws_url") {
                settings.ws_url = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("poll_interval_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.poll_interval_secs = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("AUTH_BASE_URL") {
        settings.auth_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__AUTH_BASE_URL") {
        settings.auth_base_url = v;
    }

    if let Ok(v) = std::env::var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("WS_URL") {
        settings.ws_url = v;
    }
    if let Ok(v) = std::env::var("APP__WS_URL") {
        settings.ws_url = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("APP__POLL_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_interval_secs = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_endpoints() {
        let settings = Settings::default();
        assert!(settings.ws_url.starts_with("ws://"));
        assert!(settings.database_url.starts_with("sqlite://"));
        assert_eq!(settings.poll_interval_secs, 3);
    }
}
