//! Credential lifecycle: owns the access/refresh token pair and its expiry,
//! serializes refreshes, and persists rotated state.

use chrono::{Duration, TimeZone, Utc};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{info, warn};

use shared::{
    domain::{Session, UserId},
    error::SessionError,
    protocol::{TokenRefreshRequest, TokenRefreshResponse},
};
use storage::Storage;

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Sole owner of the [`Session`]; every component that needs a token asks for
/// one here instead of caching its own copy.
pub struct CredentialManager {
    http: Client,
    auth_base_url: String,
    storage: Storage,
    session: Mutex<Option<Session>>,
    // Serializes refreshes: providers reject a refresh token presented twice,
    // so concurrent expired callers must coalesce into one network call.
    refresh_gate: Mutex<()>,
}

impl CredentialManager {
    pub fn new(auth_base_url: impl Into<String>, storage: Storage) -> Self {
        Self {
            http: Client::new(),
            auth_base_url: auth_base_url.into(),
            storage,
            session: Mutex::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Loads the persisted session, if any. Returns whether one was restored.
    pub async fn restore(&self) -> anyhow::Result<bool> {
        let restored = self.storage.load_session().await?;
        let found = restored.is_some();
        *self.session.lock().await = restored;
        Ok(found)
    }

    /// Installs a freshly authorized session and persists it.
    pub async fn install(&self, session: Session) -> anyhow::Result<()> {
        self.storage.save_session(&session).await?;
        *self.session.lock().await = Some(session);
        Ok(())
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    pub async fn user_id(&self) -> Result<UserId, SessionError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.user_id.clone())
            .ok_or(SessionError::NotLoggedIn)
    }

    /// Returns an access token that is valid right now, refreshing first when
    /// the persisted one has expired. Exactly one refresh is in flight at a
    /// time; concurrent callers await its result.
    pub async fn get_valid_token(&self) -> Result<String, SessionError> {
        if let Some(token) = self.unexpired_access_token().await {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;
        // A caller that was queued behind the winning refresh sees the fresh
        // token here and returns without a second network call.
        if let Some(token) = self.unexpired_access_token().await {
            return Ok(token);
        }

        self.refresh_locked().await
    }

    /// Drops the session and wipes all persisted credential state.
    pub async fn logout(&self) {
        *self.session.lock().await = None;
        if let Err(err) = self.storage.clear().await {
            warn!("failed to clear persisted credentials on logout: {err}");
        }
    }

    async fn unexpired_access_token(&self) -> Option<String> {
        let guard = self.session.lock().await;
        let session = guard.as_ref()?;
        if session.expired(Utc::now()) {
            return None;
        }
        Some(session.access_token.clone())
    }

    async fn refresh_locked(&self) -> Result<String, SessionError> {
        let (user_id, refresh_token) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(SessionError::NotLoggedIn)?;
            (session.user_id.clone(), session.refresh_token.clone())
        };

        let response = self
            .http
            .post(format!("{}/auth/refresh", self.auth_base_url))
            .json(&TokenRefreshRequest {
                refresh_token: refresh_token.clone(),
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| {
                warn!(user_id = %user_id, "token refresh failed: {err}");
                SessionError::AuthExpired
            })?;

        let body: TokenRefreshResponse = response.json().await.map_err(|err| {
            warn!(user_id = %user_id, "token refresh returned invalid body: {err}");
            SessionError::AuthExpired
        })?;

        let expires_at = match (body.expires_at, body.expires_in) {
            (Some(epoch_secs), _) => Utc
                .timestamp_opt(epoch_secs, 0)
                .single()
                .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS)),
            (None, Some(secs)) => Utc::now() + Duration::seconds(secs),
            (None, None) => Utc::now() + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
        };

        let refreshed = Session {
            user_id: user_id.clone(),
            access_token: body.access_token.clone(),
            // Providers may rotate the refresh token; keep the old one when
            // they do not.
            refresh_token: body.refresh_token.unwrap_or(refresh_token),
            expires_at,
        };

        if let Err(err) = self.storage.save_session(&refreshed).await {
            warn!(user_id = %user_id, "failed to persist refreshed credentials: {err}");
        }

        *self.session.lock().await = Some(refreshed);
        info!(user_id = %user_id, "access token refreshed");
        Ok(body.access_token)
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
