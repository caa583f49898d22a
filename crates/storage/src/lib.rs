use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{Session, UserId},
    protocol::UserProfile,
};

/// Client-local persistent store for the credential pair and the cached user
/// profile. The document store is the source of truth for everything else;
/// this survives restarts only so a session can resume without a fresh
/// authorization-code exchange.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                slot          INTEGER PRIMARY KEY CHECK (slot = 0),
                user_id       TEXT NOT NULL,
                access_token  TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_expires TEXT NOT NULL,
                updated_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure session table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_profile (
                user_id      TEXT PRIMARY KEY,
                profile_json TEXT NOT NULL,
                updated_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure cached_profile table exists")?;

        Ok(())
    }

    /// Overwrites the single persisted session slot.
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO session (slot, user_id, access_token, refresh_token, token_expires, updated_at)
             VALUES (0, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(slot) DO UPDATE SET
                user_id = excluded.user_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expires = excluded.token_expires,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(session.user_id.as_str())
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(session.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_session(&self) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT user_id, access_token, refresh_token, token_expires FROM session WHERE slot = 0",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_raw: String = row.get(3);
        let expires_at = DateTime::parse_from_rfc3339(&expires_raw)
            .with_context(|| format!("invalid persisted token expiry '{expires_raw}'"))?
            .with_timezone(&Utc);

        Ok(Some(Session {
            user_id: UserId(row.get::<String, _>(0)),
            access_token: row.get(1),
            refresh_token: row.get(2),
            expires_at,
        }))
    }

    pub async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let profile_json =
            serde_json::to_string(profile).context("failed to serialize cached profile")?;
        sqlx::query(
            "INSERT INTO cached_profile (user_id, profile_json, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(user_id) DO UPDATE SET
                profile_json = excluded.profile_json,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&profile.id)
        .bind(profile_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT profile_json FROM cached_profile WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.get(0);
        let profile =
            serde_json::from_str(&raw).context("failed to parse persisted profile json")?;
        Ok(Some(profile))
    }

    /// Logout wipes everything: credential slot and cached profiles.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM session")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM cached_profile")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
    format!(
        "sqlite://{}",
        base_dir.join("session_state.sqlite3").display()
    )
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
