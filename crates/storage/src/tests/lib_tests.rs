use super::*;
use chrono::Duration;
use shared::protocol::ProfileImage;

fn sample_session() -> Session {
    Session {
        user_id: UserId("user-1".into()),
        access_token: "access-abc".into(),
        refresh_token: "refresh-xyz".into(),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn round_trips_persisted_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = sample_session();
    storage.save_session(&session).await.expect("save");

    let loaded = storage
        .load_session()
        .await
        .expect("load")
        .expect("session present");
    assert_eq!(loaded.user_id, session.user_id);
    assert_eq!(loaded.access_token, session.access_token);
    assert_eq!(loaded.refresh_token, session.refresh_token);
    assert_eq!(
        loaded.expires_at.timestamp_millis(),
        session.expires_at.timestamp_millis()
    );
}

#[tokio::test]
async fn save_session_overwrites_the_single_slot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session(&sample_session())
        .await
        .expect("first save");

    let mut rotated = sample_session();
    rotated.access_token = "access-rotated".into();
    rotated.refresh_token = "refresh-rotated".into();
    storage.save_session(&rotated).await.expect("second save");

    let loaded = storage
        .load_session()
        .await
        .expect("load")
        .expect("session present");
    assert_eq!(loaded.access_token, "access-rotated");
    assert_eq!(loaded.refresh_token, "refresh-rotated");
}

#[tokio::test]
async fn load_session_is_none_when_absent() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage.load_session().await.expect("load").is_none());
}

#[tokio::test]
async fn round_trips_cached_profile() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let profile = UserProfile {
        id: "user-1".into(),
        display_name: "Alice".into(),
        images: vec![ProfileImage {
            url: "https://img.example/alice.png".into(),
            width: Some(64),
            height: Some(64),
        }],
    };
    storage.save_profile(&profile).await.expect("save");

    let loaded = storage
        .load_profile(&UserId("user-1".into()))
        .await
        .expect("load")
        .expect("profile present");
    assert_eq!(loaded.display_name, "Alice");
    assert_eq!(loaded.images.len(), 1);
}

#[tokio::test]
async fn clear_removes_session_and_profiles() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_session(&sample_session())
        .await
        .expect("save session");
    storage
        .save_profile(&UserProfile {
            id: "user-1".into(),
            display_name: "Alice".into(),
            images: Vec::new(),
        })
        .await
        .expect("save profile");

    storage.clear().await.expect("clear");

    assert!(storage.load_session().await.expect("load").is_none());
    assert!(storage
        .load_profile(&UserId("user-1".into()))
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("session_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
