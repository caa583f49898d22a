use super::*;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::DateTime;
use tokio::net::TcpListener;

async fn temp_storage(tag: &str) -> Storage {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("credentials-{tag}-{nanos}.sqlite3"));
    Storage::new(&format!("sqlite://{}", path.display()))
        .await
        .expect("temp storage")
}

fn session_expiring_at(expires_at: DateTime<Utc>) -> Session {
    Session {
        user_id: UserId::from("user-1"),
        access_token: "old-token".to_string(),
        refresh_token: "refresh-1".to_string(),
        expires_at,
    }
}

#[derive(Clone)]
struct RefreshServerState {
    calls: Arc<AtomicU32>,
    status: StatusCode,
    rotate_refresh: bool,
}

async fn handle_refresh(
    State(state): State<RefreshServerState>,
    Json(_request): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let call = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if state.status != StatusCode::OK {
        return (state.status, Json(serde_json::json!({})));
    }
    let mut body = serde_json::json!({
        "access_token": format!("fresh-{call}"),
        "expires_in": 3600,
    });
    if state.rotate_refresh {
        body["refresh_token"] = serde_json::json!("rotated-refresh");
    }
    (StatusCode::OK, Json(body))
}

async fn spawn_refresh_server(status: StatusCode, rotate_refresh: bool) -> (String, Arc<AtomicU32>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let calls = Arc::new(AtomicU32::new(0));
    let state = RefreshServerState {
        calls: Arc::clone(&calls),
        status,
        rotate_refresh,
    };
    let app = Router::new()
        .route("/auth/refresh", post(handle_refresh))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), calls)
}

#[tokio::test]
async fn unexpired_token_is_returned_without_a_network_call() {
    // Unroutable refresh endpoint; hitting it would fail the test.
    let storage = temp_storage("no-refresh").await;
    let manager = CredentialManager::new("http://127.0.0.1:9", storage);
    manager
        .install(session_expiring_at(Utc::now() + Duration::hours(1)))
        .await
        .expect("install");

    let token = manager.get_valid_token().await.expect("token");
    assert_eq!(token, "old-token");
}

#[tokio::test]
async fn concurrent_expired_callers_coalesce_into_one_refresh() {
    let (base_url, calls) = spawn_refresh_server(StatusCode::OK, false).await;
    let storage = temp_storage("single-flight").await;
    let manager = Arc::new(CredentialManager::new(base_url, storage));
    manager
        .install(session_expiring_at(Utc::now() - Duration::hours(1)))
        .await
        .expect("install");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(
            async move { manager.get_valid_token().await },
        ));
    }
    for handle in handles {
        let token = handle.await.expect("join").expect("token");
        assert_eq!(token, "fresh-1");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_rotates_the_refresh_token_and_persists_it() {
    let (base_url, _calls) = spawn_refresh_server(StatusCode::OK, true).await;
    let storage = temp_storage("rotate").await;
    let manager = CredentialManager::new(base_url, storage.clone());
    manager
        .install(session_expiring_at(Utc::now() - Duration::hours(1)))
        .await
        .expect("install");

    let token = manager.get_valid_token().await.expect("token");
    assert_eq!(token, "fresh-1");

    let live = manager.current_session().await.expect("session");
    assert_eq!(live.refresh_token, "rotated-refresh");
    assert!(!live.expired(Utc::now()));

    let persisted = storage
        .load_session()
        .await
        .expect("load")
        .expect("persisted");
    assert_eq!(persisted.access_token, "fresh-1");
    assert_eq!(persisted.refresh_token, "rotated-refresh");
}

#[tokio::test]
async fn refresh_keeps_the_old_refresh_token_when_none_is_returned() {
    let (base_url, _calls) = spawn_refresh_server(StatusCode::OK, false).await;
    let storage = temp_storage("keep-refresh").await;
    let manager = CredentialManager::new(base_url, storage);
    manager
        .install(session_expiring_at(Utc::now() - Duration::hours(1)))
        .await
        .expect("install");

    manager.get_valid_token().await.expect("token");
    let live = manager.current_session().await.expect("session");
    assert_eq!(live.refresh_token, "refresh-1");
}

#[tokio::test]
async fn rejected_refresh_is_auth_expired() {
    let (base_url, _calls) = spawn_refresh_server(StatusCode::UNAUTHORIZED, false).await;
    let storage = temp_storage("rejected").await;
    let manager = CredentialManager::new(base_url, storage);
    manager
        .install(session_expiring_at(Utc::now() - Duration::hours(1)))
        .await
        .expect("install");

    let err = manager.get_valid_token().await.expect_err("must fail");
    assert!(matches!(err, SessionError::AuthExpired));
}

#[tokio::test]
async fn token_request_without_a_session_is_not_logged_in() {
    let storage = temp_storage("no-session").await;
    let manager = CredentialManager::new("http://127.0.0.1:9", storage);
    let err = manager.get_valid_token().await.expect_err("must fail");
    assert!(matches!(err, SessionError::NotLoggedIn));
}

#[tokio::test]
async fn restore_loads_the_persisted_session() {
    let storage = temp_storage("restore").await;
    {
        let manager = CredentialManager::new("http://127.0.0.1:9", storage.clone());
        manager
            .install(session_expiring_at(Utc::now() + Duration::hours(1)))
            .await
            .expect("install");
    }

    let manager = CredentialManager::new("http://127.0.0.1:9", storage);
    assert!(manager.restore().await.expect("restore"));
    assert_eq!(manager.user_id().await.expect("user"), UserId::from("user-1"));
}

#[tokio::test]
async fn logout_drops_the_session_and_wipes_storage() {
    let storage = temp_storage("logout").await;
    let manager = CredentialManager::new("http://127.0.0.1:9", storage.clone());
    manager
        .install(session_expiring_at(Utc::now() + Duration::hours(1)))
        .await
        .expect("install");

    manager.logout().await;
    assert!(manager.current_session().await.is_none());
    assert!(storage.load_session().await.expect("load").is_none());
}
