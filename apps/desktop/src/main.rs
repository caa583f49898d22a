use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use tracing::info;

use client_core::{
    config::load_settings, docstore::MemoryDocumentStore, ListenSession, SessionEvent,
};
use shared::domain::{RoomId, Session, UserId};
use storage::Storage;

/// Joins a listening room, posts an optional comment, and prints session
/// events until interrupted.
#[derive(Parser, Debug)]
struct Args {
    /// Room to join, keyed by the media item id.
    #[arg(long)]
    room: String,
    /// User id for a fresh login; ignored when a persisted session exists.
    #[arg(long)]
    user: Option<String>,
    /// Access token for a fresh login.
    #[arg(long)]
    access_token: Option<String>,
    /// Refresh token for a fresh login.
    #[arg(long)]
    refresh_token: Option<String>,
    /// Comment to post after joining.
    #[arg(long)]
    comment: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings();
    let storage = Storage::new(&settings.database_url).await?;
    let session = ListenSession::new(settings, storage, MemoryDocumentStore::new()).await;

    if session.restore().await? {
        info!("restored persisted session");
    } else {
        let (Some(user), Some(access_token), Some(refresh_token)) =
            (args.user, args.access_token, args.refresh_token)
        else {
            bail!("no persisted session; pass --user, --access-token and --refresh-token");
        };
        session
            .login_with(Session {
                user_id: UserId::from(user),
                access_token,
                refresh_token,
                expires_at: Utc::now() + Duration::hours(1),
            })
            .await?;
        info!("logged in");
    }

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ConnectionChanged(state) => println!("connection: {state:?}"),
                SessionEvent::CurrentSongUpdated(Some(song)) => println!(
                    "now playing: {} - {} ({}ms)",
                    song.track.artist, song.track.name, song.progress_ms
                ),
                SessionEvent::CurrentSongUpdated(None) => println!("nothing playing"),
                SessionEvent::PollingStarted { interval } => {
                    println!("polling every {interval}s")
                }
                SessionEvent::CommentsUpdated { comments, .. } => {
                    for comment in &comments {
                        println!(
                            "  [{}] {} (likes: {})",
                            comment.author_id,
                            comment.content,
                            comment.liked_by.len()
                        );
                    }
                }
                SessionEvent::ListenersUpdated { listeners, .. } => {
                    println!("listeners: {listeners}")
                }
                SessionEvent::Offline { attempts } => {
                    println!("offline after {attempts} attempts")
                }
                SessionEvent::SessionExpired => println!("session expired; log in again"),
                SessionEvent::Notice(text) => println!("notice: {text}"),
            }
        }
    });

    session.connect().await;
    session.start_polling().await;

    let room_id = RoomId::from(args.room);
    let handle = session.join_room(&room_id).await?;
    if let Some(content) = args.comment {
        session.post_comment(&room_id, content, None).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.leave().await;
    session.disconnect().await;
    Ok(())
}
