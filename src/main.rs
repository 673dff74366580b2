use std::sync::Arc;

use clap::Parser;
use futures_util::StreamExt;
use langcache::clock::SystemClock;
use langcache::config::{Cli, Config, default_config_dir, default_config_path};
use langcache::db::Database;
use langcache::remote::HttpRemote;
use langcache::sync::{SyncSettings, SyncState, Synchronizer};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

async fn sync_pass(sync: &Synchronizer, user_id: Option<&str>) -> bool {
    let mut ok = true;

    if let Err(e) = sync.sync_languages().await {
        tracing::warn!(error = %e, "language sync failed, cached data stays available");
        ok = false;
    }

    if let Some(user_id) = user_id {
        if let Err(e) = sync.sync_bookmarks(user_id).await {
            tracing::warn!(error = %e, user = user_id, "bookmark sync failed");
            ok = false;
        }
    }

    ok
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    // --config puts data next to the config file, otherwise ~/.langcache holds both
    let (config_path, data_dir) = match args.config_path {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            (path, dir)
        }
        None => {
            let dir = default_config_dir();
            (default_config_path(), dir)
        }
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("langcache starting");

    let cfg = Config::new(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });
    let db = Arc::new(Database::new(&cfg, &data_dir).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup database");
        std::process::exit(1);
    }));
    let remote = Arc::new(HttpRemote::from_config(&cfg.remote).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup remote client");
        std::process::exit(1);
    }));

    let sync = Synchronizer::new(db, remote, Arc::new(SystemClock), SyncSettings::from(&cfg.sync));
    let user_id = args.user_id.as_deref();

    let ok = sync_pass(&sync, user_id).await;
    match sync.is_offline_ready().await {
        Ok(ready) => tracing::info!(offline_ready = ready, "initial sync finished"),
        Err(e) => {
            tracing::error!(error = %e, "local cache unreadable");
            std::process::exit(1);
        }
    }

    if args.once {
        std::process::exit(if ok { 0 } else { 2 });
    }

    let cancellation_token = CancellationToken::new();

    let mut states = sync.watch_state();
    let state_token = cancellation_token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let SyncState::Error(message) = &*states.borrow_and_update() {
                        tracing::warn!(%message, "sync state is error");
                    }
                }
                _ = state_token.cancelled() => break,
            }
        }
    });

    let mut languages = sync.live_queries().languages();
    let snapshot_token = cancellation_token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                snapshot = languages.next() => match snapshot {
                    Some(Ok(snapshot)) => tracing::info!(count = snapshot.len(), "cached languages"),
                    Some(Err(e)) => tracing::error!(error = %e, "failed to read cached languages"),
                    None => break,
                },
                _ = snapshot_token.cancelled() => break,
            }
        }
    });

    sync.start_periodic_sync();

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    }
    tracing::info!("ctrl+c signal received, preparing to shutdown");
    cancellation_token.cancel();

    if let Some(handle) = sync.stop_sync() {
        let _ = handle.await;
    }
    tracing::info!("langcache going off, graceful shutdown complete");
}
