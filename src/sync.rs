use crate::clock::Clock;
use crate::config;
use crate::db::Database;
use crate::error::{RemoteError, SyncError};
use crate::model::{CachedBookmark, CachedLanguage};
use crate::observe::LiveQueries;
use crate::remote::RemoteSource;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const LANGUAGES_KEY: &str = "languages";

/// Current phase of the sync cycle. `Success` and `Error` fall back to `Syncing` on the next
/// trigger; nothing here is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Success,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub sync_interval: Duration,
    pub cache_validity: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30 * 60),
            cache_validity: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&config::Schedule> for SyncSettings {
    fn from(schedule: &config::Schedule) -> Self {
        Self {
            sync_interval: Duration::from_secs(schedule.interval_seconds),
            cache_validity: Duration::from_secs(schedule.cache_validity_seconds),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub upserted: usize,
    pub purged: u64,
}

type SyncOutcome = Result<SyncReport, SyncError>;
type Flight = Shared<BoxFuture<'static, SyncOutcome>>;

/// At most one in-flight pass per key. Late callers await the running pass and get its
/// result instead of starting their own.
#[derive(Default)]
struct SingleFlight {
    flights: Arc<Mutex<HashMap<String, Flight>>>,
}

impl SingleFlight {
    async fn run<F>(&self, key: &str, start: F) -> SyncOutcome
    where
        F: FnOnce() -> BoxFuture<'static, SyncOutcome>,
    {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            match flights.get(key) {
                Some(flight) => {
                    tracing::debug!(key, "joining in-flight sync");
                    flight.clone()
                }
                None => {
                    let flight = self.launch(key.to_string(), start());
                    flights.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    // The pass runs on its own task so it finishes and clears its key even if every caller
    // stops waiting.
    fn launch(&self, key: String, work: BoxFuture<'static, SyncOutcome>) -> Flight {
        let flights = self.flights.clone();
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            flights.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            outcome
        });

        handle
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(SyncError::Store(format!("sync task failed: {}", e))),
            })
            .boxed()
            .shared()
    }
}

struct Periodic {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    db: Arc<Database>,
    remote: Arc<dyn RemoteSource>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    state: watch::Sender<SyncState>,
    flights: SingleFlight,
    periodic: Mutex<Option<Periodic>>,
}

/// Keeps the local cache in step with the remote API and serves reads that fall back to
/// the cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteSource>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);

        Self {
            inner: Arc::new(Inner {
                db,
                remote,
                clock,
                settings,
                state,
                flights: SingleFlight::default(),
                periodic: Mutex::new(None),
            }),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn live_queries(&self) -> LiveQueries {
        LiveQueries::new(self.inner.db.clone())
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Spawns the background task that runs `sync_languages` every `sync_interval`,
    /// starting one interval from now, whatever the previous pass returned. The task ends on
    /// `stop_sync` or once the last `Synchronizer` handle is dropped.
    pub fn start_periodic_sync(&self) {
        let mut periodic = self.inner.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if periodic.is_some() {
            tracing::debug!("periodic sync already running");
            return;
        }

        let period = self.inner.settings.sync_interval;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = (Synchronizer { inner }).sync_languages().await {
                            tracing::warn!("periodic sync failed: {}", e);
                        }
                    }
                    _ = task_token.cancelled() => {
                        tracing::info!("periodic sync shutting down");
                        break;
                    }
                }
            }
        });

        tracing::info!(interval_secs = period.as_secs(), "periodic sync started");
        *periodic = Some(Periodic { token, handle });
    }

    /// Cancels the periodic task. Explicit syncs already running are left to finish.
    pub fn stop_sync(&self) -> Option<JoinHandle<()>> {
        let periodic = self
            .inner
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        periodic.token.cancel();
        Some(periodic.handle)
    }

    pub fn is_periodic_running(&self) -> bool {
        self.inner
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub async fn sync_languages(&self) -> Result<SyncReport, SyncError> {
        let inner = self.inner.clone();
        self.inner
            .flights
            .run(LANGUAGES_KEY, move || {
                async move { inner.tracked("languages", inner.pull_languages()).await }.boxed()
            })
            .await
    }

    /// Replaces the cached bookmarks of `user_id` with the remote list. Languages and other
    /// users' bookmarks are not touched.
    pub async fn sync_bookmarks(&self, user_id: &str) -> Result<SyncReport, SyncError> {
        let inner = self.inner.clone();
        let user = user_id.to_string();
        self.inner
            .flights
            .run(&format!("bookmarks:{}", user_id), move || {
                async move { inner.tracked("bookmarks", inner.pull_bookmarks(&user)).await }.boxed()
            })
            .await
    }

    /// Returns the cached language when it is younger than `cache_validity`. Otherwise runs a
    /// full language sync and returns whatever the cache holds afterwards, which may be the
    /// stale copy when the remote is unreachable, or nothing when the id does not exist.
    pub async fn get_language_with_fallback(&self, id: &str) -> Result<Option<CachedLanguage>, SyncError> {
        let inner = &self.inner;

        if let Some(cached) = inner.db.get_language(id).await.map_err(SyncError::store)? {
            if cached.is_fresh(inner.clock.now_millis(), inner.validity_millis()) {
                return Ok(Some(cached));
            }
            tracing::debug!(language = id, "cached language is stale");
        }

        match self.sync_languages().await {
            Ok(_) => {}
            Err(e @ SyncError::Store(_)) => return Err(e),
            Err(SyncError::Remote(e)) => {
                tracing::warn!(language = id, "refresh failed, serving cache: {}", e);
            }
        }

        inner.db.get_language(id).await.map_err(SyncError::store)
    }

    /// Fetches one language from the remote and writes it through. A language the remote no
    /// longer knows is dropped from the cache and reported as `None`.
    pub async fn refresh_language(&self, id: &str) -> Result<Option<CachedLanguage>, SyncError> {
        let inner = &self.inner;

        match inner.remote.fetch_language_by_id(id).await {
            Ok(record) => {
                let cached = record.into_cached(inner.clock.now_millis(), true);
                inner.db.upsert_language(&cached).await.map_err(SyncError::store)?;
                Ok(Some(cached))
            }
            Err(RemoteError::NotFound) => {
                tracing::info!(language = id, "language gone from remote, evicting");
                inner.db.delete_language(id).await.map_err(SyncError::store)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bookmarks `language_id` remotely, then caches the created bookmark. Returns `false`
    /// without calling the remote when it is already bookmarked.
    pub async fn add_bookmark(&self, user_id: &str, language_id: &str) -> Result<bool, SyncError> {
        let inner = &self.inner;

        if inner
            .db
            .is_bookmarked(user_id, language_id)
            .await
            .map_err(SyncError::store)?
        {
            return Ok(false);
        }

        let record = inner.remote.add_bookmark(language_id).await?;
        let mut bookmark: CachedBookmark = record.into_cached(inner.clock.now_millis());
        if bookmark.user_id != user_id {
            tracing::warn!(bookmark = %bookmark.id, owner = %bookmark.user_id, user = user_id, "remote echoed another owner");
            bookmark.user_id = user_id.to_string();
        }
        inner.db.insert_bookmark(&bookmark).await.map_err(SyncError::store)?;
        Ok(true)
    }

    pub async fn remove_bookmark(&self, user_id: &str, language_id: &str) -> Result<(), SyncError> {
        let inner = &self.inner;

        match inner.remote.remove_bookmark(language_id).await {
            Ok(()) | Err(RemoteError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        inner
            .db
            .remove_bookmark(user_id, language_id)
            .await
            .map_err(SyncError::store)
    }

    pub async fn is_offline_ready(&self) -> Result<bool, SyncError> {
        let count = self.inner.db.count_languages().await.map_err(SyncError::store)?;
        Ok(count > 0)
    }

    /// Wipes both cache tables, e.g. on logout.
    pub async fn clear_cache(&self) -> Result<(), SyncError> {
        self.inner.db.clear_all().await.map_err(SyncError::store)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let periodic = self.periodic.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(periodic) = periodic.take() {
            periodic.token.cancel();
        }
    }
}

impl Inner {
    fn validity_millis(&self) -> i64 {
        i64::try_from(self.settings.cache_validity.as_millis()).unwrap_or(i64::MAX)
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    async fn tracked<F>(&self, what: &str, pass: F) -> SyncOutcome
    where
        F: std::future::Future<Output = SyncOutcome>,
    {
        self.set_state(SyncState::Syncing);

        let outcome = pass.await;
        match &outcome {
            Ok(report) => {
                tracing::info!(
                    upserted = report.upserted,
                    purged = report.purged,
                    "{} sync complete",
                    what
                );
                self.set_state(SyncState::Success);
            }
            Err(e) => {
                tracing::warn!("{} sync failed: {}", what, e);
                self.set_state(SyncState::Error(e.to_string()));
            }
        }
        outcome
    }

    async fn pull_languages(&self) -> SyncOutcome {
        let records = self.remote.fetch_languages().await?;

        let now = self.clock.now_millis();
        let languages: Vec<CachedLanguage> = records
            .into_iter()
            .map(|record| record.into_cached(now, true))
            .collect();

        self.db
            .upsert_languages(&languages)
            .await
            .map_err(SyncError::store)?;

        // after the upserts, so this pass never evicts what it just wrote
        let cutoff = now.saturating_sub(self.validity_millis());
        let purged = self.db.purge_older_than(cutoff).await.map_err(SyncError::store)?;

        Ok(SyncReport {
            upserted: languages.len(),
            purged,
        })
    }

    async fn pull_bookmarks(&self, user_id: &str) -> SyncOutcome {
        let records = self.remote.fetch_bookmarks(user_id).await?;

        let now = self.clock.now_millis();
        let bookmarks: Vec<CachedBookmark> = records
            .into_iter()
            .filter(|record| {
                let owned = record.user_id == user_id;
                if !owned {
                    tracing::warn!(bookmark = %record.id, owner = %record.user_id, "skipping foreign bookmark");
                }
                owned
            })
            .map(|record| record.into_cached(now))
            .collect();

        self.db
            .replace_bookmarks_for_user(user_id, &bookmarks)
            .await
            .map_err(SyncError::store)?;

        Ok(SyncReport {
            upserted: bookmarks.len(),
            purged: 0,
        })
    }
}
