use crate::config::Config;
use crate::model::{CachedBookmark, CachedLanguage};
use anyhow::{Context, Result};
use libsql::{Builder, Connection, Database as LibsqlDatabase, Row};
use std::path::Path;
use tokio::sync::{Mutex, broadcast};

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[("001_schema.sql", include_str!("migrations/001_schema.sql"))];

const EVENT_CAPACITY: usize = 64;

const LANGUAGE_COLUMNS: &str =
    "id, name, summary, ranking, trend_data, resources, images, cached_at, last_synced_at";

// Nulls sort after every ranked language; name and id make ties deterministic.
const LANGUAGE_ORDER: &str = "ORDER BY ranking IS NULL, ranking ASC, name ASC, id ASC";

/// Emitted after a write changes one of the cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    LanguagesChanged,
    BookmarksChanged,
}

/// Durable cache of languages and bookmarks on an embedded libsql database.
///
/// Reads go straight to the connection. Writes are serialized through `tx_lock` so a
/// multi-statement transaction never interleaves with another writer on the shared
/// connection.
pub struct Database {
    _db: LibsqlDatabase,
    conn: Connection,
    tx_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl Database {
    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self> {
        Self::open(data_dir.join(cfg.app.get_db())).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Database {
            _db: db,
            conn,
            tx_lock: Mutex::new(()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    fn row_to_language(row: &Row) -> Result<CachedLanguage> {
        Ok(CachedLanguage {
            id: row.get(0)?,
            name: row.get(1)?,
            summary: row.get::<Option<String>>(2)?,
            ranking: row.get::<Option<i64>>(3)?,
            trend_data: row.get::<Option<String>>(4)?,
            resources: row.get::<Option<String>>(5)?,
            images: row.get::<Option<String>>(6)?,
            cached_at: row.get(7)?,
            last_synced_at: row.get::<Option<i64>>(8)?,
        })
    }

    fn row_to_bookmark(row: &Row) -> Result<CachedBookmark> {
        Ok(CachedBookmark {
            id: row.get(0)?,
            user_id: row.get(1)?,
            language_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    async fn write_language(&self, language: &CachedLanguage) -> Result<()> {
        let query = r#"
            INSERT OR REPLACE INTO languages
                (id, name, summary, ranking, trend_data, resources, images, cached_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;

        self.conn
            .execute(
                query,
                libsql::params![
                    language.id.as_str(),
                    language.name.as_str(),
                    language.summary.as_deref(),
                    language.ranking,
                    language.trend_data.as_deref(),
                    language.resources.as_deref(),
                    language.images.as_deref(),
                    language.cached_at,
                    language.last_synced_at
                ],
            )
            .await
            .with_context(|| format!("failed to upsert language {}", language.id))?;
        Ok(())
    }

    async fn write_bookmark(&self, bookmark: &CachedBookmark) -> Result<()> {
        let query = r#"
            INSERT OR REPLACE INTO bookmarks (id, user_id, language_id, created_at)
            VALUES (?, ?, ?, ?)
        "#;

        self.conn
            .execute(
                query,
                libsql::params![
                    bookmark.id.as_str(),
                    bookmark.user_id.as_str(),
                    bookmark.language_id.as_str(),
                    bookmark.created_at
                ],
            )
            .await
            .with_context(|| format!("failed to insert bookmark {}", bookmark.id))?;
        Ok(())
    }

    pub async fn upsert_language(&self, language: &CachedLanguage) -> Result<()> {
        {
            let _guard = self.tx_lock.lock().await;
            self.write_language(language).await?;
        }
        self.notify(StoreEvent::LanguagesChanged);
        Ok(())
    }

    /// Upserts every language in one transaction and notifies observers once.
    pub async fn upsert_languages(&self, languages: &[CachedLanguage]) -> Result<()> {
        if languages.is_empty() {
            return Ok(());
        }

        {
            let _guard = self.tx_lock.lock().await;

            self.conn.execute("BEGIN TRANSACTION", ()).await?;

            let result = async {
                for language in languages {
                    self.write_language(language).await?;
                }
                Ok::<(), anyhow::Error>(())
            }
            .await;

            match result {
                Ok(_) => {
                    self.conn.execute("COMMIT", ()).await?;
                }
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", ()).await;
                    return Err(e);
                }
            }
        }

        self.notify(StoreEvent::LanguagesChanged);
        Ok(())
    }

    pub async fn get_language(&self, id: &str) -> Result<Option<CachedLanguage>> {
        let query = format!("SELECT {LANGUAGE_COLUMNS} FROM languages WHERE id = ?");
        let mut rows = self.conn.query(&query, libsql::params![id]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::row_to_language(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_languages(&self) -> Result<Vec<CachedLanguage>> {
        self.query_languages(None).await
    }

    pub async fn list_languages_by_ranking(&self, limit: u32) -> Result<Vec<CachedLanguage>> {
        self.query_languages(Some(limit)).await
    }

    async fn query_languages(&self, limit: Option<u32>) -> Result<Vec<CachedLanguage>> {
        let query = format!("SELECT {LANGUAGE_COLUMNS} FROM languages {LANGUAGE_ORDER} LIMIT ?");
        // sqlite treats a negative limit as unbounded
        let limit = limit.map(i64::from).unwrap_or(-1);

        let mut rows = self.conn.query(&query, libsql::params![limit]).await?;
        let mut languages = vec![];

        while let Some(row) = rows.next().await? {
            languages.push(Self::row_to_language(&row)?);
        }

        Ok(languages)
    }

    pub async fn count_languages(&self) -> Result<u64> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM languages", ()).await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
            None => Ok(0),
        }
    }

    pub async fn delete_language(&self, id: &str) -> Result<()> {
        let deleted = {
            let _guard = self.tx_lock.lock().await;
            self.conn
                .execute("DELETE FROM languages WHERE id = ?", libsql::params![id])
                .await?
        };

        if deleted > 0 {
            self.notify(StoreEvent::LanguagesChanged);
        }
        Ok(())
    }

    /// Deletes every language whose `cached_at` is strictly before `cutoff`.
    pub async fn purge_older_than(&self, cutoff: i64) -> Result<u64> {
        let deleted = {
            let _guard = self.tx_lock.lock().await;
            self.conn
                .execute("DELETE FROM languages WHERE cached_at < ?", libsql::params![cutoff])
                .await?
        };

        if deleted > 0 {
            tracing::debug!(deleted, cutoff, "purged stale languages");
            self.notify(StoreEvent::LanguagesChanged);
        }
        Ok(deleted)
    }

    /// Keyed by bookmark id. Duplicate (user, language) pairs are not rejected here; check
    /// `is_bookmarked` first.
    pub async fn insert_bookmark(&self, bookmark: &CachedBookmark) -> Result<()> {
        {
            let _guard = self.tx_lock.lock().await;
            self.write_bookmark(bookmark).await?;
        }
        self.notify(StoreEvent::BookmarksChanged);
        Ok(())
    }

    pub async fn remove_bookmark(&self, user_id: &str, language_id: &str) -> Result<()> {
        let deleted = {
            let _guard = self.tx_lock.lock().await;
            self.conn
                .execute(
                    "DELETE FROM bookmarks WHERE user_id = ? AND language_id = ?",
                    libsql::params![user_id, language_id],
                )
                .await?
        };

        if deleted > 0 {
            self.notify(StoreEvent::BookmarksChanged);
        }
        Ok(())
    }

    pub async fn list_bookmarks(&self, user_id: &str) -> Result<Vec<CachedBookmark>> {
        let query = r#"
            SELECT id, user_id, language_id, created_at
            FROM bookmarks
            WHERE user_id = ?
            ORDER BY created_at ASC, id ASC
        "#;

        let mut rows = self.conn.query(query, libsql::params![user_id]).await?;
        let mut bookmarks = vec![];

        while let Some(row) = rows.next().await? {
            bookmarks.push(Self::row_to_bookmark(&row)?);
        }

        Ok(bookmarks)
    }

    pub async fn is_bookmarked(&self, user_id: &str, language_id: &str) -> Result<bool> {
        let query = "SELECT 1 FROM bookmarks WHERE user_id = ? AND language_id = ? LIMIT 1";
        let mut rows = self
            .conn
            .query(query, libsql::params![user_id, language_id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Drops the user's cached bookmarks and writes `bookmarks` in their place, atomically.
    /// Other users' bookmarks and the language cache are left alone.
    pub async fn replace_bookmarks_for_user(&self, user_id: &str, bookmarks: &[CachedBookmark]) -> Result<()> {
        {
            let _guard = self.tx_lock.lock().await;

            self.conn.execute("BEGIN TRANSACTION", ()).await?;

            let result = async {
                self.conn
                    .execute("DELETE FROM bookmarks WHERE user_id = ?", libsql::params![user_id])
                    .await?;
                for bookmark in bookmarks {
                    self.write_bookmark(bookmark).await?;
                }
                Ok::<(), anyhow::Error>(())
            }
            .await;

            match result {
                Ok(_) => {
                    self.conn.execute("COMMIT", ()).await?;
                }
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", ()).await;
                    return Err(e);
                }
            }
        }

        self.notify(StoreEvent::BookmarksChanged);
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        {
            let _guard = self.tx_lock.lock().await;

            self.conn.execute("BEGIN TRANSACTION", ()).await?;

            let result = async {
                self.conn.execute("DELETE FROM bookmarks", ()).await?;
                self.conn.execute("DELETE FROM languages", ()).await?;
                Ok::<(), anyhow::Error>(())
            }
            .await;

            match result {
                Ok(_) => {
                    self.conn.execute("COMMIT", ()).await?;
                }
                Err(e) => {
                    let _ = self.conn.execute("ROLLBACK", ()).await;
                    return Err(e);
                }
            }
        }

        self.notify(StoreEvent::BookmarksChanged);
        self.notify(StoreEvent::LanguagesChanged);
        Ok(())
    }
}
