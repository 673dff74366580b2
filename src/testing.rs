use crate::error::RemoteError;
use crate::model::{BookmarkRecord, CachedBookmark, CachedLanguage, LanguageRecord};
use crate::remote::RemoteSource;
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn cached_language(id: &str, name: &str, ranking: Option<i64>, cached_at: i64) -> CachedLanguage {
    CachedLanguage {
        id: id.to_string(),
        name: name.to_string(),
        summary: None,
        ranking,
        trend_data: None,
        resources: None,
        images: None,
        cached_at,
        last_synced_at: None,
    }
}

pub fn language_record(id: &str, name: &str, ranking: Option<i64>) -> LanguageRecord {
    LanguageRecord {
        id: id.to_string(),
        name: name.to_string(),
        summary: None,
        ranking,
        trend_data: None,
        resources: vec![],
        images: vec![],
    }
}

pub fn bookmark(id: &str, user_id: &str, language_id: &str, created_at: i64) -> CachedBookmark {
    CachedBookmark {
        id: id.to_string(),
        user_id: user_id.to_string(),
        language_id: language_id.to_string(),
        created_at,
    }
}

pub fn bookmark_record(id: &str, user_id: &str, language_id: &str) -> BookmarkRecord {
    BookmarkRecord {
        id: id.to_string(),
        user_id: user_id.to_string(),
        language_id: language_id.to_string(),
        created_at: "2024-03-01T10:00:00Z".to_string(),
    }
}

/// In-process stand-in for the remote API. Serves whatever it was last given and counts
/// calls per endpoint.
pub struct FakeRemote {
    languages: Mutex<Result<Vec<LanguageRecord>, RemoteError>>,
    bookmarks: Mutex<Result<Vec<BookmarkRecord>, RemoteError>>,
    mutations: Mutex<Option<RemoteError>>,
    delay: Mutex<Duration>,
    owner: Mutex<String>,
    pub language_calls: AtomicUsize,
    pub single_calls: AtomicUsize,
    pub bookmark_calls: AtomicUsize,
    pub added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            languages: Mutex::new(Ok(vec![])),
            bookmarks: Mutex::new(Ok(vec![])),
            mutations: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            owner: Mutex::new("u1".to_string()),
            language_calls: AtomicUsize::new(0),
            single_calls: AtomicUsize::new(0),
            bookmark_calls: AtomicUsize::new(0),
            added: Mutex::new(vec![]),
            removed: Mutex::new(vec![]),
        }
    }
}

impl FakeRemote {
    pub fn with_languages(languages: Vec<LanguageRecord>) -> Self {
        let remote = Self::default();
        remote.set_languages(Ok(languages));
        remote
    }

    pub fn set_languages(&self, result: Result<Vec<LanguageRecord>, RemoteError>) {
        *self.languages.lock().unwrap() = result;
    }

    pub fn set_bookmarks(&self, result: Result<Vec<BookmarkRecord>, RemoteError>) {
        *self.bookmarks.lock().unwrap() = result;
    }

    pub fn fail_mutations(&self, err: RemoteError) {
        *self.mutations.lock().unwrap() = Some(err);
    }

    /// User id echoed back on created bookmarks.
    pub fn set_owner(&self, user_id: &str) {
        *self.owner.lock().unwrap() = user_id.to_string();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn language_calls(&self) -> usize {
        self.language_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn fetch_languages(&self) -> Result<Vec<LanguageRecord>, RemoteError> {
        self.language_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.languages.lock().unwrap().clone()
    }

    async fn fetch_language_by_id(&self, id: &str) -> Result<LanguageRecord, RemoteError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        let languages = self.languages.lock().unwrap().clone()?;
        languages
            .into_iter()
            .find(|l| l.id == id)
            .ok_or(RemoteError::NotFound)
    }

    async fn fetch_bookmarks(&self, _user_id: &str) -> Result<Vec<BookmarkRecord>, RemoteError> {
        self.bookmark_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.bookmarks.lock().unwrap().clone()
    }

    async fn add_bookmark(&self, language_id: &str) -> Result<BookmarkRecord, RemoteError> {
        if let Some(err) = self.mutations.lock().unwrap().clone() {
            return Err(err);
        }
        let owner = self.owner.lock().unwrap().clone();
        let mut added = self.added.lock().unwrap();
        added.push(language_id.to_string());
        Ok(bookmark_record(&format!("remote-{}", added.len()), &owner, language_id))
    }

    async fn remove_bookmark(&self, language_id: &str) -> Result<(), RemoteError> {
        if let Some(err) = self.mutations.lock().unwrap().clone() {
            return Err(err);
        }
        self.removed.lock().unwrap().push(language_id.to_string());
        Ok(())
    }
}
