//! Push-based reads over the local cache.
//!
//! Each stream yields the full, ordered result set: first the current contents, then a
//! fresh snapshot every time the underlying table changes. Streams are lazy (nothing is
//! queried until polled), never end on their own, and stop costing anything once dropped.
//! Calling the same method again starts a new, independent stream.

use crate::db::{Database, StoreEvent};
use crate::model::{CachedBookmark, CachedLanguage};
use anyhow::Result;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone)]
pub struct LiveQueries {
    db: Arc<Database>,
}

impl LiveQueries {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn languages(&self) -> BoxStream<'static, Result<Vec<CachedLanguage>>> {
        snapshots(self.db.clone(), StoreEvent::LanguagesChanged, |db| async move {
            db.list_languages().await
        })
    }

    pub fn languages_by_ranking(&self, limit: u32) -> BoxStream<'static, Result<Vec<CachedLanguage>>> {
        snapshots(self.db.clone(), StoreEvent::LanguagesChanged, move |db| async move {
            db.list_languages_by_ranking(limit).await
        })
    }

    pub fn bookmarks(&self, user_id: &str) -> BoxStream<'static, Result<Vec<CachedBookmark>>> {
        let user_id = user_id.to_string();
        snapshots(self.db.clone(), StoreEvent::BookmarksChanged, move |db| {
            let user_id = user_id.clone();
            async move { db.list_bookmarks(&user_id).await }
        })
    }
}

struct Cursor<F> {
    db: Arc<Database>,
    events: tokio::sync::broadcast::Receiver<StoreEvent>,
    query: F,
    primed: bool,
}

fn snapshots<T, F, Fut>(db: Arc<Database>, table: StoreEvent, query: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: Fn(Arc<Database>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let cursor = Cursor {
        events: db.subscribe(),
        db,
        query,
        primed: false,
    };

    stream::unfold(cursor, move |mut cursor| async move {
        if cursor.primed {
            loop {
                match cursor.events.recv().await {
                    Ok(event) if event == table => break,
                    Ok(_) => continue,
                    // missed some events; one re-query covers them all
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "live query lagged");
                        break;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }

        cursor.primed = true;
        let snapshot = (cursor.query)(cursor.db.clone()).await;
        Some((snapshot, cursor))
    })
    .boxed()
}
