use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A language as held in the local cache. List-valued and JSON-valued fields are kept
/// serialized, the way they are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLanguage {
    pub id: String,
    pub name: String,
    pub summary: Option<String>,
    pub ranking: Option<i64>,
    pub trend_data: Option<String>,
    pub resources: Option<String>,
    pub images: Option<String>,
    /// Epoch millis of the last local write.
    pub cached_at: i64,
    /// Epoch millis of the last confirmed remote fetch.
    pub last_synced_at: Option<i64>,
}

impl CachedLanguage {
    pub fn resource_urls(&self) -> Vec<String> {
        decode_list(self.resources.as_deref())
    }

    pub fn image_urls(&self) -> Vec<String> {
        decode_list(self.images.as_deref())
    }

    pub fn trend(&self) -> Option<JsonValue> {
        self.trend_data
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn is_fresh(&self, now: i64, validity_millis: i64) -> bool {
        now - self.cached_at < validity_millis
    }

    pub fn to_record(&self) -> LanguageRecord {
        LanguageRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            summary: self.summary.clone(),
            ranking: self.ranking,
            trend_data: self.trend(),
            resources: self.resource_urls(),
            images: self.image_urls(),
        }
    }
}

fn decode_list(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBookmark {
    pub id: String,
    pub user_id: String,
    pub language_id: String,
    pub created_at: i64,
}

/// Language as served by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub ranking: Option<i64>,
    #[serde(default)]
    pub trend_data: Option<JsonValue>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl LanguageRecord {
    /// Builds the cache row written at `now`. `synced` marks the row as confirmed by the
    /// remote.
    pub fn into_cached(self, now: i64, synced: bool) -> CachedLanguage {
        CachedLanguage {
            trend_data: self.trend_data.as_ref().map(JsonValue::to_string),
            resources: serde_json::to_string(&self.resources).ok(),
            images: serde_json::to_string(&self.images).ok(),
            id: self.id,
            name: self.name,
            summary: self.summary,
            ranking: self.ranking,
            cached_at: now,
            last_synced_at: synced.then_some(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkRecord {
    pub id: String,
    pub user_id: String,
    pub language_id: String,
    pub created_at: String,
}

impl BookmarkRecord {
    /// `fallback` is used when the remote timestamp is not RFC 3339.
    pub fn into_cached(self, fallback: i64) -> CachedBookmark {
        let created_at = match DateTime::parse_from_rfc3339(&self.created_at) {
            Ok(dt) => dt.timestamp_millis(),
            Err(e) => {
                tracing::warn!(
                    bookmark = %self.id,
                    created_at = %self.created_at,
                    "unparseable bookmark timestamp: {}",
                    e
                );
                fallback
            }
        };

        CachedBookmark {
            id: self.id,
            user_id: self.user_id,
            language_id: self.language_id,
            created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMutation<'a> {
    pub language_id: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_record_deserialize_defaults() {
        let raw = r#"{"id":"rust","name":"Rust","ranking":2,"extra":true}"#;
        let record: LanguageRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.ranking, Some(2));
        assert!(record.summary.is_none());
        assert!(record.resources.is_empty());
        assert!(record.trend_data.is_none());
    }

    #[test]
    fn test_into_cached_serializes_lists() {
        let record = LanguageRecord {
            id: "go".into(),
            name: "Go".into(),
            summary: Some("gophers".into()),
            ranking: Some(4),
            trend_data: Some(serde_json::json!({"2024": 12})),
            resources: vec!["https://go.dev".into()],
            images: vec![],
        };

        let cached = record.clone().into_cached(1_000, true);
        assert_eq!(cached.cached_at, 1_000);
        assert_eq!(cached.last_synced_at, Some(1_000));
        assert_eq!(cached.resources.as_deref(), Some(r#"["https://go.dev"]"#));
        assert_eq!(cached.resource_urls(), vec!["https://go.dev".to_string()]);
        assert_eq!(cached.to_record(), record);

        let speculative = record.into_cached(2_000, false);
        assert_eq!(speculative.last_synced_at, None);
    }

    #[test]
    fn test_bookmark_timestamp_parsing() {
        let record = BookmarkRecord {
            id: "b1".into(),
            user_id: "u1".into(),
            language_id: "rust".into(),
            created_at: "2024-03-01T10:00:00Z".into(),
        };
        assert_eq!(record.into_cached(0).created_at, 1_709_287_200_000);

        let garbled = BookmarkRecord {
            id: "b2".into(),
            user_id: "u1".into(),
            language_id: "go".into(),
            created_at: "yesterday".into(),
        };
        assert_eq!(garbled.into_cached(42).created_at, 42);
    }

    #[test]
    fn test_freshness_boundary() {
        let lang = LanguageRecord {
            id: "c".into(),
            name: "C".into(),
            summary: None,
            ranking: None,
            trend_data: None,
            resources: vec![],
            images: vec![],
        }
        .into_cached(10_000, false);

        assert!(lang.is_fresh(10_000 + 499, 500));
        assert!(!lang.is_fresh(10_000 + 500, 500));
    }
}
