//! Extracted post model and lenient record normalization
//!
//! Both channels hand the engine loosely shaped JSON records: API adapters
//! flatten payload entries, browser drivers scrape rendered cards. Field names
//! and number formats differ between the two ("1.2K" vs 1200, `full_text` vs
//! `text`), so every record passes through `normalize_record` before it
//! becomes an `Item`.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::target::DEFAULT_SITE_BASE;

/// Author metadata attached to an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A single extracted post. Deduplicated by `id` within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub url: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reposts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub views: Option<i64>,
    #[serde(default)]
    pub author: Author,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Minimal item with a synthesized canonical url.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            url: canonical_url(None, &id),
            id,
            text: String::new(),
            likes: None,
            reposts: None,
            replies: None,
            views: None,
            author: Author::default(),
            created_at: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

/// Result of normalizing a batch of raw records.
#[derive(Debug, Default)]
pub struct Normalized {
    /// Items in source order, first occurrence of each id kept.
    pub items: Vec<Item>,
    /// Records without a usable id.
    pub dropped: usize,
    /// Repeated ids within the batch.
    pub deduped: usize,
}

const ID_KEYS: &[&str] = &["id_str", "id", "tweet_id", "rest_id", "tweetId"];
const URL_KEYS: &[&str] = &["url", "tweetUrl", "permalink"];
const TEXT_KEYS: &[&str] = &["full_text", "text", "content"];
const TIME_KEYS: &[&str] = &["created_at", "createdAt", "time", "timestamp"];
const LIKE_KEYS: &[&str] = &["likes", "favorite_count", "like_count"];
const REPOST_KEYS: &[&str] = &["reposts", "retweets", "retweet_count"];
const REPLY_KEYS: &[&str] = &["replies", "reply_count"];
const VIEW_KEYS: &[&str] = &["views", "view_count"];
const HANDLE_KEYS: &[&str] = &["username", "screen_name", "handle", "author"];
const USER_ID_KEYS: &[&str] = &["user_id", "userId", "author_id"];
const DISPLAY_NAME_KEYS: &[&str] = &["user_display_name", "userDisplayName", "display_name", "name"];

/// The platform's legacy timestamp form, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const LEGACY_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Epoch values above this are milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Normalize one raw record. Returns `None` when no id can be found.
pub fn normalize_record(raw: &Value) -> Option<Item> {
    let obj = raw.as_object()?;
    let lookup = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
    };

    let id = lookup(ID_KEYS).and_then(string_like)?;
    if id.is_empty() {
        return None;
    }

    let author = Author {
        handle: lookup(HANDLE_KEYS)
            .and_then(string_like)
            .map(|h| h.trim_start_matches('@').to_string()),
        id: lookup(USER_ID_KEYS).and_then(string_like),
        display_name: lookup(DISPLAY_NAME_KEYS).and_then(string_like),
    };

    let url = match lookup(URL_KEYS).and_then(Value::as_str) {
        Some(u) if u.starts_with("http") => u.to_string(),
        Some(u) if u.starts_with('/') => format!("{DEFAULT_SITE_BASE}{u}"),
        _ => canonical_url(author.handle.as_deref(), &id),
    };

    Some(Item {
        url,
        text: lookup(TEXT_KEYS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        likes: lookup(LIKE_KEYS).and_then(count_like),
        reposts: lookup(REPOST_KEYS).and_then(count_like),
        replies: lookup(REPLY_KEYS).and_then(count_like),
        views: lookup(VIEW_KEYS).and_then(count_like),
        created_at: lookup(TIME_KEYS).and_then(parse_timestamp),
        author,
        id,
    })
}

/// Normalize a batch, preserving order and dropping in-batch duplicates.
pub fn normalize_records(raw: &[Value]) -> Normalized {
    let mut out = Normalized::default();
    let mut seen = HashSet::new();
    for record in raw {
        match normalize_record(record) {
            Some(item) => {
                if seen.insert(item.id.clone()) {
                    out.items.push(item);
                } else {
                    out.deduped += 1;
                }
            }
            None => out.dropped += 1,
        }
    }
    out
}

fn canonical_url(handle: Option<&str>, id: &str) -> String {
    match handle {
        Some(h) if !h.is_empty() => format!("{DEFAULT_SITE_BASE}/{h}/status/{id}"),
        _ => format!("{DEFAULT_SITE_BASE}/i/status/{id}"),
    }
}

fn string_like(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse engagement counts: plain numbers, "1,204", "1.2K", "3M".
fn count_like(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
            if cleaned.is_empty() {
                return None;
            }
            let (digits, multiplier) = match cleaned.chars().last() {
                Some('K' | 'k') => (&cleaned[..cleaned.len() - 1], 1_000.0),
                Some('M' | 'm') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
                Some('B' | 'b') => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
                _ => (cleaned.as_str(), 1.0),
            };
            digits
                .parse::<f64>()
                .ok()
                .map(|n| (n * multiplier).round() as i64)
        }
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = DateTime::parse_from_str(s, LEGACY_TIME_FORMAT) {
                return Some(dt.with_timezone(&Utc));
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw > EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}
