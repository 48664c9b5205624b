//! Paginated API collaborator traits

use serde_json::Value;

use crate::BoxFuture;
use crate::auth::AuthContext;
use crate::error::{FetchError, Result};
use crate::item::{Item, normalize_records};

/// One parsed page: items in platform order plus the continuation cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    pub next_cursor: Option<String>,
}

/// API client bound to one identity and egress path.
///
/// Pages come back raw; the engine parses them through a `PayloadParser` so
/// payload shape changes never touch the transport.
pub trait ApiClient: Send + Sync {
    /// Resolve a handle to the platform's stable user id.
    fn resolve_user_id<'a>(&'a self, handle: &'a str) -> BoxFuture<'a, Result<String>>;

    fn fetch_timeline_page<'a>(
        &'a self,
        user_id: &'a str,
        page_size: usize,
        cursor: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value>>;

    fn fetch_search_page<'a>(
        &'a self,
        query: &'a str,
        page_size: usize,
        cursor: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// Builds API clients for an identity binding. Called again on every
/// session rotation.
pub trait ApiConnector: Send + Sync {
    fn connect<'a>(&'a self, auth: &'a AuthContext) -> BoxFuture<'a, Result<Box<dyn ApiClient>>>;
}

/// Pure raw-payload parser.
pub trait PayloadParser: Send + Sync {
    fn parse_page(&self, raw: &Value) -> Result<Page>;
}

/// Parser for adapters that already flatten payloads to
/// `{"items": [...], "next_cursor": "..."}`. Items go through lenient
/// normalization, so adapters may keep the platform's field names.
#[derive(Debug, Clone, Default)]
pub struct NormalizedPageParser;

impl PayloadParser for NormalizedPageParser {
    fn parse_page(&self, raw: &Value) -> Result<Page> {
        let records = raw
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Malformed("payload has no items array".into()))?;

        let normalized = normalize_records(records);
        if normalized.dropped > 0 {
            tracing::debug!(dropped = normalized.dropped, "records without id dropped");
        }

        let next_cursor = raw
            .get("next_cursor")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(Page {
            items: normalized.items,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_items_and_cursor() {
        let raw = json!({
            "items": [{ "id": "1" }, { "id": "2" }],
            "next_cursor": "c1"
        });
        let page = NormalizedPageParser.parse_page(&raw).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("c1"));
    }

    #[test]
    fn blank_cursor_is_none() {
        let raw = json!({ "items": [], "next_cursor": "  " });
        let page = NormalizedPageParser.parse_page(&raw).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn missing_items_is_malformed() {
        let err = NormalizedPageParser
            .parse_page(&json!({ "data": {} }))
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }
}
