//! Run targets and time bounds

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FetchError, Result};

/// Site root used for rendered-page navigation and canonical item urls.
pub const DEFAULT_SITE_BASE: &str = "https://x.com";

/// What a run acquires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A user's timeline, by handle.
    Profile { handle: String },
    /// Search results for a query.
    Search { query: String },
    /// The bound identity's own home feed. Each identity's feed differs.
    Home,
}

impl Target {
    pub fn profile(handle: impl AsRef<str>) -> Self {
        Target::Profile {
            handle: handle.as_ref().trim_start_matches('@').to_string(),
        }
    }

    pub fn search(query: impl Into<String>) -> Self {
        Target::Search {
            query: query.into(),
        }
    }

    /// Short label for logs and metric tags.
    pub fn label(&self) -> &'static str {
        match self {
            Target::Profile { .. } => "profile",
            Target::Search { .. } => "search",
            Target::Home => "home",
        }
    }

    /// Rendered-page url for this target.
    ///
    /// `window` narrows a search to `[since, until)` dates using the
    /// platform's query operators; it is ignored for other targets.
    pub fn page_url(&self, base: &str, window: Option<(NaiveDate, NaiveDate)>) -> Result<Url> {
        let base = base.trim_end_matches('/');
        let parsed = match self {
            Target::Profile { handle } => Url::parse(&format!("{base}/{handle}")),
            Target::Home => Url::parse(&format!("{base}/home")),
            Target::Search { query } => {
                let q = match window {
                    Some((since, until)) => format!(
                        "{query} since:{} until:{}",
                        since.format("%Y-%m-%d"),
                        until.format("%Y-%m-%d")
                    ),
                    None => query.clone(),
                };
                Url::parse_with_params(&format!("{base}/search"), &[("q", q.as_str()), ("f", "live")])
            }
        };
        parsed.map_err(|e| FetchError::Malformed(format!("target url: {e}")))
    }
}

/// Optional publication-time bounds for a run.
///
/// Items newer than `until` are skipped; the first item older than `since`
/// halts the run, since timelines are ordered newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeBounds {
    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }
}
