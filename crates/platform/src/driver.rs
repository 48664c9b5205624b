//! Rendered-page (browser) collaborator traits
//!
//! Launch mechanics live behind `DriverLauncher`; the engine only sees the
//! handful of page operations the scroll-extraction loop needs.

use std::time::Duration;

use serde_json::Value;

use crate::BoxFuture;
use crate::auth::AuthContext;
use crate::error::Result;

/// Outcome of waiting for the first render. Both are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Content,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerKind {
    RateLimited,
    Error,
}

/// An error or rate-limit banner rendered in place of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub kind: BannerKind,
    pub text: String,
}

/// A live page in a browser instance bound to one identity.
pub trait BrowserDriver: Send {
    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Wait for either a content marker or the platform's empty-result state.
    /// A timeout matching neither is an error.
    fn wait_for_content_or_empty(&mut self, timeout: Duration) -> BoxFuture<'_, Result<PageState>>;

    /// Raw records for the items currently rendered, in page order.
    fn extract_visible_items(&mut self) -> BoxFuture<'_, Result<Vec<Value>>>;

    fn scroll_to_reveal_more(&mut self) -> BoxFuture<'_, Result<()>>;

    fn detect_error_banner(&mut self) -> BoxFuture<'_, Result<Option<Banner>>>;

    /// Click the banner's retry affordance. Returns false when none exists.
    fn trigger_retry_affordance(&mut self) -> BoxFuture<'_, Result<bool>>;
}

/// Launches browser instances bound to an identity and egress path.
pub trait DriverLauncher: Send + Sync {
    fn launch<'a>(&'a self, auth: &'a AuthContext) -> BoxFuture<'a, Result<Box<dyn BrowserDriver>>>;
}
