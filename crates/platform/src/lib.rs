//! Platform abstraction for the acquisition engine
//!
//! Defines the data model shared by both acquisition channels and the traits
//! that decouple the engine from the platform itself:
//!
//! - `ApiConnector` / `ApiClient` wrap the paginated API (identity lookup,
//!   timeline pages, search pages)
//! - `DriverLauncher` / `BrowserDriver` wrap a rendered-page browser session
//! - `PayloadParser` turns a raw API payload into ordered items + next cursor
//!
//! Connectors and launchers receive an `AuthContext` so identity and egress
//! travel together into whatever client they build.

pub mod api;
pub mod auth;
pub mod driver;
pub mod error;
pub mod item;
pub mod target;

pub use api::{ApiClient, ApiConnector, NormalizedPageParser, Page, PayloadParser};
pub use auth::{AuthContext, CredentialBundle, EgressRoute, SessionSeed};
pub use driver::{Banner, BannerKind, BrowserDriver, DriverLauncher, PageState};
pub use error::{ErrorClassification, FetchError, Result};
pub use item::{Author, Item, Normalized, normalize_record, normalize_records};
pub use target::{Target, TimeBounds};

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the collaborator traits so they stay dyn-compatible
/// (`Arc<dyn ApiConnector>`, `Box<dyn BrowserDriver>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
