//! File-backed credential and egress sources
//!
//! The session and egress pools load their resources through the
//! `CredentialSource` and `EgressSource` traits. This crate provides the
//! file implementations used by the service:
//!
//! - `CredentialStore`: JSON file mapping session ids to credential bundles,
//!   editable at runtime with atomic writes
//! - `ProxyList`: line-oriented proxy file, one endpoint per line

pub mod error;
pub mod proxies;
pub mod store;

pub use error::{Error, Result};
pub use proxies::{ProxyList, parse_proxy_line};
pub use store::{CredentialStore, StoredCredential};
