//! Shared types for the harvest workspace
//!
//! Holds the pieces every other crate leans on: the `Secret` wrapper used for
//! credential bundles and proxy passwords, the configuration-level error type
//! returned while loading TOML and companion files, and the atomic file write
//! shared by the credential and checkpoint stores.

mod error;
mod fs;
mod secret;

pub use error::{Error, Result};
pub use fs::write_atomic;
pub use secret::Secret;
