//! Post acquisition engine
//!
//! Two channels feed one run:
//!
//! - the API channel walks a cursor chain, rotating identity when pages come
//!   back empty or rate limited, and diagnoses a likely pagination depth limit
//!   when several sessions agree the chain has run dry
//! - the DOM channel scrolls a rendered page, extracting as it goes, with
//!   context-dependent boundary detection and deep-scroll bursts on rotation
//!
//! `Coordinator::run` binds one identity from the `IdentityPool`, runs the
//! requested `ChannelStrategy` (API, DOM, or API topped up by DOM) and always
//! returns a `RunOutcome`. Requests across every worker are budgeted by the
//! `RateGovernor`; progress is checkpointed so an interrupted run can resume.

mod api;
pub mod browser;
pub mod cancel;
pub mod checkpoint;
pub mod collector;
pub mod config;
mod context;
pub mod coordinator;
mod dom;
pub mod error;
pub mod events;
pub mod governor;
pub mod outcome;
pub mod telemetry;

pub use browser::{BrowserLease, BrowserPool};
pub use cancel::CancelFlag;
pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, ProgressCheckpoint,
    load_checkpoint, save_checkpoint,
};
pub use collector::{ItemPredicate, StopCondition, StopReason};
pub use config::{ApiConfig, DomConfig, EngineConfig, GovernorConfig};
pub use coordinator::{ChannelStrategy, Coordinator, RunRequest};
pub use dom::DomContext;
pub use error::{Error, Result};
pub use events::{LogLevel, RunEvent};
pub use governor::{
    CounterStore, Decision, MemoryCounterStore, RateGovernor, RedisCounterStore, SlotOutcome,
};
pub use outcome::{ChannelEnd, DiagnosticCode, RunOutcome};
pub use telemetry::PhaseTimer;
