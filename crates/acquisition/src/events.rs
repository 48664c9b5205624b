//! Progress and log event stream for run callers
//!
//! The caller hands the coordinator an unbounded sender; the engine never
//! blocks on it and a dropped receiver is ignored. Every log event is also
//! emitted through `tracing` so the service logs and the caller's stream agree.

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress {
        current: usize,
        target: usize,
        action: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Per-run event emitter.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    run_id: String,
    tx: Option<UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub fn new(run_id: impl Into<String>, tx: Option<UnboundedSender<RunEvent>>) -> Self {
        Self {
            run_id: run_id.into(),
            tx,
        }
    }

    /// A sink that only traces.
    pub fn silent(run_id: impl Into<String>) -> Self {
        Self::new(run_id, None)
    }

    pub fn progress(&self, current: usize, target: usize, action: impl Into<String>) {
        self.send(RunEvent::Progress {
            current,
            target,
            action: action.into(),
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let run_id = self.run_id.as_str();
        match level {
            LogLevel::Debug => debug!(run_id, "{message}"),
            LogLevel::Info => info!(run_id, "{message}"),
            LogLevel::Warn => warn!(run_id, "{message}"),
            LogLevel::Error => error!(run_id, "{message}"),
        }
        self.send(RunEvent::Log { level, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    fn send(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening; the run carries on.
            let _ = tx.send(event);
        }
    }
}
