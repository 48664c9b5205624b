//! Cooperative cancellation
//!
//! One flag per run, set from outside and read by every inner loop at its head
//! and around each suspension point. Nothing is preempted; loops observe the
//! flag and unwind with whatever they have collected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Longest uninterrupted sleep slice. Keeps cancellation latency bounded.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for `duration` unless cancelled first. Returns false when the sleep
/// was cut short by cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancelFlag) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(SLEEP_SLICE)).await;
    }
}
