//! Bounded pool of reusable browser instances
//!
//! Many runs share one pool. A lease gives its holder exclusive use of a
//! driver; returning it parks the driver keyed by the session it was launched
//! for, so the next checkout for that session skips the launch.

use std::sync::Arc;

use platform::{AuthContext, BrowserDriver, DriverLauncher, FetchError};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct BrowserLease {
    session_id: String,
    driver: Box<dyn BrowserDriver>,
    _permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn driver(&mut self) -> &mut dyn BrowserDriver {
        self.driver.as_mut()
    }
}

pub struct BrowserPool {
    launcher: Arc<dyn DriverLauncher>,
    permits: Arc<Semaphore>,
    capacity: usize,
    idle: Mutex<Vec<(String, Box<dyn BrowserDriver>)>>,
}

impl BrowserPool {
    /// A pool that never has more than `capacity` drivers checked out.
    pub fn new(launcher: Arc<dyn DriverLauncher>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            launcher,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drivers that could be checked out right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Check out a driver for `auth`, reusing an idle one launched for the
    /// same session. Waits while the pool is at capacity.
    pub async fn checkout(&self, auth: &AuthContext) -> platform::Result<BrowserLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let reused = {
            let mut idle = self.idle.lock().await;
            idle.iter()
                .position(|(id, _)| *id == auth.session_id)
                .map(|pos| idle.swap_remove(pos).1)
        };
        let driver = match reused {
            Some(driver) => {
                debug!(session_id = %auth.session_id, "reusing idle browser");
                driver
            }
            None => {
                debug!(session_id = %auth.session_id, "launching browser");
                self.launcher.launch(auth).await?
            }
        };

        Ok(BrowserLease {
            session_id: auth.session_id.clone(),
            driver,
            _permit: permit,
        })
    }

    /// Return a healthy driver for reuse. The oldest idle driver is dropped
    /// once more than `capacity` are parked.
    pub async fn checkin(&self, lease: BrowserLease) {
        let BrowserLease {
            session_id, driver, ..
        } = lease;
        let mut idle = self.idle.lock().await;
        idle.push((session_id, driver));
        if idle.len() > self.capacity {
            idle.remove(0);
        }
    }

    /// Drop a driver that should not be reused (cancelled mid-operation,
    /// failed launch, broken page).
    pub fn discard(&self, lease: BrowserLease) {
        debug!(session_id = %lease.session_id, "discarding browser");
        drop(lease);
    }
}
