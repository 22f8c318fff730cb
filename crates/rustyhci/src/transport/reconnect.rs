//! Serial link recovery
//!
//! When a serial controller disappears (unplugged, reset by firmware) the
//! session polls the port listing until the port comes back, a retry budget
//! runs out, or someone cancels. Cancellation is cooperative: the flag is
//! checked before each listing, after each listing and after each delay,
//! never in the middle of one.

use crate::transport::{DeviceInfo, DeviceLister};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default pause between listing attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retry budget for one reconnect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RETRY_CONNECTION)
    }
}

/// Shared stop request for a reconnect cycle
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How a reconnect cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The port is listed again and can be rebound
    Reappeared,
    Exhausted { attempts: u32 },
    Cancelled,
}

/// Bounded, cancellable wait for a lost port to come back
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    attempt: u32,
    cancelled: CancelFlag,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy, cancelled: CancelFlag) -> Self {
        Self {
            policy,
            attempt: 0,
            cancelled,
        }
    }

    /// Attempts used so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Poll `lister` until `present` accepts a listing.
    ///
    /// A failed listing costs an attempt like a listing without the port.
    pub async fn run<L, F>(&mut self, lister: &L, mut present: F) -> ReconnectOutcome
    where
        L: DeviceLister + ?Sized,
        F: FnMut(&[DeviceInfo]) -> bool + Send,
    {
        while self.attempt < self.policy.max_retries && !self.cancelled.is_cancelled() {
            match lister.list_devices().await {
                Ok(devices) => {
                    if self.cancelled.is_cancelled() {
                        break;
                    }
                    if present(&devices) {
                        return ReconnectOutcome::Reappeared;
                    }
                    self.attempt += 1;
                    debug!(
                        "Retry {}/{} - port not found",
                        self.attempt, self.policy.max_retries
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(e) => {
                    debug!("Error listing ports: {}", e);
                    if !self.failed_attempt().await {
                        break;
                    }
                }
            }
        }
        self.outcome()
    }

    /// Count an attempt that failed after the port was seen (or the
    /// listing itself failed) and wait before the next one.
    ///
    /// Returns `false` when the cycle should end instead.
    pub async fn failed_attempt(&mut self) -> bool {
        self.attempt += 1;
        if self.attempt >= self.policy.max_retries || self.cancelled.is_cancelled() {
            return false;
        }
        tokio::time::sleep(self.policy.delay).await;
        true
    }

    /// Outcome for a cycle that ended without the port reappearing
    pub fn outcome(&self) -> ReconnectOutcome {
        if self.cancelled.is_cancelled() {
            debug!("Reconnection stopped: cancelled");
            ReconnectOutcome::Cancelled
        } else {
            debug!("Max retries ({}) reached", self.policy.max_retries);
            ReconnectOutcome::Exhausted {
                attempts: self.attempt,
            }
        }
    }
}
