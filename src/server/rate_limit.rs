//! Per-source-IP authentication failure tracking.
//!
//! Every failed token comparison increments the source IP's counter; at
//! `max_failures` the IP is stamped blocked and further control connections
//! from it are closed before any protocol byte is written. A successful
//! authentication clears the record. A background sweeper evicts stale
//! entries so a scanning attacker cannot grow the map without bound: blocked
//! IPs stay visible for one full block period past expiry, then go.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Interval between sweeper passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Failure record for a single IP.
struct FailureEntry {
    failures: u32,
    blocked_at: Option<Instant>,
}

/// Auth-failure rate limiter keyed by source IP.
pub struct IpRateLimiter {
    entries: RwLock<HashMap<IpAddr, FailureEntry>>,
    max_failures: u32,
    block_duration: Duration,
    stop: CancellationToken,
}

impl IpRateLimiter {
    /// Create a limiter blocking an IP for `block_duration` after
    /// `max_failures` consecutive failures.
    pub fn new(max_failures: u32, block_duration: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_failures,
            block_duration,
            stop: CancellationToken::new(),
        }
    }

    /// Record an authentication failure for `ip`.
    ///
    /// Returns true when this failure crossed the threshold and the IP is
    /// now blocked.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        let mut entries = self.entries.write();

        let entry = entries.entry(ip).or_insert(FailureEntry {
            failures: 0,
            blocked_at: None,
        });

        entry.failures += 1;

        if entry.failures >= self.max_failures {
            entry.blocked_at = Some(Instant::now());
            return true;
        }

        false
    }

    /// True while `ip` is inside its block window.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let entries = self.entries.read();

        match entries.get(&ip).and_then(|e| e.blocked_at) {
            Some(blocked_at) => blocked_at.elapsed() < self.block_duration,
            None => false,
        }
    }

    /// Forget `ip` entirely. Called after a successful authentication.
    pub fn reset(&self, ip: IpAddr) {
        self.entries.write().remove(&ip);
    }

    /// Number of tracked IPs.
    pub fn tracked_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Run the eviction loop until [`IpRateLimiter::close`] is called.
    ///
    /// Spawn this once per limiter.
    pub async fn run_sweeper(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => self.sweep(),
                _ = self.stop.cancelled() => return,
            }
        }
    }

    /// Stop the sweeper. Idempotent.
    pub fn close(&self) {
        self.stop.cancel();
    }

    fn sweep(&self) {
        let mut entries = self.entries.write();
        let window = self.block_duration * 2;

        let before = entries.len();
        entries.retain(|_, entry| match entry.blocked_at {
            Some(blocked_at) => blocked_at.elapsed() <= window,
            None => true,
        });

        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!("evicted {} expired rate-limit entries", evicted);
        }
    }
}

impl Drop for IpRateLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
