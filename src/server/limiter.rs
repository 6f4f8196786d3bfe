//! Global admission gate for control connections.
//!
//! A non-blocking counting semaphore sized at the configured client maximum.
//! Rejected connections are closed by the accept loop without reading a
//! byte. The permit is held by the handler task for the connection's whole
//! lifetime, so release pairs with acquire on every exit path.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting admission gate.
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    max_clients: usize,
}

impl ConnectionLimiter {
    /// Create a limiter admitting at most `max_clients` concurrent control
    /// connections.
    pub fn new(max_clients: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_clients)),
            max_clients,
        }
    }

    /// Try to admit one connection without blocking.
    ///
    /// Dropping the returned permit releases the slot.
    pub fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Free slots, for diagnostics.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}
