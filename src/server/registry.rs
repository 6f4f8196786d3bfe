//! Port registry.
//!
//! Maps each claimed port to a [`ClientSlot`] holding the client's
//! multiplexed session, its SOCKS5 acceptor handle, and the per-client
//! connection counter. Reservation is atomic across all requested ports, and
//! teardown side effects run exactly once: releasing removes the slot from
//! the map under the write lock, so only one caller ever owns the slot's
//! resources.
//!
//! Data-plane calls (`increment_connections` and friends) take the shared
//! lock only and mutate the counter with atomic compare-and-swap, so they
//! never serialize behind reservations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::socks::SocksHandle;
use crate::error::{Error, Result};
use crate::mux::MuxSession;

/// Identity of the client bound to a port.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    /// Client-reported name from the HELLO message
    pub name: String,
    /// Server-generated unique id for this session
    pub id: String,
}

/// One reserved port. Created empty by `reserve_ports`, populated by
/// `bind_session`, destroyed by `release_ports`.
struct ClientSlot {
    meta: Option<ClientMeta>,
    session: Option<Arc<MuxSession>>,
    socks: Option<SocksHandle>,
    max_conns: u32,
    active_conns: Arc<AtomicU32>,
}

impl ClientSlot {
    fn placeholder() -> Self {
        Self {
            meta: None,
            session: None,
            socks: None,
            max_conns: 0,
            active_conns: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// Port-to-slot mapping shared by the handshake handlers and the SOCKS
/// acceptors.
pub struct Registry {
    slots: RwLock<HashMap<u16, ClientSlot>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Atomically reserve the given ports.
    ///
    /// Either every port is inserted as a placeholder slot or, on the first
    /// collision (including duplicates within the request), nothing is
    /// inserted and the offending port is named in the error.
    ///
    /// The returned guard releases the reservation on drop; its `release`
    /// runs the same idempotent path as [`Registry::release_ports`].
    pub fn reserve_ports(self: &Arc<Self>, ports: &[u16]) -> Result<PortReservation> {
        let mut slots = self.slots.write();

        for (i, port) in ports.iter().enumerate() {
            if slots.contains_key(port) || ports[..i].contains(port) {
                return Err(Error::PortInUse(*port));
            }
        }

        for port in ports {
            slots.insert(*port, ClientSlot::placeholder());
        }

        Ok(PortReservation {
            registry: Arc::clone(self),
            ports: ports.to_vec(),
            released: AtomicBool::new(false),
        })
    }

    /// Populate a reserved slot with its session, SOCKS acceptor, and
    /// connection cap.
    ///
    /// Fails if the port was never reserved, or if the slot already carries
    /// a session.
    pub fn bind_session(
        &self,
        port: u16,
        session: Arc<MuxSession>,
        socks: SocksHandle,
        meta: ClientMeta,
        max_conns: u32,
    ) -> Result<()> {
        let mut slots = self.slots.write();

        let slot = slots.get_mut(&port).ok_or(Error::PortNotReserved(port))?;
        if slot.session.is_some() {
            return Err(Error::PortInUse(port));
        }

        slot.session = Some(session);
        slot.socks = Some(socks);
        slot.meta = Some(meta);
        slot.max_conns = max_conns;
        slot.active_conns.store(0, Ordering::Release);

        Ok(())
    }

    /// Look up the session bound to a port. `None` until `bind_session` has
    /// run for it.
    pub fn get_session(&self, port: u16) -> Option<Arc<MuxSession>> {
        self.slots
            .read()
            .get(&port)
            .and_then(|slot| slot.session.clone())
    }

    /// Remove the given ports and shut down their SOCKS acceptors.
    ///
    /// Idempotent: absent ports are skipped. Slot teardown happens outside
    /// the lock, on the removed slots this caller now exclusively owns.
    pub fn release_ports(&self, ports: &[u16]) {
        let removed: Vec<(u16, ClientSlot)> = {
            let mut slots = self.slots.write();
            ports
                .iter()
                .filter_map(|port| slots.remove(port).map(|slot| (*port, slot)))
                .collect()
        };

        for (port, slot) in removed {
            if let Some(socks) = slot.socks {
                socks.shutdown();
            }
            tracing::debug!("released port {}", port);
        }
    }

    /// Reserve one more SOCKS connection on a port.
    ///
    /// Returns false when the port is unknown, unbound, or at its cap. Every
    /// successful call must be paired with one `decrement_connections`.
    pub fn increment_connections(&self, port: u16) -> bool {
        let (counter, max_conns) = {
            let slots = self.slots.read();
            match slots.get(&port) {
                Some(slot) => (Arc::clone(&slot.active_conns), slot.max_conns),
                None => return false,
            }
        };

        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= max_conns {
                return false;
            }
            if counter
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return a SOCKS connection slot on a port.
    pub fn decrement_connections(&self, port: u16) {
        let counter = {
            let slots = self.slots.read();
            match slots.get(&port) {
                Some(slot) => Arc::clone(&slot.active_conns),
                None => return,
            }
        };

        counter.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current SOCKS connection count on a port.
    pub fn connection_count(&self, port: u16) -> u32 {
        self.slots
            .read()
            .get(&port)
            .map(|slot| slot.active_conns.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of reserved ports.
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a batch of reserved ports.
///
/// `release` is idempotent (an atomic latch), and `Drop` calls it, so the
/// reservation cannot leak on any handler exit path.
pub struct PortReservation {
    registry: Arc<Registry>,
    ports: Vec<u16>,
    released: AtomicBool,
}

impl std::fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReservation")
            .field("ports", &self.ports)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl PortReservation {
    /// The reserved ports, in request order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Release the reservation. Only the first call has any effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.release_ports(&self.ports);
        }
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxConfig, MuxMode};
    use tokio_util::sync::CancellationToken;

    fn test_session() -> Arc<MuxSession> {
        let (a, _b) = tokio::io::duplex(4096);
        Arc::new(MuxSession::new(a, &MuxConfig::default(), MuxMode::Server))
    }

    fn test_socks_handle(port: u16) -> SocksHandle {
        SocksHandle::new(port, CancellationToken::new())
    }

    fn test_meta() -> ClientMeta {
        ClientMeta {
            name: "test-client".to_string(),
            id: "b7a9c9e2".to_string(),
        }
    }

    #[test]
    fn test_reserve_success() {
        let registry = Arc::new(Registry::new());

        let reservation = registry.reserve_ports(&[20001, 20002, 20003]).unwrap();
        assert_eq!(reservation.ports(), &[20001, 20002, 20003]);
        assert_eq!(registry.slot_count(), 3);
    }

    #[test]
    fn test_reserve_collision_is_atomic() {
        let registry = Arc::new(Registry::new());
        let _held = registry.reserve_ports(&[20002]).unwrap();

        match registry.reserve_ports(&[20001, 20002, 20003]) {
            Err(Error::PortInUse(20002)) => {}
            other => panic!("expected PortInUse(20002), got {other:?}"),
        }

        // Nothing from the failed batch was inserted
        assert_eq!(registry.slot_count(), 1);
    }

    #[test]
    fn test_reserve_duplicate_in_request() {
        let registry = Arc::new(Registry::new());

        match registry.reserve_ports(&[20001, 20001]) {
            Err(Error::PortInUse(20001)) => {}
            other => panic!("expected PortInUse(20001), got {other:?}"),
        }
        assert_eq!(registry.slot_count(), 0);
    }

    #[test]
    fn test_release_guard_idempotent() {
        let registry = Arc::new(Registry::new());

        let reservation = registry.reserve_ports(&[20001, 20002]).unwrap();
        reservation.release();
        assert_eq!(registry.slot_count(), 0);

        // Second release and drop are no-ops
        reservation.release();
        drop(reservation);
        assert_eq!(registry.slot_count(), 0);

        // Ports are reusable afterwards
        assert!(registry.reserve_ports(&[20001]).is_ok());
    }

    #[test]
    fn test_release_on_drop() {
        let registry = Arc::new(Registry::new());

        {
            let _reservation = registry.reserve_ports(&[20001]).unwrap();
            assert_eq!(registry.slot_count(), 1);
        }
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_session() {
        let registry = Arc::new(Registry::new());
        let reservation = registry.reserve_ports(&[20001]).unwrap();

        assert!(registry.get_session(20001).is_none());

        registry
            .bind_session(20001, test_session(), test_socks_handle(20001), test_meta(), 100)
            .unwrap();

        assert!(registry.get_session(20001).is_some());
        reservation.release();
        assert!(registry.get_session(20001).is_none());
    }

    #[tokio::test]
    async fn test_bind_unreserved_port() {
        let registry = Arc::new(Registry::new());

        match registry.bind_session(
            20001,
            test_session(),
            test_socks_handle(20001),
            test_meta(),
            100,
        ) {
            Err(Error::PortNotReserved(20001)) => {}
            other => panic!("expected PortNotReserved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let registry = Arc::new(Registry::new());
        let _reservation = registry.reserve_ports(&[20001]).unwrap();

        registry
            .bind_session(20001, test_session(), test_socks_handle(20001), test_meta(), 100)
            .unwrap();

        match registry.bind_session(
            20001,
            test_session(),
            test_socks_handle(20001),
            test_meta(),
            100,
        ) {
            Err(Error::PortInUse(20001)) => {}
            other => panic!("expected PortInUse, got {other:?}"),
        }
    }

    #[test]
    fn test_release_ports_idempotent() {
        let registry = Arc::new(Registry::new());
        let reservation = registry.reserve_ports(&[20001, 20002]).unwrap();

        registry.release_ports(&[20001, 20002]);
        registry.release_ports(&[20001, 20002]);
        registry.release_ports(&[20001]);
        assert_eq!(registry.slot_count(), 0);

        drop(reservation);
        assert_eq!(registry.slot_count(), 0);
    }

    #[test]
    fn test_release_nonexistent_port() {
        let registry = Arc::new(Registry::new());
        registry.release_ports(&[40000]);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_counting() {
        let registry = Arc::new(Registry::new());
        let _reservation = registry.reserve_ports(&[20001]).unwrap();
        registry
            .bind_session(20001, test_session(), test_socks_handle(20001), test_meta(), 2)
            .unwrap();

        assert!(registry.increment_connections(20001));
        assert!(registry.increment_connections(20001));
        assert_eq!(registry.connection_count(20001), 2);

        // At the cap
        assert!(!registry.increment_connections(20001));
        assert_eq!(registry.connection_count(20001), 2);

        registry.decrement_connections(20001);
        assert_eq!(registry.connection_count(20001), 1);
        assert!(registry.increment_connections(20001));
    }

    #[test]
    fn test_counting_unknown_port() {
        let registry = Arc::new(Registry::new());

        assert!(!registry.increment_connections(40000));
        registry.decrement_connections(40000);
        assert_eq!(registry.connection_count(40000), 0);
    }

    #[test]
    fn test_placeholder_rejects_connections() {
        let registry = Arc::new(Registry::new());
        let _reservation = registry.reserve_ports(&[20001]).unwrap();

        // Reserved but unbound: cap is zero
        assert!(!registry.increment_connections(20001));
    }

    #[tokio::test]
    async fn test_concurrent_increments_respect_cap() {
        let registry = Arc::new(Registry::new());
        let _reservation = registry.reserve_ports(&[20001]).unwrap();
        registry
            .bind_session(20001, test_session(), test_socks_handle(20001), test_meta(), 50)
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.increment_connections(20001)
            }));
        }

        let mut succeeded = 0;
        for task in tasks {
            if task.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 50);
        assert_eq!(registry.connection_count(20001), 50);
    }
}
