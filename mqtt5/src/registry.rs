//! Session registry and per-session packet identifier pools.
//!
//! Sessions live in an arena keyed by a stable [`SessionId`]. The client
//! identifier index points at the session that currently owns that
//! identifier, so an older connection's teardown cannot clobber a newer one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::Publish;
use crate::types::ReasonCode;

/// Stable identifier of one connection's session.
pub type SessionId = u64;

/// Message pushed into a connection task from outside.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Outbound PUBLISH routed to this session.
    Publish(Publish),
    /// Close the connection, sending DISCONNECT with this reason.
    Close(ReasonCode),
}

/// Handle used to reach a live connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub client_id: Arc<str>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl SessionHandle {
    pub fn new(session_id: SessionId, client_id: Arc<str>, tx: mpsc::UnboundedSender<Delivery>) -> Self {
        Self {
            session_id,
            client_id,
            tx,
        }
    }

    /// Queue a delivery. Returns false if the connection task is gone.
    pub fn send(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

/// Packet identifiers in flight for one client.
#[derive(Debug, Default)]
pub struct PacketIdPool {
    next: u16,
    outstanding: HashSet<u16>,
}

impl PacketIdPool {
    /// Allocate the next free identifier, skipping 0 and outstanding ids.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.outstanding.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next != 0 && !self.outstanding.contains(&self.next) {
                self.outstanding.insert(self.next);
                return Some(self.next);
            }
        }
    }

    /// Release an identifier. Releasing an unknown id is a no-op.
    pub fn release(&mut self, id: u16) -> bool {
        self.outstanding.remove(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.outstanding.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

struct SessionEntry {
    handle: SessionHandle,
    packet_ids: PacketIdPool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    by_client: HashMap<Arc<str>, SessionId>,
}

/// Registry of live sessions.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh session id.
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a session as the owner of its client id.
    ///
    /// Returns the handle of the session previously owning that client id.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut inner = self.inner.write();
        let mut previous = None;
        if let Some(old) = inner.by_client.insert(handle.client_id.clone(), handle.session_id) {
            previous = inner.sessions.remove(&old).map(|entry| entry.handle);
        }
        inner.sessions.insert(
            handle.session_id,
            SessionEntry {
                handle,
                packet_ids: PacketIdPool::default(),
            },
        );
        previous
    }

    /// Remove a session. Only the current owner of the client id is unindexed.
    pub fn unregister(&self, handle: &SessionHandle) -> bool {
        let mut inner = self.inner.write();
        if inner.sessions.remove(&handle.session_id).is_none() {
            return false;
        }
        if inner.by_client.get(&handle.client_id) == Some(&handle.session_id) {
            inner.by_client.remove(&handle.client_id);
        }
        true
    }

    /// True if `handle` is the session currently registered for its client id.
    pub fn is_current(&self, handle: &SessionHandle) -> bool {
        self.inner.read().by_client.get(&handle.client_id) == Some(&handle.session_id)
    }

    /// Live handle for a client id.
    pub fn lookup(&self, client_id: &str) -> Option<SessionHandle> {
        let inner = self.inner.read();
        let id = inner.by_client.get(client_id)?;
        inner.sessions.get(id).map(|entry| entry.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_pool<R>(&self, session_id: SessionId, f: impl FnOnce(&mut PacketIdPool) -> R) -> Option<R> {
        self.inner
            .write()
            .sessions
            .get_mut(&session_id)
            .map(|entry| f(&mut entry.packet_ids))
    }

    /// Allocate an outbound packet identifier for a session.
    pub fn allocate(&self, session_id: SessionId) -> Option<u16> {
        self.with_pool(session_id, PacketIdPool::allocate).flatten()
    }

    /// Release an outbound packet identifier. A session that has been taken
    /// over or removed has no pool, so this is a no-op for it.
    pub fn release(&self, session_id: SessionId, packet_id: u16) -> bool {
        self.with_pool(session_id, |pool| pool.release(packet_id)).unwrap_or(false)
    }

    /// True if `packet_id` is outstanding for the session.
    pub fn contains(&self, session_id: SessionId, packet_id: u16) -> bool {
        self.inner
            .read()
            .sessions
            .get(&session_id)
            .is_some_and(|entry| entry.packet_ids.contains(packet_id))
    }

    /// True if `packet_id` is outstanding for the session owning `client_id`.
    pub fn has(&self, client_id: &str, packet_id: u16) -> bool {
        let inner = self.inner.read();
        inner
            .by_client
            .get(client_id)
            .and_then(|id| inner.sessions.get(id))
            .is_some_and(|entry| entry.packet_ids.contains(packet_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(registry: &Registry, client_id: &str) -> (SessionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(registry.next_session_id(), client_id.into(), tx), rx)
    }

    #[test]
    fn test_allocate_skips_zero_and_outstanding() {
        let mut pool = PacketIdPool::default();
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));

        pool.next = u16::MAX - 1;
        assert_eq!(pool.allocate(), Some(u16::MAX));
        // Wraps past 0 and skips 1 and 2, still outstanding.
        assert_eq!(pool.allocate(), Some(3));
    }

    #[test]
    fn test_release_is_idempotent_and_reusable() {
        let mut pool = PacketIdPool::default();
        let id = pool.allocate().unwrap();
        assert!(pool.release(id));
        assert!(!pool.release(id));
        assert!(!pool.contains(id));

        pool.next = id - 1;
        assert_eq!(pool.allocate(), Some(id));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = PacketIdPool::default();
        for _ in 0..u16::MAX {
            assert!(pool.allocate().is_some());
        }
        assert_eq!(pool.allocate(), None);

        pool.release(1234);
        assert_eq!(pool.allocate(), Some(1234));
    }

    #[test]
    fn test_no_duplicate_outstanding_ids() {
        let mut pool = PacketIdPool::default();
        let mut seen = HashSet::new();
        for i in 0..1000u16 {
            let id = pool.allocate().unwrap();
            assert!(seen.insert(id));
            if i % 3 == 0 {
                pool.release(id);
                seen.remove(&id);
            }
        }
    }

    #[test]
    fn test_takeover_keeps_newer_session() {
        let registry = Registry::new();
        let (old, _old_rx) = handle(&registry, "dev");
        let (new, _new_rx) = handle(&registry, "dev");

        assert!(registry.register(old.clone()).is_none());
        assert_eq!(registry.allocate(old.session_id), Some(1));

        let previous = registry.register(new.clone()).unwrap();
        assert_eq!(previous.session_id, old.session_id);
        assert!(!registry.has("dev", 1));

        // The old connection's teardown leaves the new session in place.
        assert!(!registry.unregister(&old));
        assert!(registry.is_current(&new));
        assert_eq!(registry.lookup("dev").unwrap().session_id, new.session_id);

        assert!(registry.unregister(&new));
        assert!(registry.lookup("dev").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_taken_over_session_cannot_touch_new_pool() {
        let registry = Registry::new();
        let (old, _old_rx) = handle(&registry, "dev");
        let (new, _new_rx) = handle(&registry, "dev");

        registry.register(old.clone());
        assert_eq!(registry.allocate(old.session_id), Some(1));
        registry.register(new.clone());
        assert_eq!(registry.allocate(new.session_id), Some(1));

        // Late acks on the old connection must not free the new session's ids.
        assert!(!registry.release(old.session_id, 1));
        assert_eq!(registry.allocate(old.session_id), None);
        assert!(registry.contains(new.session_id, 1));
        assert!(registry.has("dev", 1));
    }

    #[test]
    fn test_pool_per_client() {
        let registry = Registry::new();
        let (a, _ra) = handle(&registry, "a");
        let (b, _rb) = handle(&registry, "b");
        let (a_id, b_id) = (a.session_id, b.session_id);
        registry.register(a);
        registry.register(b);

        assert_eq!(registry.allocate(a_id), Some(1));
        assert_eq!(registry.allocate(b_id), Some(1));
        assert!(registry.has("a", 1));
        assert!(registry.release(a_id, 1));
        assert!(!registry.has("a", 1));
        assert!(registry.contains(b_id, 1));
        assert_eq!(registry.allocate(b_id + 100), None);
    }
}
