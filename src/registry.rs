//! Live connections of a server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// The set of connections a server has accepted and not yet closed.
///
/// Every registered connection gets a child of the server's shutdown
/// token, so cancelling the server cancels all of them at once while
/// each can still be closed on its own.
#[derive(Debug)]
pub struct Registry {
    shutdown: CancellationToken,
    connections: Mutex<HashMap<u64, Entry>>,
}

#[derive(Debug)]
struct Entry {
    peer_addr: SocketAddr,
    token: CancellationToken,
}

impl Registry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection and return the token that closes it.
    pub fn register(&self, id: u64, peer_addr: SocketAddr) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.lock().insert(
            id,
            Entry {
                peer_addr,
                token: token.clone(),
            },
        );
        token
    }

    /// Remove a connection once it has closed.
    pub fn unregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Close a single connection.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().get(&id).is_some_and(|entry| {
            entry.token.cancel();
            true
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn peers(&self) -> Vec<(u64, SocketAddr)> {
        let mut peers: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.peer_addr))
            .collect();
        peers.sort_unstable_by_key(|(id, _)| *id);
        peers
    }

    // The map holds no invariant a panicking holder could break.
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn register_and_unregister() {
        let registry = Registry::new(CancellationToken::new());
        registry.register(1, addr(1000));
        registry.register(2, addr(1001));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.peers(), vec![(1, addr(1000)), (2, addr(1001))]);

        registry.unregister(1);
        assert_eq!(registry.peers(), vec![(2, addr(1001))]);
    }

    #[test]
    fn shutdown_cancels_every_connection() {
        let shutdown = CancellationToken::new();
        let registry = Registry::new(shutdown.clone());
        let a = registry.register(1, addr(1000));
        let b = registry.register(2, addr(1001));

        shutdown.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn cancel_single_connection() {
        let registry = Registry::new(CancellationToken::new());
        let a = registry.register(1, addr(1000));
        let b = registry.register(2, addr(1001));

        assert!(registry.cancel(1));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!registry.cancel(3));
    }
}
