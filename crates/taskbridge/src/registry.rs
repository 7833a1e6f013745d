//! Bookkeeping for open coordinator connections.
//!
//! Used for status reporting and for asking every connection to wind down on
//! shutdown. Entries are removed by a `ConnectionGuard` when the connection
//! task ends, however it ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Process-unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionEntry {
    peer: SocketAddr,
    opened_at: String,
    requests_served: Arc<AtomicU64>,
    close: CancellationToken,
}

/// Snapshot of one open connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub opened_at: String,
    pub requests_served: u64,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a new connection. The returned guard deregisters it on drop.
    ///
    /// `close` is the token the connection watches; pass a child of the
    /// server's shutdown token so shutdown reaches connections accepted late.
    pub fn register(self: &Arc<Self>, peer: SocketAddr, close: CancellationToken) -> ConnectionGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let requests_served = Arc::new(AtomicU64::new(0));

        self.entries.insert(
            id,
            ConnectionEntry {
                peer,
                opened_at: crate::bridge::protocol::now_iso8601(),
                requests_served: Arc::clone(&requests_served),
                close: close.clone(),
            },
        );

        ConnectionGuard {
            id,
            close,
            requests_served,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .entries
            .iter()
            .map(|e| ConnectionInfo {
                id: *e.key(),
                peer: e.peer,
                opened_at: e.opened_at.clone(),
                requests_served: e.requests_served.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by_key(|i| i.id.0);
        infos
    }

    /// Signal every open connection to close once its in-flight request is answered.
    ///
    /// Returns how many connections were signalled.
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for entry in self.entries.iter() {
            entry.close.cancel();
            count += 1;
        }
        count
    }
}

/// Held by a connection task for its whole lifetime.
pub struct ConnectionGuard {
    id: ConnectionId,
    close: CancellationToken,
    requests_served: Arc<AtomicU64>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves when `close_all()` has asked this connection to finish.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.entries.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn register_and_drop() {
        let registry = ConnectionRegistry::new();
        let guard = registry.register(peer(), CancellationToken::new());
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_distinct() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(peer(), CancellationToken::new());
        let b = registry.register(peer(), CancellationToken::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string(), "conn-1");
    }

    #[test]
    fn snapshot_reports_request_counts() {
        let registry = ConnectionRegistry::new();
        let guard = registry.register(peer(), CancellationToken::new());
        guard.record_request();
        guard.record_request();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].requests_served, 2);
        assert_eq!(snapshot[0].peer, peer());
    }

    #[test]
    fn parent_cancellation_reaches_connection() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let guard = registry.register(peer(), parent.child_token());

        parent.cancel();
        assert!(guard.close_token().is_cancelled());
    }

    #[test]
    fn close_all_cancels_every_connection() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(peer(), CancellationToken::new());
        let b = registry.register(peer(), CancellationToken::new());

        assert_eq!(registry.close_all(), 2);
        assert!(a.close_token().is_cancelled());
        assert!(b.close_token().is_cancelled());
    }
}
