//! Live connections per binding.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tether_core::ConnectionId;

use super::connection::Connection;

/// Tracks the connections a binding is currently serving.
#[derive(Default)]
pub struct SessionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn add(&self, connection: Arc<Connection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
    }

    /// Remove a connection. Returns it if it was present.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(id)
    }

    /// Look up a connection by id.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::TransportKind;

    #[test]
    fn add_get_remove() {
        let registry = SessionRegistry::new();
        let conn = Arc::new(Connection::new(TransportKind::Raw, "a"));
        let id = conn.id.clone();
        registry.add(conn);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.get(&id).unwrap().remote_address, "a");

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn snapshot_lists_all() {
        let registry = SessionRegistry::new();
        for peer in ["a", "b", "c"] {
            registry.add(Arc::new(Connection::new(TransportKind::Framed, peer)));
        }
        let mut peers: Vec<_> = registry
            .connections()
            .iter()
            .map(|c| c.remote_address.clone())
            .collect();
        peers.sort();
        assert_eq!(peers, vec!["a", "b", "c"]);
    }
}
