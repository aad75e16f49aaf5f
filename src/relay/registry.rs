//! The set of live connections, owned by the event loop.

use std::collections::BTreeMap;

use crate::relay::connection::{Connection, ConnectionId};

/// Live connections keyed by id.
///
/// Only the event loop touches it, so there is no locking. Helpers refer to
/// connections by id; an id that is no longer registered simply misses.
#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Ids are unique, so a connection appears at most once.
    pub fn register(&mut self, conn: Connection) -> ConnectionId {
        let id = conn.id();
        let previous = self.connections.insert(id, conn);
        debug_assert!(previous.is_none(), "{id} registered twice");
        id
    }

    /// Remove and destroy a connection.
    ///
    /// Returns false if it was not registered; unregistering twice is a
    /// harmless no-op.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(conn) => {
                drop(conn);
                true
            }
            None => {
                tracing::debug!(connection_id = %id, "Unregister of unknown connection");
                false
            }
        }
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Visit every live connection.
    pub fn for_each<F>(&mut self, mut visit: F)
    where
        F: FnMut(&mut Connection),
    {
        for conn in self.connections.values_mut() {
            visit(conn);
        }
    }

    /// Destroy every connection.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
