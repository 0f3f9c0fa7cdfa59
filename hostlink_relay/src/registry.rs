// Registry of live virtual connections, keyed by relay-assigned id.
//
// Owned by `RelayLink`. The map sits behind its own mutex so the link thread
// (inbound dispatch, idle checks) and game threads (a connection closing
// itself through `RelaySink::forget`) can both use it. The lock is never held
// while a connection is being closed or a listener is being notified;
// `close_all` empties the map first and closes the drained connections
// afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hostlink_protocol::{CloseReason, ConnectionId};

use crate::connection::{Connection, ConnectionListener, RelaySink, VirtualConnection};
use crate::queue::TaskQueue;

pub struct ConnectionRegistry {
    sink: Weak<dyn RelaySink>,
    dispatcher: Arc<dyn ConnectionListener>,
    queue: Arc<dyn TaskQueue>,
    connections: Mutex<HashMap<ConnectionId, Arc<VirtualConnection>>>,
}

impl ConnectionRegistry {
    pub fn new(
        sink: Weak<dyn RelaySink>,
        dispatcher: Arc<dyn ConnectionListener>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            sink,
            dispatcher,
            queue,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a connection for `id`, wired to the dispatcher.
    ///
    /// Any connection already registered under `id` is replaced and closed
    /// quietly; the relay only reuses an id after it announced the old close.
    /// The caller announces `connected` once this returns.
    pub fn add(&self, id: ConnectionId) -> Arc<VirtualConnection> {
        let conn = VirtualConnection::new(id, self.sink.clone(), self.queue.clone());
        conn.add_listener(self.dispatcher.clone());
        let replaced = self.lock().insert(id, conn.clone());
        if let Some(stale) = replaced {
            log::warn!("relay reused live connection id {id}; dropping the old one");
            stale.close_quietly(CloseReason::Error);
        }
        conn
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<VirtualConnection>> {
        self.lock().get(&id).cloned()
    }

    /// Look `id` up, creating it if unknown. The flag is true on creation.
    pub fn get_or_add(&self, id: ConnectionId) -> (Arc<VirtualConnection>, bool) {
        if let Some(conn) = self.get(id) {
            return (conn, false);
        }
        (self.add(id), true)
    }

    /// Remove `conn` if it is the connection registered under its id.
    pub fn remove(&self, conn: &Arc<VirtualConnection>) -> bool {
        let mut connections = self.lock();
        let id = conn.id();
        match connections.get(&id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn remove_id(&self, id: ConnectionId) -> Option<Arc<VirtualConnection>> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<VirtualConnection>> {
        self.lock().values().cloned().collect()
    }

    /// Empty the registry and close every connection without telling the
    /// relay. Returns how many were closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<_> = self.lock().drain().map(|(_, conn)| conn).collect();
        for conn in &drained {
            conn.close_quietly(reason);
        }
        drained.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<VirtualConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
