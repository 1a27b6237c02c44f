use crate::connection::{Connection, ConnectionType, SharedConnection};
use crate::metrics::Metrics;
use packet_info::ConnectionId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Holds all live connections, split into IP flows and DNS requests.
///
/// A connection lives in exactly one of the two maps; which one is fixed at
/// creation by its type.
pub struct ConnectionStore {
    ip: RwLock<HashMap<ConnectionId, SharedConnection>>,
    dns: RwLock<HashMap<String, SharedConnection>>,
    metrics: Metrics,
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self {
            ip: RwLock::default(),
            dns: RwLock::default(),
            metrics: Metrics::new(),
        }
    }
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection, routing it to the map matching its type.
    ///
    /// Returns the shared handle; an existing connection under the same key
    /// is returned instead of being replaced, resolving creation races
    /// without duplicates.
    pub fn add(&self, conn: Connection) -> SharedConnection {
        match conn.conn_type {
            ConnectionType::Ip => {
                let flow = conn.flow.expect("IP connections carry a flow id");

                let mut ip = self.ip.write();
                if let Some(existing) = ip.get(&flow) {
                    tracing::trace!(conn = %conn.id, "Connection already tracked");
                    return existing.clone();
                }

                self.metrics.connection_added(&conn);

                let shared = Arc::new(Mutex::new(conn));
                ip.insert(flow, shared.clone());
                shared
            }
            ConnectionType::Dns => {
                let mut dns = self.dns.write();
                if let Some(existing) = dns.get(&conn.id) {
                    return existing.clone();
                }

                self.metrics.connection_added(&conn);

                let key = conn.id.clone();
                let shared = Arc::new(Mutex::new(conn));
                dns.insert(key, shared.clone());
                shared
            }
        }
    }

    /// Adds an already-shared connection, e.g. a DNS request flushed from
    /// the attribution registry.
    pub fn add_shared(&self, shared: SharedConnection) {
        let conn = shared.lock();

        match conn.conn_type {
            ConnectionType::Ip => {
                let Some(flow) = conn.flow else { return };

                let mut ip = self.ip.write();
                if !ip.contains_key(&flow) {
                    self.metrics.connection_added(&conn);
                    drop(conn);
                    ip.insert(flow, shared.clone());
                }
            }
            ConnectionType::Dns => {
                let mut dns = self.dns.write();
                if !dns.contains_key(&conn.id) {
                    self.metrics.connection_added(&conn);
                    let key = conn.id.clone();
                    drop(conn);
                    dns.insert(key, shared.clone());
                }
            }
        }
    }

    pub fn get(&self, flow: &ConnectionId) -> Option<SharedConnection> {
        self.ip.read().get(flow).cloned()
    }

    pub fn get_dns(&self, id: &str) -> Option<SharedConnection> {
        self.dns.read().get(id).cloned()
    }

    pub fn remove(&self, flow: &ConnectionId) -> Option<SharedConnection> {
        let removed = self.ip.write().remove(flow);

        if let Some(conn) = &removed {
            self.metrics.connection_removed(&conn.lock());
        }

        removed
    }

    pub fn remove_dns(&self, id: &str) -> Option<SharedConnection> {
        let removed = self.dns.write().remove(id);

        if let Some(conn) = &removed {
            self.metrics.connection_removed(&conn.lock());
        }

        removed
    }

    /// Snapshot of all IP connections.
    pub fn list(&self) -> Vec<SharedConnection> {
        self.ip.read().values().cloned().collect()
    }

    /// Snapshot of all DNS request connections.
    pub fn list_dns(&self) -> Vec<SharedConnection> {
        self.dns.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ip.read().len() + self.dns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_info::testing::tcp_v4_packet_info;
    use std::time::Instant;

    fn tcp_conn() -> Connection {
        Connection::from_packet(&tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443"))
    }

    #[test]
    fn add_then_get_roundtrips() {
        let store = ConnectionStore::new();
        let conn = tcp_conn();
        let flow = conn.flow.unwrap();

        store.add(conn);

        let found = store.get(&flow).unwrap();
        assert_eq!(found.lock().flow, Some(flow));
    }

    #[test]
    fn concurrent_creation_yields_a_single_connection() {
        let store = ConnectionStore::new();

        let first = store.add(tcp_conn());
        let second = store.add(tcp_conn());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ip_and_dns_connections_live_in_separate_maps() {
        let store = ConnectionStore::new();

        store.add(tcp_conn());
        store.add(Connection::from_dns_request(100, "example.com", 1, Instant::now()));

        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list_dns().len(), 1);

        assert!(store.get_dns("dns-100-example.com-1").is_some());
        assert!(store.remove_dns("dns-100-example.com-1").is_some());
        assert!(store.get_dns("dns-100-example.com-1").is_none());
    }
}
