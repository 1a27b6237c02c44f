use crate::DNS_REQUEST_TTL;
use crate::connection::SharedConnection;
use crate::entity::canonical_domain;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;
use warden_model::Pid;

/// Short-lived registry of open DNS requests.
///
/// Entries are consumed by the follow-up IP connection they triggered, or
/// flushed to history once the 3 s window lapses. A second index maps the
/// local socket a query left on to the querying PID, so the resolver can
/// attribute a stub query without a socket-table lookup.
#[derive(Default)]
pub struct DnsRequestIndex {
    by_query: Mutex<HashMap<QueryKey, PendingRequest>>,
    by_socket: Mutex<HashMap<SocketKey, SocketHint>>,
}

type QueryKey = (Pid, String, u16);
type SocketKey = (u8, IpAddr, u16);

struct PendingRequest {
    conn: SharedConnection,
    registered: Instant,
}

struct SocketHint {
    pid: Pid,
    registered: Instant,
}

impl DnsRequestIndex {
    /// Registers an open DNS request connection.
    ///
    /// A re-query within the window replaces (and discards) the previous
    /// pending connection as a duplicate.
    pub fn register_request(
        &self,
        pid: Pid,
        fqdn: &str,
        qtype: u16,
        conn: SharedConnection,
        now: Instant,
    ) {
        let key = (pid, canonical_domain(fqdn), qtype);

        self.by_query
            .lock()
            .insert(key, PendingRequest { conn, registered: now });
    }

    /// Consumes the pending request matching a follow-up connection.
    pub fn take_request(&self, pid: Pid, fqdn: &str, qtype: u16) -> Option<SharedConnection> {
        self.by_query
            .lock()
            .remove(&(pid, canonical_domain(fqdn), qtype))
            .map(|pending| pending.conn)
    }

    /// Any pending request for the domain, regardless of query type.
    pub fn take_request_any_type(&self, pid: Pid, fqdn: &str) -> Option<SharedConnection> {
        let fqdn = canonical_domain(fqdn);
        let mut by_query = self.by_query.lock();

        let key = by_query
            .keys()
            .find(|(p, d, _)| *p == pid && *d == fqdn)
            .cloned()?;

        by_query.remove(&key).map(|pending| pending.conn)
    }

    /// Remembers which PID sent a DNS query from the given local socket.
    pub fn register_socket_hint(
        &self,
        protocol: u8,
        local_ip: IpAddr,
        local_port: u16,
        pid: Pid,
        now: Instant,
    ) {
        self.by_socket
            .lock()
            .insert((protocol, local_ip, local_port), SocketHint { pid, registered: now });
    }

    /// The PID that sent a DNS query from the given local socket, if the
    /// hint is still fresh.
    pub fn pid_for_socket(&self, protocol: u8, local_ip: IpAddr, local_port: u16) -> Option<Pid> {
        self.by_socket
            .lock()
            .get(&(protocol, local_ip, local_port))
            .map(|hint| hint.pid)
    }

    /// Removes expired entries and returns the unanswered DNS request
    /// connections, which the caller writes to history.
    pub fn flush_expired(&self, now: Instant) -> Vec<SharedConnection> {
        let mut expired = Vec::new();

        self.by_query.lock().retain(|_, pending| {
            if now.duration_since(pending.registered) < DNS_REQUEST_TTL {
                return true;
            }

            expired.push(pending.conn.clone());
            false
        });

        self.by_socket
            .lock()
            .retain(|_, hint| now.duration_since(hint.registered) < DNS_REQUEST_TTL);

        expired
    }

    pub fn len(&self) -> usize {
        self.by_query.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::sync::Arc;
    use std::time::Duration;

    fn dns_conn(pid: Pid, fqdn: &str, now: Instant) -> SharedConnection {
        Arc::new(Mutex::new(Connection::from_dns_request(pid, fqdn, 1, now)))
    }

    #[test]
    fn follow_up_consumes_pending_request() {
        let index = DnsRequestIndex::default();
        let now = Instant::now();

        index.register_request(100, "Example.COM.", 1, dns_conn(100, "example.com", now), now);

        assert!(index.take_request(100, "example.com", 1).is_some());
        assert!(index.take_request(100, "example.com", 1).is_none());
    }

    #[test]
    fn requests_match_per_pid() {
        let index = DnsRequestIndex::default();
        let now = Instant::now();

        index.register_request(100, "example.com", 1, dns_conn(100, "example.com", now), now);

        assert!(index.take_request(200, "example.com", 1).is_none());
        assert!(index.take_request_any_type(100, "example.com").is_some());
    }

    #[test]
    fn expired_requests_are_flushed_for_saving() {
        let index = DnsRequestIndex::default();
        let start = Instant::now();

        index.register_request(100, "example.com", 1, dns_conn(100, "example.com", start), start);

        assert!(index.flush_expired(start + Duration::from_secs(1)).is_empty());

        let flushed = index.flush_expired(start + DNS_REQUEST_TTL);
        assert_eq!(flushed.len(), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn socket_hints_expire_with_the_window() {
        let index = DnsRequestIndex::default();
        let start = Instant::now();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        index.register_socket_hint(17, ip, 54321, 100, start);

        assert_eq!(index.pid_for_socket(17, ip, 54321), Some(100));

        index.flush_expired(start + DNS_REQUEST_TTL);
        assert_eq!(index.pid_for_socket(17, ip, 54321), None);
    }
}
