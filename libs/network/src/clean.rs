//! Connection aging.
//!
//! The passes are pure in `now` so they can be driven by the 5 s cleaner
//! worker in production and by explicit instants in tests.

use crate::connection::ConnectionType;
use crate::{
    ConnectionStore, ENDED_RETENTION, INCOMPLETE_RETENTION, PACKET_IDLE_TTL, STREAM_IDLE_TTL,
};
use packet_info::ConnectionId;
use std::time::{Duration, Instant};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub ended: usize,
    pub deleted: usize,
}

/// Ends connections that are idle or no longer backed by an OS socket, then
/// deletes what has been ended (or incomplete) for long enough.
///
/// `is_alive` consults the socket tables; it is only asked about complete,
/// un-ended IP connections.
pub fn clean(
    store: &ConnectionStore,
    now: Instant,
    mut is_alive: impl FnMut(&ConnectionId) -> bool,
) -> CleanStats {
    let mut stats = CleanStats::default();
    let mut delete = Vec::new();

    for shared in store.list() {
        let mut conn = shared.lock();

        if !conn.has_ended() {
            if !conn.data_complete {
                if now.duration_since(conn.started_mono) >= INCOMPLETE_RETENTION {
                    // Gathering never finished; drop the stub without a
                    // retention period.
                    delete.push(conn.flow);
                    stats.deleted += 1;
                }
                continue;
            }

            let idle = now.duration_since(conn.last_seen);
            let expired = idle >= idle_ttl(&conn);
            let socket_gone =
                idle >= Duration::from_secs(5) && conn.flow.is_some_and(|flow| !is_alive(&flow));

            if expired || socket_gone {
                conn.end(now);
                stats.ended += 1;
            }
            continue;
        }

        if conn
            .ended_mono
            .is_some_and(|ended| now.duration_since(ended) >= ENDED_RETENTION)
        {
            delete.push(conn.flow);
            stats.deleted += 1;
        }
    }

    for flow in delete.into_iter().flatten() {
        store.remove(&flow);
    }

    // DNS request connections are born ended; only the retention applies.
    let mut delete_dns = Vec::new();
    for shared in store.list_dns() {
        let conn = shared.lock();

        if conn
            .ended_mono
            .is_some_and(|ended| now.duration_since(ended) >= ENDED_RETENTION)
        {
            delete_dns.push(conn.id.clone());
            stats.deleted += 1;
        }
    }

    for id in delete_dns {
        store.remove_dns(&id);
    }

    stats
}

fn idle_ttl(conn: &crate::Connection) -> Duration {
    match conn.conn_type {
        ConnectionType::Dns => ENDED_RETENTION,
        ConnectionType::Ip if conn.protocol.has_ports() => STREAM_IDLE_TTL,
        ConnectionType::Ip => PACKET_IDLE_TTL,
    }
}
