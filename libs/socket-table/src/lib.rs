//! Answers "which process owns this 5-tuple, and is it inbound?" from
//! periodically refreshed snapshots of the OS socket tables.
//!
//! Four tables (TCP4/TCP6/UDP4/UDP6) are cached behind a call limiter so
//! that concurrent lookups never hammer the OS source. Lookups retry a few
//! times because the packet usually races the kernel's own table update.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod info;
mod proc;
mod table;
mod udp_state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use info::{BindInfo, ConnectionInfo, TableKind, TableSnapshot};
pub use proc::parse_proc_net;
#[cfg(target_os = "linux")]
pub use proc::ProcFsSource;
pub use udp_state::UdpDirectionMap;

use packet_info::{IpVersion, PacketInfo, TransportProtocol};
use std::sync::Arc;
use std::time::{Duration, Instant};
use table::Table;
use warden_model::Pid;

/// Attempts for a regular lookup before giving up on the socket.
const LOOKUP_RETRIES: usize = 5;
/// Attempts for a fast-path lookup.
const LOOKUP_RETRIES_FAST: usize = 2;
/// Spacing between lookup attempts; slightly above the table refresh limit
/// so every retry can observe a fresh snapshot.
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(15);
/// Attempts to resolve a found socket to its PID.
const PID_RETRIES: usize = 5;

/// Reads one OS socket table and resolves socket inodes to processes.
///
/// This is the per-OS seam: Linux reads procfs, tests use an in-memory
/// source.
pub trait SocketTableSource: Send + Sync + 'static {
    fn read(&self, kind: TableKind) -> std::io::Result<TableSnapshot>;

    /// Resolves a socket inode to the PID holding it, scoped to the UID that
    /// owns the socket.
    fn find_pid(&self, uid: u32, inode: u64) -> Option<Pid>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("No socket found for packet")]
    NoSocket,
    /// The socket exists but no process could be attributed to it.
    #[error("No process found for socket (inbound: {inbound})")]
    NoProcess { inbound: bool },
    #[error("Unsupported protocol {0}")]
    UnsupportedProtocol(TransportProtocol),
}

/// The façade over all four OS socket tables.
pub struct SocketTables {
    source: Arc<dyn SocketTableSource>,
    tcp4: Table,
    tcp6: Table,
    udp4: Table,
    udp6: Table,
    udp4_states: UdpDirectionMap,
    udp6_states: UdpDirectionMap,
}

impl SocketTables {
    pub fn new(source: Arc<dyn SocketTableSource>) -> Self {
        Self {
            source,
            tcp4: Table::new(TableKind::Tcp4),
            tcp6: Table::new(TableKind::Tcp6),
            udp4: Table::new(TableKind::Udp4),
            udp6: Table::new(TableKind::Udp6),
            udp4_states: UdpDirectionMap::default(),
            udp6_states: UdpDirectionMap::default(),
        }
    }

    /// Looks up the process and direction for a packet.
    ///
    /// Retries a few times ([`LOOKUP_RETRIES`], or [`LOOKUP_RETRIES_FAST`]
    /// with `fast`) to absorb the race between seeing a packet and the
    /// kernel publishing the socket.
    pub async fn lookup(&self, info: &PacketInfo, fast: bool) -> Result<(Pid, bool), LookupError> {
        if info.pid.is_some() || !matches!(info.protocol, TransportProtocol::Tcp | TransportProtocol::Udp) {
            // The interceptor either knows better or the protocol has no
            // socket representation (ICMP et al).
            return match info.pid {
                Some(pid) => Ok((pid, info.inbound)),
                None => Err(LookupError::UnsupportedProtocol(info.protocol)),
            };
        }

        let retries = if fast { LOOKUP_RETRIES_FAST } else { LOOKUP_RETRIES };

        let mut socket = None;
        for attempt in 0..retries {
            if attempt > 0 {
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }

            socket = self.find_socket(info, Instant::now());
            if socket.is_some() {
                break;
            }
        }

        let Some((uid, inode, pid, inbound)) = socket else {
            return Err(LookupError::NoSocket);
        };

        if let Some(pid) = pid {
            return Ok((pid, inbound));
        }

        // The table knows the socket but not the process; walk the OS
        // process list with a small backoff.
        for attempt in 0..PID_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(5 * attempt as u64)).await;
            }

            if let Some(pid) = self.source.find_pid(uid, inode) {
                return Ok((pid, inbound));
            }
        }

        tracing::debug!(%uid, %inode, "Socket found but no owning process");

        Err(LookupError::NoProcess { inbound })
    }

    /// Whether any socket (regardless of process attribution) backs this
    /// packet's 5-tuple. Used by the cleaner to spot vanished flows.
    pub fn has_socket(&self, info: &PacketInfo, now: Instant) -> bool {
        self.find_socket(info, now).is_some()
    }

    /// Single-pass lookup without retries, for callers that cannot wait.
    ///
    /// Used e.g. to check whether the other end of a local connection
    /// belongs to a specific process.
    pub fn lookup_once(&self, info: &PacketInfo, now: Instant) -> Option<(Pid, bool)> {
        if let Some(pid) = info.pid {
            return Some((pid, info.inbound));
        }

        let (uid, inode, pid, inbound) = self.find_socket(info, now)?;

        match pid {
            Some(pid) => Some((pid, inbound)),
            None => self.source.find_pid(uid, inode).map(|pid| (pid, inbound)),
        }
    }

    /// One search pass over the (possibly refreshed) tables.
    ///
    /// Returns `(uid, inode, pid, inbound)`.
    fn find_socket(&self, info: &PacketInfo, now: Instant) -> Option<(u32, u64, Option<Pid>, bool)> {
        match (info.protocol, info.version) {
            (TransportProtocol::Tcp, IpVersion::V4) => {
                self.find_tcp(&self.tcp4, Some(&self.tcp6), info, now)
            }
            (TransportProtocol::Tcp, IpVersion::V6) => self.find_tcp(&self.tcp6, None, info, now),
            (TransportProtocol::Udp, IpVersion::V4) => {
                self.find_udp(&self.udp4, Some(&self.udp6), &self.udp4_states, info, now)
            }
            (TransportProtocol::Udp, IpVersion::V6) => {
                self.find_udp(&self.udp6, None, &self.udp6_states, info, now)
            }
            _ => None,
        }
    }

    fn find_tcp(
        &self,
        table: &Table,
        dual_stack: Option<&Table>,
        info: &PacketInfo,
        now: Instant,
    ) -> Option<(u32, u64, Option<Pid>, bool)> {
        table.refresh(self.source.as_ref(), now);

        let snapshot = table.snapshot();

        // Listeners first: an accepted socket shares its listener's process,
        // and only inbound flows have a listener on the local port.
        if let Some(bind) = snapshot.find_bind(info.local_ip(), info.local_port()) {
            return Some((bind.uid, bind.inode, bind.pid, true));
        }

        if let Some(conn) = snapshot.find_connection(
            info.local_ip(),
            info.local_port(),
            info.remote_ip(),
            info.remote_port(),
        ) {
            return Some((conn.uid, conn.inode, conn.pid, false));
        }

        drop(snapshot);

        // IPv4-mapped sockets of dual-stack listeners only show up in the
        // IPv6 table.
        if let Some(other) = dual_stack {
            other.refresh(self.source.as_ref(), now);

            if let Some(bind) = other.snapshot().find_any_bind(info.local_port()) {
                return Some((bind.uid, bind.inode, bind.pid, true));
            }
        }

        None
    }

    fn find_udp(
        &self,
        table: &Table,
        dual_stack: Option<&Table>,
        states: &UdpDirectionMap,
        info: &PacketInfo,
        now: Instant,
    ) -> Option<(u32, u64, Option<Pid>, bool)> {
        table.refresh(self.source.as_ref(), now);

        let bind = {
            let snapshot = table.snapshot();
            snapshot.find_bind(info.local_ip(), info.local_port()).cloned()
        };

        let bind = bind.or_else(|| {
            let other = dual_stack?;
            other.refresh(self.source.as_ref(), now);

            other.snapshot().find_any_bind(info.local_port()).cloned()
        })?;

        // UDP sockets are directionless; the first packet seen for a remote
        // decides the direction of that exchange.
        let inbound = states.check_or_register(
            (info.local_ip(), info.local_port()),
            (info.remote_ip(), info.remote_port()),
            info.inbound,
            now,
        );

        Some((bind.uid, bind.inode, bind.pid, inbound))
    }

    /// Ages out stale UDP direction entries. Called by the cleaner.
    pub fn shrink_udp_states(&self, now: Instant) {
        self.udp4_states.shrink(now);
        self.udp6_states.shrink(now);
    }
}
