//! In-memory socket-table source for tests.

use crate::{BindInfo, ConnectionInfo, SocketTableSource, TableKind, TableSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use warden_model::Pid;

/// A [`SocketTableSource`] backed by fixture data.
///
/// PIDs attached to fixture sockets are returned directly from the snapshot;
/// sockets registered with `pid: None` exercise the PID-discovery path (and
/// fail it, unless a PID is registered via [`FakeSource::with_pid`]).
#[derive(Debug, Default)]
pub struct FakeSource {
    tables: Mutex<HashMap<TableKind, TableSnapshot>>,
    pids: Mutex<HashMap<(u32, u64), Pid>>,
    reads: Mutex<HashMap<TableKind, usize>>,
}

impl FakeSource {
    pub fn with_tcp4_listener(self, local: &str, uid: u32, inode: u64, pid: Option<Pid>) -> Self {
        self.push_bind(TableKind::Tcp4, local, uid, inode, pid)
    }

    pub fn with_tcp6_listener(self, local: &str, uid: u32, inode: u64, pid: Option<Pid>) -> Self {
        self.push_bind(TableKind::Tcp6, local, uid, inode, pid)
    }

    pub fn with_udp4_bind(self, local: &str, uid: u32, inode: u64, pid: Option<Pid>) -> Self {
        self.push_bind(TableKind::Udp4, local, uid, inode, pid)
    }

    pub fn with_udp6_bind(self, local: &str, uid: u32, inode: u64, pid: Option<Pid>) -> Self {
        self.push_bind(TableKind::Udp6, local, uid, inode, pid)
    }

    pub fn with_tcp4_connection(
        self,
        local: &str,
        remote: &str,
        uid: u32,
        inode: u64,
        pid: Option<Pid>,
    ) -> Self {
        let local: SocketAddr = local.parse().expect("valid local address");
        let remote: SocketAddr = remote.parse().expect("valid remote address");

        self.tables
            .lock()
            .entry(TableKind::Tcp4)
            .or_default()
            .connections
            .push(ConnectionInfo {
                local,
                remote,
                uid,
                inode,
                pid,
            });

        self
    }

    /// Registers a `(uid, inode) -> pid` mapping for PID discovery.
    pub fn with_pid(self, uid: u32, inode: u64, pid: Pid) -> Self {
        self.pids.lock().insert((uid, inode), pid);
        self
    }

    /// How often a table has been read from this source.
    pub fn reads(&self, kind: TableKind) -> usize {
        self.reads.lock().get(&kind).copied().unwrap_or(0)
    }

    fn push_bind(self, kind: TableKind, local: &str, uid: u32, inode: u64, pid: Option<Pid>) -> Self {
        let local: SocketAddr = local.parse().expect("valid local address");

        self.tables.lock().entry(kind).or_default().binds.push(BindInfo {
            listens_any: local.ip().is_unspecified(),
            local,
            uid,
            inode,
            pid,
        });

        self
    }
}

impl SocketTableSource for FakeSource {
    fn read(&self, kind: TableKind) -> std::io::Result<TableSnapshot> {
        *self.reads.lock().entry(kind).or_default() += 1;

        Ok(self.tables.lock().get(&kind).cloned().unwrap_or_default())
    }

    fn find_pid(&self, uid: u32, inode: u64) -> Option<Pid> {
        self.pids.lock().get(&(uid, inode)).copied()
    }
}
