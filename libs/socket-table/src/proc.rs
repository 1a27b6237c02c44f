//! Parsing of the procfs socket tables.
//!
//! The parser is pure so it can be exercised with fixture content on any
//! platform; only [`ProcFsSource`] touches the filesystem.

use crate::{BindInfo, ConnectionInfo, TableKind, TableSnapshot};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const TCP_STATE_TIME_WAIT: u8 = 0x06;
const TCP_STATE_LISTEN: u8 = 0x0a;

/// Parses the content of a `/proc/net/{tcp,tcp6,udp,udp6}` file.
///
/// Rows that cannot be parsed are skipped; the kernel appends columns over
/// time and occasionally races its own writers.
pub fn parse_proc_net(kind: TableKind, content: &str) -> TableSnapshot {
    let mut snapshot = TableSnapshot::default();

    for line in content.lines().skip(1) {
        let Some(row) = parse_row(kind, line) else {
            continue;
        };

        match row {
            Row::Bind(bind) => snapshot.binds.push(bind),
            Row::Connection(conn) => snapshot.connections.push(conn),
        }
    }

    snapshot
}

enum Row {
    Bind(BindInfo),
    Connection(ConnectionInfo),
}

fn parse_row(kind: TableKind, line: &str) -> Option<Row> {
    let mut fields = line.split_whitespace();

    let _sl = fields.next()?;
    let local = parse_socket_addr(fields.next()?)?;
    let remote = parse_socket_addr(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;
    let _queues = fields.next()?;
    let _timer = fields.next()?;
    let _retrnsmt = fields.next()?;
    let uid = fields.next()?.parse().ok()?;
    let _timeout = fields.next()?;
    let inode = fields.next()?.parse().ok()?;

    if inode == 0 {
        // Sockets without an inode (e.g. TIME_WAIT leftovers) cannot be
        // attributed to a process.
        return None;
    }

    let is_tcp = matches!(kind, TableKind::Tcp4 | TableKind::Tcp6);

    if is_tcp && state == TCP_STATE_TIME_WAIT {
        return None;
    }

    // UDP sockets are all binds; for TCP only the listeners are.
    if !is_tcp || state == TCP_STATE_LISTEN {
        return Some(Row::Bind(BindInfo {
            listens_any: local.ip().is_unspecified(),
            local,
            uid,
            inode,
            pid: None,
        }));
    }

    Some(Row::Connection(ConnectionInfo {
        local,
        remote,
        uid,
        inode,
        pid: None,
    }))
}

/// Parses the kernel's `ADDRESS:PORT` hex notation.
///
/// Addresses are printed as native-endian hex of the network-order value,
/// i.e. byte-reversed per 32-bit group on little-endian machines; ports are
/// plain big-endian hex.
fn parse_socket_addr(s: &str) -> Option<SocketAddr> {
    let (addr, port) = s.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip: IpAddr = match addr.len() {
        8 => {
            let v = u32::from_str_radix(addr, 16).ok()?;
            Ipv4Addr::from(v.to_le_bytes()).into()
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let group = u32::from_str_radix(&addr[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&group.to_le_bytes());
            }
            Ipv6Addr::from(octets).into()
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Reads the Linux socket tables from procfs.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct ProcFsSource {
    root: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl ProcFsSource {
    pub fn new() -> Self {
        Self {
            root: std::path::PathBuf::from("/proc"),
        }
    }

    /// Uses an alternative procfs root, e.g. for a mount namespace.
    pub fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[cfg(target_os = "linux")]
impl crate::SocketTableSource for ProcFsSource {
    fn read(&self, kind: TableKind) -> std::io::Result<TableSnapshot> {
        let file = match kind {
            TableKind::Tcp4 => "net/tcp",
            TableKind::Tcp6 => "net/tcp6",
            TableKind::Udp4 => "net/udp",
            TableKind::Udp6 => "net/udp6",
        };

        let content = std::fs::read_to_string(self.root.join(file))?;

        Ok(parse_proc_net(kind, &content))
    }

    fn find_pid(&self, uid: u32, inode: u64) -> Option<warden_model::Pid> {
        use std::os::unix::fs::MetadataExt;

        let needle = format!("socket:[{inode}]");

        for entry in std::fs::read_dir(&self.root).ok()?.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<warden_model::Pid>() else {
                continue;
            };

            // The socket's UID owns the process dir; skip everything else
            // before paying for the fd scan.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.uid() != uid {
                continue;
            }

            let fd_dir = entry.path().join("fd");
            let Ok(fds) = std::fs::read_dir(&fd_dir) else {
                continue;
            };

            for fd in fds.flatten() {
                if let Ok(target) = std::fs::read_link(fd.path())
                    && target.to_string_lossy() == needle
                {
                    return Some(pid);
                }
            }
        }

        None
    }
}
