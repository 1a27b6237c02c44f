use std::fmt;
use std::net::{IpAddr, SocketAddr};
use warden_model::Pid;

/// Which OS socket table a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Tcp4 => write!(f, "tcp4"),
            TableKind::Tcp6 => write!(f, "tcp6"),
            TableKind::Udp4 => write!(f, "udp4"),
            TableKind::Udp6 => write!(f, "udp6"),
        }
    }
}

/// A listening or unconnected socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindInfo {
    pub local: SocketAddr,
    pub uid: u32,
    pub inode: u64,
    /// Known immediately on some OSes; discovered lazily on Linux.
    pub pid: Option<Pid>,
    /// Bound to the unspecified address, i.e. accepts from any interface.
    pub listens_any: bool,
}

/// An established connection socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub uid: u32,
    pub inode: u64,
    pub pid: Option<Pid>,
}

/// One refresh of an OS socket table.
#[derive(Debug, Default, Clone)]
pub struct TableSnapshot {
    pub binds: Vec<BindInfo>,
    pub connections: Vec<ConnectionInfo>,
}

impl TableSnapshot {
    /// A bind serving the given local endpoint, preferring exact address
    /// matches over wildcard binds.
    pub fn find_bind(&self, local_ip: IpAddr, local_port: u16) -> Option<&BindInfo> {
        self.binds
            .iter()
            .find(|b| b.local.port() == local_port && b.local.ip() == local_ip)
            .or_else(|| {
                self.binds
                    .iter()
                    .find(|b| b.local.port() == local_port && b.listens_any)
            })
    }

    /// A wildcard bind on the given port, used for the dual-stack fallback.
    pub fn find_any_bind(&self, local_port: u16) -> Option<&BindInfo> {
        self.binds
            .iter()
            .find(|b| b.local.port() == local_port && b.listens_any)
    }

    pub fn find_connection(
        &self,
        local_ip: IpAddr,
        local_port: u16,
        remote_ip: IpAddr,
        remote_port: u16,
    ) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| {
            c.local.port() == local_port
                && c.remote.port() == remote_port
                && c.local.ip() == local_ip
                && c.remote.ip() == remote_ip
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(addr: &str, inode: u64) -> BindInfo {
        let local: SocketAddr = addr.parse().unwrap();
        BindInfo {
            local,
            uid: 1000,
            inode,
            pid: None,
            listens_any: local.ip().is_unspecified(),
        }
    }

    #[test]
    fn exact_bind_wins_over_wildcard() {
        let snapshot = TableSnapshot {
            binds: vec![bind("0.0.0.0:53", 1), bind("127.0.0.1:53", 2)],
            connections: Vec::new(),
        };

        let found = snapshot.find_bind("127.0.0.1".parse().unwrap(), 53).unwrap();

        assert_eq!(found.inode, 2);
    }

    #[test]
    fn wildcard_bind_matches_any_local_ip() {
        let snapshot = TableSnapshot {
            binds: vec![bind("0.0.0.0:53", 1)],
            connections: Vec::new(),
        };

        assert!(snapshot.find_bind("10.0.0.2".parse().unwrap(), 53).is_some());
        assert!(snapshot.find_bind("10.0.0.2".parse().unwrap(), 54).is_none());
    }
}
