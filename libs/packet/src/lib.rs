//! The interceptor-facing packet contract.
//!
//! The kernel hook delivers packets as [`Packet`] trait objects carrying a
//! parsed [`PacketInfo`]. The core never touches raw header bytes; it reads
//! the metadata, decides, and calls one of the verdict methods exactly once.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod conn_id;

pub use conn_id::ConnectionId;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;
use warden_model::Pid;

/// Destination used by the interceptor to signal a kernel-blocked flow.
pub const BLOCKED_DESTINATION_V4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 17);
pub const BLOCKED_DESTINATION_V6: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 17);

pub fn is_blocked_destination(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == BLOCKED_DESTINATION_V4,
        IpAddr::V6(v6) => v6 == BLOCKED_DESTINATION_V6,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

/// The transport protocol of an intercepted packet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum TransportProtocol {
    #[display("TCP")]
    Tcp,
    #[display("UDP")]
    Udp,
    #[display("ICMP")]
    Icmp,
    #[display("ICMPv6")]
    IcmpV6,
    #[display("proto-{_0}")]
    Other(u8),
}

impl TransportProtocol {
    pub fn from_ip_proto(proto: u8) -> Self {
        match proto {
            1 => TransportProtocol::Icmp,
            6 => TransportProtocol::Tcp,
            17 => TransportProtocol::Udp,
            58 => TransportProtocol::IcmpV6,
            other => TransportProtocol::Other(other),
        }
    }

    pub fn ip_proto(&self) -> u8 {
        match self {
            TransportProtocol::Icmp => 1,
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::IcmpV6 => 58,
            TransportProtocol::Other(other) => *other,
        }
    }

    /// Stream-oriented flows are killed outright when their verdict diverges
    /// mid-flight; per-packet protocols just follow the new verdict.
    pub fn is_stream_oriented(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }

    pub fn is_icmp(&self) -> bool {
        matches!(self, TransportProtocol::Icmp | TransportProtocol::IcmpV6)
    }

    pub fn has_ports(&self) -> bool {
        matches!(self, TransportProtocol::Tcp | TransportProtocol::Udp)
    }
}

/// TCP segment metadata, parsed by the interceptor from the packet layers.
///
/// Feeds the per-connection stream reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegmentMeta {
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
}

/// IPv4 fragment metadata.
///
/// Set on every fragment of a fragmented datagram; `offset` is in bytes
/// (the wire field times eight). The payload of a fragment packet is its
/// chunk of the IP payload, transport header included in the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentMeta {
    pub ident: u16,
    pub offset: u16,
    pub more_fragments: bool,
}

/// Parsed metadata of an intercepted packet.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub inbound: bool,
    pub version: IpVersion,
    pub protocol: TransportProtocol,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    /// PID if the interceptor already knows it (e.g. WFP on Windows).
    pub pid: Option<Pid>,
    /// ICMP message type, for ICMP/ICMPv6 packets.
    pub icmp_type: Option<u8>,
    /// TCP sequencing, for TCP packets.
    pub tcp: Option<TcpSegmentMeta>,
    /// Fragmentation state, when this packet is an IPv4 fragment.
    pub fragment: Option<FragmentMeta>,
    pub seen: Instant,
    /// Carries connection metadata only; must not receive a verdict.
    pub info_only: bool,
    /// The interceptor already permitted this flow in-kernel.
    pub pre_permitted: bool,
}

impl PacketInfo {
    pub fn local_ip(&self) -> IpAddr {
        if self.inbound { self.dst } else { self.src }
    }

    pub fn local_port(&self) -> u16 {
        if self.inbound { self.dst_port } else { self.src_port }
    }

    pub fn remote_ip(&self) -> IpAddr {
        if self.inbound { self.src } else { self.dst }
    }

    pub fn remote_port(&self) -> u16 {
        if self.inbound { self.src_port } else { self.dst_port }
    }

    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::from_packet(self)
    }

    /// Src and Dst describe the same endpoint.
    pub fn is_self_loop(&self) -> bool {
        self.src == self.dst && self.src_port == self.dst_port
    }

    /// Whether this is an ICMP echo request or reply.
    pub fn is_icmp_echo(&self) -> bool {
        match (self.protocol, self.icmp_type) {
            (TransportProtocol::Icmp, Some(0 | 8)) => true,
            (TransportProtocol::IcmpV6, Some(128 | 129)) => true,
            _ => false,
        }
    }
}

/// An intercepted packet while it awaits its verdict.
///
/// Implementors translate the verdict calls into interceptor operations. The
/// `permanent` flag asks the kernel to keep applying the verdict to the flow
/// without re-consulting us.
pub trait Packet: Send + Sync + fmt::Debug {
    fn info(&self) -> &PacketInfo;

    /// Raw transport payload, fetched lazily from the interceptor.
    fn payload(&self) -> Result<&[u8]>;

    fn accept(&self, permanent: bool) -> Result<()>;
    fn block(&self, permanent: bool) -> Result<()>;
    fn drop(&self, permanent: bool) -> Result<()>;
    fn reroute_to_nameserver(&self) -> Result<()>;
    fn reroute_to_tunnel(&self) -> Result<()>;
}

/// Periodic byte counters for a flow, delivered by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthUpdate {
    pub conn_id: ConnectionId,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(6, TransportProtocol::Tcp)]
    #[test_case(17, TransportProtocol::Udp)]
    #[test_case(1, TransportProtocol::Icmp)]
    #[test_case(58, TransportProtocol::IcmpV6)]
    #[test_case(132, TransportProtocol::Other(132))]
    fn protocol_roundtrips_through_ip_proto(proto: u8, expected: TransportProtocol) {
        let parsed = TransportProtocol::from_ip_proto(proto);

        assert_eq!(parsed, expected);
        assert_eq!(parsed.ip_proto(), proto);
    }

    #[test]
    fn local_and_remote_follow_direction() {
        let mut info = testing::udp_v4_packet_info("10.0.0.2:5000", "1.1.1.1:53");

        assert_eq!(info.local_ip().to_string(), "10.0.0.2");
        assert_eq!(info.remote_port(), 53);

        info.inbound = true;

        assert_eq!(info.local_ip().to_string(), "1.1.1.1");
        assert_eq!(info.remote_port(), 5000);
    }

    #[test]
    fn blocked_destination_sentinels() {
        assert!(is_blocked_destination("0.0.0.17".parse().unwrap()));
        assert!(is_blocked_destination("::0.0.0.17".parse().unwrap()));
        assert!(!is_blocked_destination("0.0.0.1".parse().unwrap()));
    }
}
