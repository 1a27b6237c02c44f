//! Test doubles for the interceptor contract.

use crate::{IpVersion, Packet, PacketInfo, TransportProtocol};
use anyhow::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::Instant;
use warden_model::Verdict;

pub fn udp_v4_packet_info(src: &str, dst: &str) -> PacketInfo {
    packet_info(TransportProtocol::Udp, src, dst)
}

pub fn tcp_v4_packet_info(src: &str, dst: &str) -> PacketInfo {
    packet_info(TransportProtocol::Tcp, src, dst)
}

pub fn icmp_v4_packet_info(src: &str, dst: &str) -> PacketInfo {
    let src: std::net::IpAddr = src.parse().expect("valid source IP");
    let dst: std::net::IpAddr = dst.parse().expect("valid destination IP");

    PacketInfo {
        inbound: false,
        version: IpVersion::V4,
        protocol: TransportProtocol::Icmp,
        src,
        src_port: 0,
        dst,
        dst_port: 0,
        pid: None,
        icmp_type: Some(8),
        tcp: None,
        fragment: None,
        seen: Instant::now(),
        info_only: false,
        pre_permitted: false,
    }
}

pub fn packet_info(protocol: TransportProtocol, src: &str, dst: &str) -> PacketInfo {
    let src: SocketAddr = src.parse().expect("valid source address");
    let dst: SocketAddr = dst.parse().expect("valid destination address");

    PacketInfo {
        inbound: false,
        version: if src.is_ipv4() { IpVersion::V4 } else { IpVersion::V6 },
        protocol,
        src: src.ip(),
        src_port: src.port(),
        dst: dst.ip(),
        dst_port: dst.port(),
        pid: None,
        icmp_type: None,
        tcp: None,
        fragment: None,
        seen: Instant::now(),
        info_only: false,
        pre_permitted: false,
    }
}

/// Records the verdict calls it receives instead of talking to a kernel.
#[derive(Debug)]
pub struct MockPacket {
    info: PacketInfo,
    payload: Vec<u8>,
    applied: Mutex<Vec<(Verdict, bool)>>,
}

impl MockPacket {
    pub fn new(info: PacketInfo) -> Self {
        Self {
            info,
            payload: Vec::new(),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// All `(verdict, permanent)` pairs applied to this packet, in order.
    pub fn applied(&self) -> Vec<(Verdict, bool)> {
        self.applied.lock().clone()
    }

    pub fn last_applied(&self) -> Option<(Verdict, bool)> {
        self.applied.lock().last().copied()
    }

    fn record(&self, verdict: Verdict, permanent: bool) {
        self.applied.lock().push((verdict, permanent));
    }
}

// Lets tests keep a handle on a packet after boxing it for the intake.
impl Packet for std::sync::Arc<MockPacket> {
    fn info(&self) -> &PacketInfo {
        self.as_ref().info()
    }

    fn payload(&self) -> Result<&[u8]> {
        self.as_ref().payload()
    }

    fn accept(&self, permanent: bool) -> Result<()> {
        self.as_ref().accept(permanent)
    }

    fn block(&self, permanent: bool) -> Result<()> {
        self.as_ref().block(permanent)
    }

    fn drop(&self, permanent: bool) -> Result<()> {
        self.as_ref().drop(permanent)
    }

    fn reroute_to_nameserver(&self) -> Result<()> {
        self.as_ref().reroute_to_nameserver()
    }

    fn reroute_to_tunnel(&self) -> Result<()> {
        self.as_ref().reroute_to_tunnel()
    }
}

impl Packet for MockPacket {
    fn info(&self) -> &PacketInfo {
        &self.info
    }

    fn payload(&self) -> Result<&[u8]> {
        Ok(&self.payload)
    }

    fn accept(&self, permanent: bool) -> Result<()> {
        self.record(Verdict::Accept, permanent);
        Ok(())
    }

    fn block(&self, permanent: bool) -> Result<()> {
        self.record(Verdict::Block, permanent);
        Ok(())
    }

    fn drop(&self, permanent: bool) -> Result<()> {
        self.record(Verdict::Drop, permanent);
        Ok(())
    }

    fn reroute_to_nameserver(&self) -> Result<()> {
        self.record(Verdict::RerouteToNameserver, false);
        Ok(())
    }

    fn reroute_to_tunnel(&self) -> Result<()> {
        self.record(Verdict::RerouteToTunnel, false);
        Ok(())
    }
}
