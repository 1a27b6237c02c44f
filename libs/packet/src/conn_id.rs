use crate::{PacketInfo, TransportProtocol};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Stable key of a flow, derived from the 5-tuple plus direction.
///
/// The textual form is
/// `{ip-proto}-{local_ip}-{local_port}-{remote_ip}-{remote_port}` with an
/// `-in` suffix for inbound flows; ICMP flows carry no ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    pub protocol: u8,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub inbound: bool,
}

impl ConnectionId {
    pub fn from_packet(info: &PacketInfo) -> Self {
        let (local_port, remote_port) = if info.protocol.has_ports() {
            (info.local_port(), info.remote_port())
        } else {
            (0, 0)
        };

        Self {
            protocol: info.protocol.ip_proto(),
            local_ip: info.local_ip(),
            local_port,
            remote_ip: info.remote_ip(),
            remote_port,
            inbound: info.inbound,
        }
    }

    pub fn transport(&self) -> TransportProtocol {
        TransportProtocol::from_ip_proto(self.protocol)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.protocol, self.local_ip, self.local_port, self.remote_ip, self.remote_port,
        )?;

        if self.inbound {
            write!(f, "-in")?;
        }

        Ok(())
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Malformed connection id")]
pub struct ParseConnectionIdError;

impl FromStr for ConnectionId {
    type Err = ParseConnectionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (s, inbound) = match s.strip_suffix("-in") {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        let mut parts = s.split('-');
        let mut next = || parts.next().ok_or(ParseConnectionIdError);

        let id = ConnectionId {
            protocol: next()?.parse().map_err(|_| ParseConnectionIdError)?,
            local_ip: next()?.parse().map_err(|_| ParseConnectionIdError)?,
            local_port: next()?.parse().map_err(|_| ParseConnectionIdError)?,
            remote_ip: next()?.parse().map_err(|_| ParseConnectionIdError)?,
            remote_port: next()?.parse().map_err(|_| ParseConnectionIdError)?,
            inbound,
        };

        if parts.next().is_some() {
            return Err(ParseConnectionIdError);
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn display_roundtrips_through_from_str() {
        let info = testing::udp_v4_packet_info("10.0.0.2:5000", "1.1.1.1:53");
        let id = ConnectionId::from_packet(&info);

        assert_eq!(id.to_string(), "17-10.0.0.2-5000-1.1.1.1-53");
        assert_eq!(id.to_string().parse::<ConnectionId>().unwrap(), id);
    }

    #[test]
    fn inbound_flows_get_a_distinct_id() {
        let mut info = testing::udp_v4_packet_info("10.0.0.2:5000", "1.1.1.1:53");
        let outbound = ConnectionId::from_packet(&info);

        info.inbound = true;
        let inbound = ConnectionId::from_packet(&info);

        assert_ne!(outbound, inbound);
        assert!(inbound.to_string().ends_with("-in"));
        assert_eq!(inbound.to_string().parse::<ConnectionId>().unwrap(), inbound);
    }

    #[test]
    fn icmp_ids_carry_no_ports() {
        let info = testing::icmp_v4_packet_info("10.0.0.2", "1.1.1.1");
        let id = ConnectionId::from_packet(&info);

        assert_eq!(id.to_string(), "1-10.0.0.2-0-1.1.1.1-0");
    }
}
