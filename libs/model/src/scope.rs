use ip_network::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

static LINK_LOCAL_V4: LazyLock<Ipv4Network> =
    LazyLock::new(|| match Ipv4Network::new(Ipv4Addr::new(169, 254, 0, 0), 16) {
        Ok(n) => n,
        Err(_) => unreachable!(),
    });

static SITE_LOCAL_V4: LazyLock<[Ipv4Network; 3]> = LazyLock::new(|| {
    [
        match Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 8) {
            Ok(n) => n,
            Err(_) => unreachable!(),
        },
        match Ipv4Network::new(Ipv4Addr::new(172, 16, 0, 0), 12) {
            Ok(n) => n,
            Err(_) => unreachable!(),
        },
        match Ipv4Network::new(Ipv4Addr::new(192, 168, 0, 0), 16) {
            Ok(n) => n,
            Err(_) => unreachable!(),
        },
    ]
});

static LINK_LOCAL_MULTICAST_V4: LazyLock<Ipv4Network> =
    LazyLock::new(|| match Ipv4Network::new(Ipv4Addr::new(224, 0, 0, 0), 24) {
        Ok(n) => n,
        Err(_) => unreachable!(),
    });

static ADMIN_MULTICAST_V4: LazyLock<Ipv4Network> =
    LazyLock::new(|| match Ipv4Network::new(Ipv4Addr::new(239, 0, 0, 0), 8) {
        Ok(n) => n,
        Err(_) => unreachable!(),
    });

static MULTICAST_V4: LazyLock<Ipv4Network> =
    LazyLock::new(|| match Ipv4Network::new(Ipv4Addr::new(224, 0, 0, 0), 4) {
        Ok(n) => n,
        Err(_) => unreachable!(),
    });

static UNIQUE_LOCAL_V6: LazyLock<Ipv6Network> = LazyLock::new(|| {
    match Ipv6Network::new(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7) {
        Ok(n) => n,
        Err(_) => unreachable!(),
    }
});

static LINK_LOCAL_V6: LazyLock<Ipv6Network> = LazyLock::new(|| {
    match Ipv6Network::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10) {
        Ok(n) => n,
        Err(_) => unreachable!(),
    }
});

/// Categorical network location of an IP address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpScope {
    /// Unspecified, broadcast-source or otherwise unusable addresses.
    #[default]
    Invalid,
    /// Loopback.
    Host,
    /// Link-local unicast (169.254/16, fe80::/10).
    LinkLocal,
    /// Private / unique-local unicast (RFC 1918, fc00::/7).
    SiteLocal,
    /// Publicly routable unicast.
    Global,
    LinkLocalMulticast,
    AdminScopedMulticast,
    GlobalMulticast,
}

impl IpScope {
    pub fn classify(ip: IpAddr) -> IpScope {
        match ip {
            IpAddr::V4(v4) => Self::classify_v4(v4),
            IpAddr::V6(v6) => Self::classify_v6(v6),
        }
    }

    fn classify_v4(ip: Ipv4Addr) -> IpScope {
        if ip.is_unspecified() {
            return IpScope::Invalid;
        }
        if ip.is_loopback() {
            return IpScope::Host;
        }
        if ip.is_broadcast() || LINK_LOCAL_MULTICAST_V4.contains(ip) {
            return IpScope::LinkLocalMulticast;
        }
        if ADMIN_MULTICAST_V4.contains(ip) {
            return IpScope::AdminScopedMulticast;
        }
        if MULTICAST_V4.contains(ip) {
            return IpScope::GlobalMulticast;
        }
        if LINK_LOCAL_V4.contains(ip) {
            return IpScope::LinkLocal;
        }
        if SITE_LOCAL_V4.iter().any(|net| net.contains(ip)) {
            return IpScope::SiteLocal;
        }

        IpScope::Global
    }

    fn classify_v6(ip: Ipv6Addr) -> IpScope {
        if ip.is_unspecified() {
            return IpScope::Invalid;
        }
        if ip.is_loopback() {
            return IpScope::Host;
        }
        if ip.is_multicast() {
            // The multicast scope lives in the low nibble of the second byte.
            return match ip.octets()[1] & 0x0f {
                0x01 | 0x02 => IpScope::LinkLocalMulticast,
                0x04 | 0x05 | 0x08 => IpScope::AdminScopedMulticast,
                _ => IpScope::GlobalMulticast,
            };
        }
        if LINK_LOCAL_V6.contains(ip) {
            return IpScope::LinkLocal;
        }
        if UNIQUE_LOCAL_V6.contains(ip) {
            return IpScope::SiteLocal;
        }
        if let Some(v4) = ip.to_ipv4_mapped() {
            return Self::classify_v4(v4);
        }

        IpScope::Global
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self, IpScope::Host)
    }

    /// Anything reachable without crossing a router towards the internet.
    pub fn is_lan(&self) -> bool {
        matches!(
            self,
            IpScope::LinkLocal
                | IpScope::SiteLocal
                | IpScope::LinkLocalMulticast
                | IpScope::AdminScopedMulticast
        )
    }

    pub fn is_global(&self) -> bool {
        matches!(self, IpScope::Global | IpScope::GlobalMulticast)
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, IpScope::Invalid)
    }
}

impl fmt::Display for IpScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IpScope::Invalid => "invalid",
            IpScope::Host => "host",
            IpScope::LinkLocal => "link-local",
            IpScope::SiteLocal => "site-local",
            IpScope::Global => "global",
            IpScope::LinkLocalMulticast => "link-local multicast",
            IpScope::AdminScopedMulticast => "admin-scoped multicast",
            IpScope::GlobalMulticast => "global multicast",
        };

        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("0.0.0.0", IpScope::Invalid; "v4 unspecified")]
    #[test_case("127.0.0.1", IpScope::Host; "v4 loopback")]
    #[test_case("127.255.255.254", IpScope::Host; "v4 loopback end")]
    #[test_case("169.254.1.1", IpScope::LinkLocal; "v4 link local")]
    #[test_case("10.2.3.4", IpScope::SiteLocal; "rfc1918 ten")]
    #[test_case("172.16.0.1", IpScope::SiteLocal; "rfc1918 oneseventwo")]
    #[test_case("172.32.0.1", IpScope::Global; "just past oneseventwo")]
    #[test_case("192.168.1.10", IpScope::SiteLocal; "rfc1918 oneninetwo")]
    #[test_case("255.255.255.255", IpScope::LinkLocalMulticast; "v4 broadcast")]
    #[test_case("224.0.0.251", IpScope::LinkLocalMulticast; "mdns")]
    #[test_case("239.255.255.250", IpScope::AdminScopedMulticast; "ssdp site")]
    #[test_case("233.1.2.3", IpScope::GlobalMulticast; "v4 global multicast")]
    #[test_case("1.1.1.1", IpScope::Global; "v4 global")]
    #[test_case("::", IpScope::Invalid; "v6 unspecified")]
    #[test_case("::1", IpScope::Host; "v6 loopback")]
    #[test_case("fe80::1", IpScope::LinkLocal; "v6 link local")]
    #[test_case("fd00::1", IpScope::SiteLocal; "v6 unique local")]
    #[test_case("ff02::fb", IpScope::LinkLocalMulticast; "v6 mdns")]
    #[test_case("ff05::2", IpScope::AdminScopedMulticast; "v6 site multicast")]
    #[test_case("ff0e::1", IpScope::GlobalMulticast; "v6 global multicast")]
    #[test_case("2606:4700::1111", IpScope::Global; "v6 global")]
    #[test_case("::ffff:192.168.0.1", IpScope::SiteLocal; "v4 mapped site local")]
    fn classification(ip: &str, expected: IpScope) {
        assert_eq!(IpScope::classify(ip.parse().unwrap()), expected);
    }

    #[test]
    fn lan_and_global_are_disjoint() {
        for ip in ["10.0.0.1", "1.1.1.1", "fe80::1", "2606:4700::1111"] {
            let scope = IpScope::classify(ip.parse().unwrap());
            assert!(scope.is_lan() != scope.is_global());
        }
    }
}
