//! Detection of attempts to bypass the local resolver.

use std::net::IpAddr;

/// The DNS over HTTPS canary domain used by Firefox to check whether DoH can
/// be enabled by default.
///
/// Responding to queries for this domain with NXDOMAIN disables DoH.
/// See <https://support.mozilla.org/en-US/kb/canary-domain-use-application-dnsnet>.
/// Chrome-based browsers probe the configured resolver directly instead and
/// need no canary.
pub const DOH_CANARY_DOMAIN: &str = "use-application-dns.net";

/// Well-known public DoH/DoT resolver endpoints.
///
/// Kept deliberately small; the full set comes from the resolver filter
/// list, this is the fallback when no list is loaded.
const KNOWN_RESOLVER_IPS: &[&str] = &[
    "1.0.0.1",
    "1.1.1.1",
    "8.8.4.4",
    "8.8.8.8",
    "9.9.9.9",
    "9.9.9.10",
    "149.112.112.112",
    "176.103.130.130",
    "185.228.168.168",
    "208.67.220.220",
    "208.67.222.222",
    "2606:4700:4700::1001",
    "2606:4700:4700::1111",
    "2001:4860:4860::8844",
    "2001:4860:4860::8888",
    "2620:fe::fe",
];

/// The ID of the resolver filter list, when one is loaded.
pub const RESOLVER_FILTER_LIST: &str = "DOH";

pub fn is_canary_domain(domain: &str) -> bool {
    domain.trim_end_matches('.').eq_ignore_ascii_case(DOH_CANARY_DOMAIN)
}

pub fn is_known_resolver(ip: IpAddr) -> bool {
    KNOWN_RESOLVER_IPS
        .iter()
        .any(|known| known.parse::<IpAddr>().is_ok_and(|known| known == ip))
}
