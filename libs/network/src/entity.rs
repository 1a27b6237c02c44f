use dns_records::{DnsQueryContext, ResolverInfo};
use packet_info::PacketInfo;
use std::net::IpAddr;
use warden_model::IpScope;
use warden_profile::DstView;

/// The remote peer of a connection.
///
/// Starts out as bare IP facts from the packet and is enriched with domain
/// attribution during gathering. The matching caches (filter lists, CNAME
/// inclusion) must be reset before a re-evaluation.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub protocol: u8,
    pub scope: IpScope,

    /// Canonical lowercase domain without trailing dot, if known.
    pub domain: Option<String>,
    pub cnames: Vec<String>,
    /// Whether rule matching should consider the CNAME chain.
    pub include_cnames: bool,

    /// The resolver that produced the domain attribution.
    pub resolver: Option<ResolverInfo>,
    /// Context of the DNS request behind the attribution.
    pub dns_context: Option<DnsQueryContext>,

    /// Filter-list IDs the remote matched; populated lazily by the intel
    /// layer, `None` until looked up.
    lists: Option<Vec<String>>,
}

impl Entity {
    pub fn from_packet(info: &PacketInfo) -> Self {
        let remote = info.remote_ip();

        Self {
            ip: Some(remote),
            port: info.remote_port(),
            protocol: info.protocol.ip_proto(),
            scope: IpScope::classify(remote),
            ..Self::default()
        }
    }

    /// A DNS request's "remote" is the queried domain itself.
    pub fn from_domain(fqdn: &str) -> Self {
        Self {
            domain: Some(canonical_domain(fqdn)),
            ..Self::default()
        }
    }

    pub fn set_domain(&mut self, fqdn: &str, cnames: Vec<String>, resolver: Option<ResolverInfo>) {
        self.domain = Some(canonical_domain(fqdn));
        self.cnames = cnames.into_iter().map(|c| canonical_domain(&c)).collect();
        self.resolver = resolver;
    }

    /// Clears per-evaluation caches before deciders run again.
    pub fn reset_matching_caches(&mut self) {
        self.lists = None;
        self.include_cnames = false;
    }

    pub fn set_lists(&mut self, lists: Vec<String>) {
        self.lists = Some(lists);
    }

    pub fn lists(&self) -> Option<&[String]> {
        self.lists.as_deref()
    }

    /// The view handed to endpoint rule matching.
    pub fn dst_view(&self) -> DstView<'_> {
        DstView {
            ip: self.ip,
            protocol: self.protocol,
            port: self.port,
            domain: self.domain.as_deref(),
            cnames: &self.cnames,
            include_cnames: self.include_cnames,
            lists: self.lists.as_deref().unwrap_or(&[]),
        }
    }
}

/// Lowercase, no trailing dot.
pub(crate) fn canonical_domain(fqdn: &str) -> String {
    fqdn.trim_end_matches('.').to_ascii_lowercase()
}
