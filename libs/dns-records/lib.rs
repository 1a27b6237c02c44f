//! Owned DNS record types shared between the resolver contract and the
//! firewall's DNS response filter.
//!
//! This crate is the only place that touches the `domain` crate; everything
//! else works with the aliases and helpers exported here.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use domain::rdata::AllRecordData;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use warden_model::{IpScope, Pid};

pub type RecordType = domain::base::iana::Rtype;
pub type DomainName = domain::base::Name<Vec<u8>>;
pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

pub mod records {
    use domain::rdata::{A, Aaaa, Cname, Ptr};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    pub fn cname(target: DomainName) -> OwnedRecordData {
        OwnedRecordData::Cname(Cname::new(target))
    }

    pub fn ptr(target: DomainName) -> OwnedRecordData {
        OwnedRecordData::Ptr(Ptr::new(target))
    }
}

/// Builds an owned record with class IN.
pub fn record(owner: DomainName, ttl: u32, data: OwnedRecordData) -> OwnedRecord {
    (owner, ttl, data).into()
}

/// The address carried by an A or AAAA record, if it is one.
pub fn record_ip(record: &OwnedRecord) -> Option<IpAddr> {
    match record.data() {
        OwnedRecordData::A(a) => Some(IpAddr::V4(a.addr())),
        OwnedRecordData::Aaaa(aaaa) => Some(IpAddr::V6(aaaa.addr())),
        _ => None,
    }
}

/// The target carried by a CNAME record, if it is one.
pub fn record_cname(record: &OwnedRecord) -> Option<&DomainName> {
    match record.data() {
        OwnedRecordData::Cname(cname) => Some(cname.cname()),
        _ => None,
    }
}

/// Zone-file style rendering, e.g. for filtered-record bookkeeping.
pub fn format_record(record: &OwnedRecord) -> String {
    use domain::base::RecordData as _;

    format!(
        "{} {} IN {} {}",
        record.owner(),
        record.ttl().as_secs(),
        record.data().rtype(),
        record.data(),
    )
}

/// How a DNS query travelled to its server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum DnsTransport {
    #[display("UDP")]
    Udp,
    #[display("TCP")]
    Tcp,
    #[display("DoH")]
    Https,
}

/// Which server answered a query and how that server is classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverInfo {
    pub server: IpAddr,
    pub port: u16,
    /// Scope of the server address, not of the answer.
    pub server_scope: IpScope,
    /// Whether this is a resolver taken from the operating system config.
    pub is_system_resolver: bool,
    /// Where the resolver was configured, e.g. `dhcp` or `config`.
    pub source: String,
}

impl ResolverInfo {
    pub fn new(server: IpAddr, port: u16) -> Self {
        Self {
            server,
            port,
            server_scope: IpScope::classify(server),
            is_system_resolver: false,
            source: "config".to_owned(),
        }
    }

    pub fn system(server: IpAddr, port: u16) -> Self {
        Self {
            is_system_resolver: true,
            source: "system".to_owned(),
            ..Self::new(server, port)
        }
    }
}

/// Context of the request that produced a resolved domain, stored alongside
/// IP-info entries so later connections can be attributed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQueryContext {
    pub transport: DnsTransport,
    pub server: SocketAddr,
    pub server_scope: IpScope,
}

/// What the resolver tells the firewall about an in-flight query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryInfo {
    pub fqdn: DomainName,
    pub qtype: RecordType,
    pub pid: Pid,
}

/// A domain that resolved to one or more IPs, including the CNAME chain that
/// led there.
#[derive(Debug, Clone)]
pub struct ResolvedDomain {
    pub domain: DomainName,
    pub cnames: Vec<DomainName>,
    /// Unix seconds after which this attribution should no longer be used.
    pub expires: i64,
    pub resolver: ResolverInfo,
    pub context: DnsQueryContext,
}

/// A cached DNS response as handed over by the resolver.
///
/// The firewall's response filter mutates `answer`/`extra` in place and
/// records what it removed in `filtered_entries`.
#[derive(Debug, Clone)]
pub struct RRCache {
    pub domain: DomainName,
    pub qtype: RecordType,
    pub answer: Vec<OwnedRecord>,
    pub extra: Vec<OwnedRecord>,
    /// Unix seconds.
    pub expires: i64,
    pub resolver: ResolverInfo,
    pub context: DnsQueryContext,
    pub filtered_entries: Vec<String>,
}

impl RRCache {
    pub fn new(domain: DomainName, qtype: RecordType, resolver: ResolverInfo) -> Self {
        let context = DnsQueryContext {
            transport: DnsTransport::Udp,
            server: SocketAddr::new(resolver.server, resolver.port),
            server_scope: resolver.server_scope,
        };

        Self {
            domain,
            qtype,
            answer: Vec::new(),
            extra: Vec::new(),
            expires: 0,
            resolver,
            context,
            filtered_entries: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: DnsQueryContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_answer(mut self, records: impl IntoIterator<Item = OwnedRecord>) -> Self {
        self.answer.extend(records);
        self
    }

    pub fn with_extra(mut self, records: impl IntoIterator<Item = OwnedRecord>) -> Self {
        self.extra.extend(records);
        self
    }

    /// All addresses in the answer section.
    pub fn address_records(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.answer.iter().filter_map(record_ip)
    }

    /// CNAME targets in answer order.
    ///
    /// The resolver guarantees chain order within a section, so this doubles
    /// as the chain from the queried name to the address-bearing name.
    pub fn cname_chain(&self) -> Vec<DomainName> {
        self.answer.iter().filter_map(|r| record_cname(r).cloned()).collect()
    }

    pub fn has_address_records(&self) -> bool {
        self.address_records().next().is_some()
    }
}
