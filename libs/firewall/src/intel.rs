use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use warden_model::NetworkState;

/// The narrow contract to the filter-list intelligence.
///
/// Lookups return the IDs of the lists an entity appears on; the deciders
/// intersect those with the profile's subscriptions.
pub trait FilterListIndex: Send + Sync + 'static {
    fn lookup_domain(&self, domain: &str) -> Vec<String>;
    fn lookup_ip(&self, ip: IpAddr) -> Vec<String>;
}

/// An empty index; used when no filter lists are loaded.
pub struct NoLists;

impl FilterListIndex for NoLists {
    fn lookup_domain(&self, _domain: &str) -> Vec<String> {
        Vec::new()
    }

    fn lookup_ip(&self, _ip: IpAddr) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory filter list index.
#[derive(Default)]
pub struct StaticLists {
    domains: RwLock<HashMap<String, Vec<String>>>,
    ips: RwLock<HashMap<IpAddr, Vec<String>>>,
}

impl StaticLists {
    pub fn add_domain(&self, domain: &str, list: &str) {
        self.domains
            .write()
            .entry(domain.trim_end_matches('.').to_ascii_lowercase())
            .or_default()
            .push(list.to_owned());
    }

    pub fn add_ip(&self, ip: IpAddr, list: &str) {
        self.ips.write().entry(ip).or_default().push(list.to_owned());
    }
}

impl FilterListIndex for StaticLists {
    fn lookup_domain(&self, domain: &str) -> Vec<String> {
        let domains = self.domains.read();
        let needle = domain.trim_end_matches('.').to_ascii_lowercase();

        // Walk up the label chain so `ads.example.com` inherits a listing of
        // `example.com`.
        let mut rest = needle.as_str();
        loop {
            if let Some(lists) = domains.get(rest) {
                return lists.clone();
            }

            match rest.split_once('.') {
                Some((_, parent)) => rest = parent,
                None => return Vec::new(),
            }
        }
    }

    fn lookup_ip(&self, ip: IpAddr) -> Vec<String> {
        self.ips.read().get(&ip).cloned().unwrap_or_default()
    }
}

/// Well-known captive-portal probe domains.
///
/// Connections to these are granted while the network is degraded so the OS
/// and browsers can detect and clear the portal.
pub const CONNECTIVITY_DOMAINS: &[&str] = &[
    "captive.apple.com",
    "captiveportal.apple.com",
    "connectivity-check.ubuntu.com",
    "connectivitycheck.gstatic.com",
    "detectportal.firefox.com",
    "ipv4.connman.net",
    "ipv6.connman.net",
    "msftconnecttest.com",
    "network-test.debian.org",
    "nmcheck.gnome.org",
    "www.msftconnecttest.com",
];

pub fn is_connectivity_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();

    CONNECTIVITY_DOMAINS.iter().any(|d| *d == domain)
}

/// Shared view of the current network connectivity.
#[derive(Debug)]
pub struct NetworkStateHandle {
    state: RwLock<NetworkState>,
    portal: RwLock<Option<(IpAddr, String)>>,
}

impl Default for NetworkStateHandle {
    fn default() -> Self {
        Self {
            state: RwLock::new(NetworkState::Online),
            portal: RwLock::new(None),
        }
    }
}

impl NetworkStateHandle {
    pub fn current(&self) -> NetworkState {
        *self.state.read()
    }

    pub fn set(&self, state: NetworkState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::info!(old = %current, new = %state, "Network state changed");
            *current = state;
        }

        if state == NetworkState::Online {
            *self.portal.write() = None;
        }
    }

    /// The detected captive-portal endpoint, if any.
    pub fn portal(&self) -> Option<(IpAddr, String)> {
        self.portal.read().clone()
    }

    pub fn set_portal(&self, ip: IpAddr, host: impl Into<String>) {
        *self.portal.write() = Some((ip, host.into()));
        self.set(NetworkState::Portal);
    }
}
