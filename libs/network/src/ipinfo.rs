use dns_records::ResolvedDomain;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use warden_model::{IpScope, ProfileId};

/// Reverse IP → domain attribution store.
///
/// Entries are scoped to the profile that resolved them; lookups try the
/// profile scope first and fall back to the global scope. Localhost IPs are
/// never persisted, their "domains" are purely local constructs.
#[derive(Default)]
pub struct IpInfoStore {
    inner: RwLock<HashMap<Key, Vec<ResolvedDomain>>>,
}

type Key = (Option<ProfileId>, IpAddr);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Localhost IPs are not persisted")]
pub struct LocalhostNotPersisted;

impl IpInfoStore {
    /// Records that `ip` was handed out for `resolved.domain`.
    pub fn add_domain(
        &self,
        profile: Option<ProfileId>,
        ip: IpAddr,
        resolved: ResolvedDomain,
    ) -> Result<(), LocalhostNotPersisted> {
        if IpScope::classify(ip).is_localhost() {
            return Err(LocalhostNotPersisted);
        }

        let mut inner = self.inner.write();
        let domains = inner.entry((profile, ip)).or_default();

        // Refresh in place so the newest resolution is last.
        domains.retain(|existing| existing.domain != resolved.domain);
        domains.push(resolved);

        Ok(())
    }

    /// All attributions for `ip`, profile scope first, then global.
    pub fn get(&self, profile: Option<&ProfileId>, ip: IpAddr) -> Vec<ResolvedDomain> {
        let inner = self.inner.read();

        if let Some(profile) = profile
            && let Some(domains) = inner.get(&(Some(profile.clone()), ip))
        {
            return domains.clone();
        }

        inner.get(&(None, ip)).cloned().unwrap_or_default()
    }

    /// The most recent attribution for `ip`, honoring expiry.
    pub fn most_recent(
        &self,
        profile: Option<&ProfileId>,
        ip: IpAddr,
        now_unix: i64,
    ) -> Option<ResolvedDomain> {
        self.get(profile, ip)
            .into_iter()
            .filter(|resolved| resolved.expires > now_unix)
            .next_back()
    }

    /// Drops attributions that expired before `now_unix`.
    pub fn prune(&self, now_unix: i64) {
        let mut inner = self.inner.write();

        for domains in inner.values_mut() {
            domains.retain(|resolved| resolved.expires > now_unix);
        }

        inner.retain(|_, domains| !domains.is_empty());
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
