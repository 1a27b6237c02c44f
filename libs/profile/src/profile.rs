use crate::EndpointList;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use warden_model::ProfileId;

/// What happens when no decider reaches a verdict.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    #[default]
    Permit,
    Ask,
    Block,
}

/// The policy flags of one application profile.
///
/// Field names double as the option keys surfaced in reasons, see the
/// `option_key` module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub default_action: DefaultAction,

    pub block_inbound: bool,
    pub block_p2p: bool,
    pub block_scope_internet: bool,
    pub block_scope_lan: bool,
    pub block_scope_local: bool,

    pub remove_out_of_scope_dns: bool,
    pub remove_blocked_dns: bool,
    pub prevent_bypassing: bool,
    pub filter_cnames: bool,
    pub domain_heuristics: bool,
    pub disable_auto_permit: bool,

    /// Outbound rules.
    pub endpoints: EndpointList,
    /// Inbound (service) rules.
    pub service_endpoints: EndpointList,
    /// IDs of subscribed category/threat filter lists.
    pub filter_lists: Vec<String>,

    /// Marks our own profile; connections of internal processes skip
    /// filtering.
    pub internal: bool,
    /// Whether verdicts of this profile may be handed to the kernel
    /// permanently.
    pub permanent_verdicts: bool,
}

impl Profile {
    /// A sensible default for unknown applications.
    pub fn standard() -> Self {
        Self {
            permanent_verdicts: true,
            remove_out_of_scope_dns: true,
            remove_blocked_dns: true,
            ..Self::default()
        }
    }
}

/// Option keys attached to reasons so the UI can link a decision to the
/// setting that caused it.
pub mod option_key {
    pub const DEFAULT_ACTION: &str = "filter/defaultAction";
    pub const BLOCK_INBOUND: &str = "filter/blockInbound";
    pub const BLOCK_P2P: &str = "filter/blockP2P";
    pub const BLOCK_SCOPE_INTERNET: &str = "filter/blockInternet";
    pub const BLOCK_SCOPE_LAN: &str = "filter/blockLAN";
    pub const BLOCK_SCOPE_LOCAL: &str = "filter/blockLocal";
    pub const REMOVE_OUT_OF_SCOPE_DNS: &str = "filter/removeOutOfScopeDNS";
    pub const REMOVE_BLOCKED_DNS: &str = "filter/removeBlockedDNS";
    pub const PREVENT_BYPASSING: &str = "filter/preventBypassing";
    pub const FILTER_CNAMES: &str = "filter/filterCNAMEs";
    pub const DOMAIN_HEURISTICS: &str = "filter/domainHeuristics";
    pub const ENDPOINTS: &str = "filter/endpoints";
    pub const SERVICE_ENDPOINTS: &str = "filter/serviceEndpoints";
    pub const FILTER_LISTS: &str = "filter/lists";
}

/// A shared, replaceable profile with change detection.
///
/// Deciders run under the read guard; configuration updates swap the inner
/// profile and bump the revision so connections can detect staleness.
#[derive(Debug)]
pub struct LayeredProfile {
    id: ProfileId,
    profile: RwLock<Profile>,
    revision: AtomicU64,
}

impl LayeredProfile {
    pub fn new(id: ProfileId, profile: Profile) -> Arc<Self> {
        Arc::new(Self {
            id,
            profile: RwLock::new(profile),
            revision: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> &ProfileId {
        &self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Profile> {
        self.profile.read()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Replaces the profile and bumps the revision.
    pub fn set_profile(&self, profile: Profile) {
        *self.profile.write() = profile;
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Appends an endpoint rule, e.g. after a prompt response.
    pub fn add_endpoint_rule(&self, rule: crate::Endpoint, inbound: bool) {
        {
            let mut profile = self.profile.write();
            let list = if inbound {
                &mut profile.service_endpoints
            } else {
                &mut profile.endpoints
            };
            list.push(rule);
        }

        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}
