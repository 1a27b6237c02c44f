//! Filtering of resolved DNS responses.
//!
//! Two independent gates remove address records before a response reaches
//! the application: out-of-scope answers (split-view safety) and answers in
//! scopes the profile blocks. If nothing valid survives a filtered
//! response, the whole request is blocked with the first intervening
//! option key as reason.

use crate::intel::FilterListIndex;
use dns_records::{OwnedRecord, RRCache, ResolvedDomain, format_record, record_ip};
use std::mem;
use warden_model::{IpScope, Pid, Verdict};
use warden_network::{Connection, IpInfoStore, Reason};
use warden_profile::{EPResult, Profile, option_key};

/// Applies both DNS gates and, if configured, the CNAME re-evaluation.
///
/// Returns the (possibly reduced) cache, or `None` when the response must
/// be withheld entirely; in that case the connection carries the verdict
/// and reason. Requests of our own process are never filtered.
pub fn filter_resolved_dns(
    conn: &mut Connection,
    profile: &Profile,
    mut rr: RRCache,
    intel: &dyn FilterListIndex,
    own_pid: Pid,
) -> Option<RRCache> {
    if conn.pid == own_pid {
        return Some(rr);
    }

    let mut intervening_keys = Vec::new();
    let had_address_records = rr.has_address_records();

    let answer = mem::take(&mut rr.answer);
    let mut allowed_address_records = 0usize;
    for record in answer {
        match gate_record(&record, profile, &rr) {
            None => {
                if record_ip(&record).is_some() {
                    allowed_address_records += 1;
                }
                rr.answer.push(record);
            }
            Some(key) => {
                tracing::debug!(conn = %conn.id, record = %format_record(&record), %key, "Filtered DNS record");
                rr.filtered_entries.push(format_record(&record));
                intervening_keys.push(key);
            }
        }
    }

    // The extra section is filtered with the same gates but never counts
    // towards the surviving address records.
    let extra = mem::take(&mut rr.extra);
    for record in extra {
        match gate_record(&record, profile, &rr) {
            None => rr.extra.push(record),
            Some(key) => {
                rr.filtered_entries.push(format_record(&record));
                intervening_keys.push(key);
            }
        }
    }

    if !intervening_keys.is_empty() && allowed_address_records == 0 && had_address_records {
        let key = intervening_keys[0];

        conn.set_verdict(
            Verdict::Block,
            Reason::new(format!(
                "DNS response only contained records filtered by {key}"
            ))
            .with_option_key(key)
            .with_context(serde_json::json!({ "filtered": rr.filtered_entries })),
        );

        return None;
    }

    if profile.filter_cnames && !passes_cname_reevaluation(conn, profile, &rr, intel) {
        return None;
    }

    Some(rr)
}

/// Decides whether a record is removed; returns the intervening option key.
fn gate_record(record: &OwnedRecord, profile: &Profile, rr: &RRCache) -> Option<&'static str> {
    let Some(ip) = record_ip(record) else {
        // Only address records are gated.
        return None;
    };

    let scope = IpScope::classify(ip);

    if profile.remove_out_of_scope_dns {
        // Localhost answers from any resolver are out of scope, LAN answers
        // only when a global resolver produced them (split-view safety).
        if scope.is_localhost() {
            return Some(option_key::REMOVE_OUT_OF_SCOPE_DNS);
        }

        if scope.is_lan() && rr.resolver.server_scope.is_global() {
            return Some(option_key::REMOVE_OUT_OF_SCOPE_DNS);
        }
    }

    // The system resolver is trusted to answer for blocked scopes, e.g. to
    // keep split-horizon corporate setups working.
    if profile.remove_blocked_dns && !rr.resolver.is_system_resolver {
        let blocked = (scope.is_global() && profile.block_scope_internet)
            || (scope.is_lan() && profile.block_scope_lan)
            || (scope.is_localhost() && profile.block_scope_local);

        if blocked {
            return Some(option_key::REMOVE_BLOCKED_DNS);
        }
    }

    None
}

/// Re-runs endpoint and filter-list matching with the CNAME chain exposed.
fn passes_cname_reevaluation(
    conn: &mut Connection,
    profile: &Profile,
    rr: &RRCache,
    intel: &dyn FilterListIndex,
) -> bool {
    conn.entity.reset_matching_caches();
    conn.entity.include_cnames = true;
    conn.entity.cnames = rr.cname_chain().iter().map(|c| c.to_string()).collect();

    if let EPResult::Denied(rule) = profile.endpoints.match_dst(&conn.entity.dst_view()) {
        conn.set_verdict(
            Verdict::Block,
            Reason::new(format!("CNAME chain denied: {rule}"))
                .with_option_key(option_key::FILTER_CNAMES),
        );
        return false;
    }

    let listed = conn.entity.cnames.iter().find_map(|cname| {
        intel
            .lookup_domain(cname)
            .into_iter()
            .find(|list| profile.filter_lists.contains(list))
            .map(|list| (cname.clone(), list))
    });

    if let Some((cname, list)) = listed {
        conn.set_verdict(
            Verdict::Block,
            Reason::new(format!("CNAME {cname} matched filter list {list}"))
                .with_option_key(option_key::FILTER_CNAMES),
        );
        return false;
    }

    true
}

/// Publishes the surviving records to the IP-info store so follow-up
/// connections can be attributed to this resolution.
pub fn update_ips_and_cnames(rr: &RRCache, conn: &Connection, ip_info: &IpInfoStore) {
    let resolved = ResolvedDomain {
        domain: rr.domain.clone(),
        cnames: rr.cname_chain(),
        expires: rr.expires,
        resolver: rr.resolver.clone(),
        context: rr.context.clone(),
    };

    let profile = conn.profile_id();

    for ip in rr.address_records() {
        // Localhost refusals are expected here, split-view records may
        // legitimately point home.
        let _ = ip_info.add_domain(profile.clone(), ip, resolved.clone());
    }
}
