//! The ordered policy checks that produce a connection's primary verdict.
//!
//! Each decider either reaches a conclusive verdict (setting it on the
//! connection) or passes. The pipeline runs under a read guard of the
//! process profile; order is fixed and earlier deciders win.

use crate::bypass;
use crate::heuristics::{self, DomainAnomaly};
use crate::intel::{self, FilterListIndex};
use packet_info::{IpVersion, PacketInfo};
use socket_table::SocketTables;
use std::time::Instant;
use warden_model::{NetworkState, Pid, Verdict};
use warden_network::{Connection, Reason};
use warden_profile::{DefaultAction, EPResult, Profile, option_key};

/// Everything the deciders may consult besides connection and profile.
pub(crate) struct DeciderCtx<'a> {
    pub own_pid: Pid,
    /// Socket tables for the self-communication reverse lookup; absent in
    /// some tests.
    pub sockets: Option<&'a SocketTables>,
    pub network_state: NetworkState,
    pub intel: &'a dyn FilterListIndex,
}

enum Decision {
    Continue,
    Matched,
}

/// What the pipeline concluded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PipelineOutcome {
    /// A verdict has been set on the connection.
    Decided,
    /// No decider matched and the profile wants to ask the user.
    NeedsPrompt,
}

type Decider = fn(&DeciderCtx<'_>, &mut Connection, &Profile) -> Decision;

const DECIDERS: &[Decider] = &[
    decide_self,
    decide_self_communication,
    decide_connection_type,
    decide_connectivity_domain,
    decide_scope,
    decide_endpoints,
    decide_bypass_prevention,
    decide_filter_lists,
    decide_inbound_default,
    decide_domain_heuristics,
    decide_auto_permit,
];

/// Runs the decider pipeline over a data-complete connection.
pub(crate) fn run(ctx: &DeciderCtx<'_>, conn: &mut Connection) -> PipelineOutcome {
    let Some(process) = conn.process() else {
        conn.set_verdict(
            Verdict::Undeterminable,
            Reason::new("no process attribution"),
        );
        return PipelineOutcome::Decided;
    };

    let layered = process.profile.clone();
    let profile = layered.read();
    conn.profile_revision = layered.revision();

    for decider in DECIDERS {
        if let Decision::Matched = decider(ctx, conn, &profile) {
            if let Some(id) = conn.profile_id()
                && conn.reason.profile_id.is_none()
            {
                conn.reason.profile_id = Some(id);
            }

            return PipelineOutcome::Decided;
        }
    }

    let profile_id = conn.profile_id();

    match profile.default_action {
        DefaultAction::Permit => {
            let mut reason = Reason::new("permitted by default action")
                .with_option_key(option_key::DEFAULT_ACTION);
            reason.profile_id = profile_id;

            conn.set_verdict(Verdict::Accept, reason);
            PipelineOutcome::Decided
        }
        DefaultAction::Block => {
            let mut reason = Reason::new("blocked by default action")
                .with_option_key(option_key::DEFAULT_ACTION);
            reason.profile_id = profile_id;

            conn.set_verdict(Verdict::Block, reason);
            PipelineOutcome::Decided
        }
        DefaultAction::Ask => PipelineOutcome::NeedsPrompt,
    }
}

/// 1. Our own traffic is always internal and accepted.
fn decide_self(ctx: &DeciderCtx<'_>, conn: &mut Connection, profile: &Profile) -> Decision {
    if conn.pid != ctx.own_pid && !profile.internal {
        return Decision::Continue;
    }

    conn.internal = true;
    conn.set_verdict(Verdict::Accept, Reason::new("own connection"));
    Decision::Matched
}

/// 2. Traffic to ourselves over our own address.
fn decide_self_communication(
    ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    _profile: &Profile,
) -> Decision {
    let (Some(local_ip), Some(remote_ip)) = (conn.local_ip, conn.entity.ip) else {
        return Decision::Continue;
    };

    if local_ip != remote_ip {
        return Decision::Continue;
    }

    let Some(sockets) = ctx.sockets else {
        return Decision::Continue;
    };

    // Look up the socket serving the other end of this flow.
    let reversed = PacketInfo {
        inbound: !conn.inbound,
        version: conn.version.unwrap_or(IpVersion::V4),
        protocol: conn.protocol,
        src: local_ip,
        src_port: conn.local_port,
        dst: remote_ip,
        dst_port: conn.entity.port,
        pid: None,
        icmp_type: None,
        tcp: None,
        fragment: None,
        seen: Instant::now(),
        info_only: true,
        pre_permitted: false,
    };

    match sockets.lookup_once(&reversed, Instant::now()) {
        Some((pid, _)) if pid == ctx.own_pid => {
            conn.internal = true;
            conn.set_verdict(Verdict::Accept, Reason::new("communication with own service"));
            Decision::Matched
        }
        _ => Decision::Continue,
    }
}

/// 3. Coarse connection-type policy: inbound service blocking and P2P.
fn decide_connection_type(
    _ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    profile: &Profile,
) -> Decision {
    if conn.inbound && profile.block_inbound {
        let scope = conn.entity.scope;
        let reason = Reason::new("incoming connections are blocked")
            .with_option_key(option_key::BLOCK_INBOUND);

        let verdict = if scope.is_localhost() { Verdict::Block } else { Verdict::Drop };
        conn.set_verdict(verdict, reason);
        return Decision::Matched;
    }

    if !conn.inbound
        && profile.block_p2p
        && conn.entity.domain.is_none()
        && conn.entity.scope.is_global()
    {
        conn.set_verdict(
            Verdict::Block,
            Reason::new("direct connections to the internet are blocked")
                .with_option_key(option_key::BLOCK_P2P),
        );
        return Decision::Matched;
    }

    Decision::Continue
}

/// 4. Keep captive-portal detection working while the network is degraded.
fn decide_connectivity_domain(
    ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    profile: &Profile,
) -> Decision {
    if conn.inbound || !profile.block_scope_internet || !ctx.network_state.is_degraded() {
        return Decision::Continue;
    }

    let Some(domain) = &conn.entity.domain else {
        return Decision::Continue;
    };

    if !intel::is_connectivity_domain(domain) {
        return Decision::Continue;
    }

    conn.set_verdict(
        Verdict::Accept,
        Reason::new(format!(
            "connectivity domain {domain} permitted while {}",
            ctx.network_state
        )),
    );
    Decision::Matched
}

/// 5. Scope policy on the remote IP.
fn decide_scope(_ctx: &DeciderCtx<'_>, conn: &mut Connection, profile: &Profile) -> Decision {
    let Some(ip) = conn.entity.ip else {
        // DNS request connections have no peer IP yet.
        return Decision::Continue;
    };

    let scope = conn.entity.scope;

    if !scope.is_valid() {
        conn.set_verdict(
            Verdict::Block,
            Reason::new(format!("invalid peer address {ip}")),
        );
        return Decision::Matched;
    }

    let blocked = if scope.is_global() {
        profile.block_scope_internet.then_some((
            "connections to the internet are blocked",
            option_key::BLOCK_SCOPE_INTERNET,
        ))
    } else if scope.is_lan() {
        profile.block_scope_lan.then_some((
            "connections to the LAN are blocked",
            option_key::BLOCK_SCOPE_LAN,
        ))
    } else if scope.is_localhost() {
        profile.block_scope_local.then_some((
            "connections to localhost are blocked",
            option_key::BLOCK_SCOPE_LOCAL,
        ))
    } else {
        None
    };

    match blocked {
        Some((message, key)) => {
            conn.set_verdict(Verdict::Block, Reason::new(message).with_option_key(key));
            Decision::Matched
        }
        None => Decision::Continue,
    }
}

/// 6. The profile's endpoint rule lists.
fn decide_endpoints(_ctx: &DeciderCtx<'_>, conn: &mut Connection, profile: &Profile) -> Decision {
    let list = if conn.inbound { &profile.service_endpoints } else { &profile.endpoints };
    let key = if conn.inbound { option_key::SERVICE_ENDPOINTS } else { option_key::ENDPOINTS };

    match list.match_dst(&conn.entity.dst_view()) {
        EPResult::NoMatch => Decision::Continue,
        EPResult::Permitted(rule) => {
            conn.set_verdict(Verdict::Accept, Reason::new(rule).with_option_key(key));
            Decision::Matched
        }
        EPResult::Denied(rule) => {
            let verdict = if conn.inbound { Verdict::Drop } else { Verdict::Block };
            conn.set_verdict(verdict, Reason::new(rule).with_option_key(key));
            Decision::Matched
        }
    }
}

/// 7. Resolver bypass prevention. ICMP is exempt.
fn decide_bypass_prevention(
    _ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    profile: &Profile,
) -> Decision {
    if !profile.prevent_bypassing || conn.inbound || conn.protocol.is_icmp() {
        return Decision::Continue;
    }

    if let Some(domain) = &conn.entity.domain
        && bypass::is_canary_domain(domain)
    {
        conn.set_verdict(
            Verdict::Block,
            Reason::new("blocked DNS over HTTPS canary domain to keep DNS local")
                .with_option_key(option_key::PREVENT_BYPASSING),
        );
        return Decision::Matched;
    }

    if let Some(ip) = conn.entity.ip
        && matches!(conn.entity.port, 53 | 443 | 853)
        && (bypass::is_known_resolver(ip)
            || conn
                .entity
                .lists()
                .is_some_and(|lists| lists.iter().any(|l| l == bypass::RESOLVER_FILTER_LIST)))
    {
        conn.set_verdict(
            Verdict::Block,
            Reason::new(format!("blocked direct access to public resolver {ip}"))
                .with_option_key(option_key::PREVENT_BYPASSING),
        );
        return Decision::Matched;
    }

    Decision::Continue
}

/// 8. Category/threat filter lists the profile subscribes to.
fn decide_filter_lists(
    ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    profile: &Profile,
) -> Decision {
    if profile.filter_lists.is_empty() {
        return Decision::Continue;
    }

    if conn.entity.lists().is_none() {
        let mut lists = Vec::new();
        if let Some(domain) = &conn.entity.domain {
            lists.extend(ctx.intel.lookup_domain(domain));
        }
        if let Some(ip) = conn.entity.ip {
            lists.extend(ctx.intel.lookup_ip(ip));
        }
        conn.entity.set_lists(lists);
    }

    let matched = conn
        .entity
        .lists()
        .unwrap_or(&[])
        .iter()
        .find(|list| profile.filter_lists.contains(list))
        .cloned();

    match matched {
        Some(list) => {
            let verdict = if conn.inbound { Verdict::Drop } else { Verdict::Block };
            conn.set_verdict(
                verdict,
                Reason::new(format!("matched filter list {list}"))
                    .with_option_key(option_key::FILTER_LISTS)
                    .with_context(serde_json::json!({ "list": list })),
            );
            Decision::Matched
        }
        None => Decision::Continue,
    }
}

/// 9. Anything inbound that is still undecided is dropped.
fn decide_inbound_default(
    _ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    _profile: &Profile,
) -> Decision {
    if !conn.inbound {
        return Decision::Continue;
    }

    conn.set_verdict(
        Verdict::Drop,
        Reason::new("incoming connection not allowed by any rule"),
    );
    Decision::Matched
}

/// 10. DGA / DNS-tunnel heuristics.
fn decide_domain_heuristics(
    _ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    profile: &Profile,
) -> Decision {
    if !profile.domain_heuristics {
        return Decision::Continue;
    }

    let Some(domain) = &conn.entity.domain else {
        return Decision::Continue;
    };

    match heuristics::check_domain(domain) {
        Some(DomainAnomaly::SuspectedDga) => {
            conn.set_verdict(
                Verdict::Block,
                Reason::new(format!("possible DGA domain {domain}"))
                    .with_option_key(option_key::DOMAIN_HEURISTICS),
            );
            Decision::Matched
        }
        Some(DomainAnomaly::SuspectedTunnel) => {
            conn.set_verdict(
                Verdict::Block,
                Reason::new("possible DNS tunnel: excessively long subdomain")
                    .with_option_key(option_key::DOMAIN_HEURISTICS),
            );
            Decision::Matched
        }
        None => Decision::Continue,
    }
}

/// 11. Auto-permit domains that are clearly related to the process.
fn decide_auto_permit(
    _ctx: &DeciderCtx<'_>,
    conn: &mut Connection,
    profile: &Profile,
) -> Decision {
    if profile.default_action == DefaultAction::Permit || profile.disable_auto_permit {
        return Decision::Continue;
    }

    let Some(domain) = conn.entity.domain.clone() else {
        return Decision::Continue;
    };

    let Some(process) = conn.process().cloned() else {
        return Decision::Continue;
    };

    let mut references = process.binary_tail();
    references.push(process.name.as_str());
    references.push(process.exec_name());

    let Some((label, reference)) = heuristics::find_related(&domain, &references) else {
        return Decision::Continue;
    };

    conn.set_verdict(
        Verdict::Accept,
        Reason::new(format!(
            "domain label {label} is related to process {reference}"
        )),
    );
    Decision::Matched
}
