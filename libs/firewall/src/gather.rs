//! Connection enrichment: process attribution, remote entity and
//! captive-portal context.
//!
//! Runs for every packet of a connection until the data is complete;
//! info-only packets enrich but never complete, so a verdict is only ever
//! based on a real packet.

use packet_info::PacketInfo;
use socket_table::{LookupError, SocketTables};
use std::net::IpAddr;
use std::sync::Arc;
use warden_network::{DnsRequestIndex, IpInfoStore, SharedConnection};
use warden_profile::{Process, ProcessStore};

pub(crate) struct GatherDeps<'a> {
    pub sockets: &'a SocketTables,
    pub processes: &'a dyn ProcessStore,
    pub ip_info: &'a IpInfoStore,
    pub dns_index: &'a DnsRequestIndex,
    /// Captive portal endpoint, when one was detected.
    pub portal: Option<(IpAddr, String)>,
}

/// Enriches a connection; returns whether its data is now complete.
pub(crate) async fn gather(
    deps: &GatherDeps<'_>,
    shared: &SharedConnection,
    info: &PacketInfo,
) -> bool {
    let needs_process = shared.lock().process().is_none();

    let attribution = if needs_process {
        Some(attribute_process(deps, info).await)
    } else {
        None
    };

    let (pid, profile_id, remote_ip, has_domain) = {
        let mut conn = shared.lock();

        if let Some((process, inbound)) = attribution {
            if let Some(inbound) = inbound
                && inbound != conn.inbound
                && !conn.data_complete
            {
                tracing::debug!(conn = %conn.id, %inbound, "Correcting direction from socket table");
                conn.inbound = inbound;
            }

            conn.set_process(process);
        }

        (
            conn.pid,
            conn.profile_id(),
            conn.entity.ip,
            conn.entity.domain.is_some(),
        )
    };

    // Reverse IP → domain attribution, profile scope first.
    if !has_domain && let Some(ip) = remote_ip {
        let now_unix = chrono::Utc::now().timestamp();

        if let Some(resolved) = deps.ip_info.most_recent(profile_id.as_ref(), ip, now_unix) {
            let domain = resolved.domain.to_string();

            // The pending DNS request is superseded by this connection.
            if deps.dns_index.take_request_any_type(pid, &domain).is_some() {
                tracing::trace!(conn = %shared.lock().id, %domain, "Consumed pending DNS request");
            }

            let mut conn = shared.lock();
            conn.entity.set_domain(
                &domain,
                resolved.cnames.iter().map(|c| c.to_string()).collect(),
                Some(resolved.resolver.clone()),
            );
            conn.entity.dns_context = Some(resolved.context.clone());
        } else if let Some((portal_ip, portal_host)) = &deps.portal
            && *portal_ip == ip
        {
            shared.lock().entity.set_domain(portal_host, Vec::new(), None);
        }
    }

    let mut conn = shared.lock();
    conn.update_scope();

    if !info.info_only && conn.process().is_some() {
        conn.mark_data_complete();
    }

    conn.data_complete
}

/// Resolves the owning process, falling back to the sentinel descriptors.
///
/// Returns the process and, when the socket table had an opinion, the
/// corrected direction.
async fn attribute_process(
    deps: &GatherDeps<'_>,
    info: &PacketInfo,
) -> (Arc<Process>, Option<bool>) {
    match deps.sockets.lookup(info, false).await {
        Ok((pid, inbound)) => match deps.processes.get_or_find_process(pid) {
            Ok(process) => (process, Some(inbound)),
            Err(e) => {
                tracing::warn!(%pid, "Failed to load process: {e:#}");
                (deps.processes.unidentified_process(inbound), Some(inbound))
            }
        },
        Err(LookupError::NoProcess { inbound }) => {
            (deps.processes.unidentified_process(inbound), Some(inbound))
        }
        Err(LookupError::NoSocket) => {
            tracing::debug!(packet = ?info, "No socket found for packet");
            (deps.processes.unidentified_process(info.inbound), None)
        }
        Err(LookupError::UnsupportedProtocol(_)) => {
            (deps.processes.unidentified_process(info.inbound), None)
        }
    }
}
