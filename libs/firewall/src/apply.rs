//! Translation of verdicts into interceptor calls.

use crate::config::Config;
use anyhow::Result;
use packet_info::{ConnectionId, Packet};
use warden_model::Verdict;
use warden_network::{Connection, Reason};

/// Pushes verdict changes for flows the kernel already knows about.
///
/// Implemented by the interceptor integration; used by the reset
/// coordinator when a re-evaluation changes a connection's verdict.
pub trait VerdictUpdater: Send + Sync + 'static {
    fn update_verdict(&self, flow: &ConnectionId, verdict: Verdict) -> Result<()>;
}

/// A [`VerdictUpdater`] for embedders without kernel-side verdict state.
pub struct NoKernelVerdicts;

impl VerdictUpdater for NoKernelVerdicts {
    fn update_verdict(&self, _flow: &ConnectionId, _verdict: Verdict) -> Result<()> {
        Ok(())
    }
}

/// Applies a single verdict to a packet.
///
/// Unresolved verdicts must have been folded by the caller; they are folded
/// again here as a last line of defense (outbound bias when the packet
/// carries no direction).
pub fn apply_verdict(packet: &dyn Packet, verdict: Verdict, permanent: bool) -> Result<()> {
    let verdict = verdict.fold_unresolved(packet.info().inbound);

    match verdict {
        Verdict::Accept => packet.accept(permanent),
        Verdict::Block => packet.block(permanent),
        Verdict::Drop => packet.drop(permanent),
        Verdict::RerouteToNameserver => packet.reroute_to_nameserver(),
        Verdict::RerouteToTunnel => packet.reroute_to_tunnel(),
        Verdict::Undecided | Verdict::Undeterminable | Verdict::Failed => {
            unreachable!("unresolved verdicts fold to block/drop")
        }
    }
}

/// Applies a connection's active verdict to one of its packets.
///
/// Chooses permanent application when the configuration, the profile and
/// the connection state allow it, and records failures on the connection.
pub fn apply_to_connection(conn: &mut Connection, packet: &dyn Packet, config: &Config) {
    let verdict = conn.verdict_active().fold_unresolved(conn.inbound);

    let profile_allows = conn
        .process()
        .map(|p| p.profile.read().permanent_verdicts)
        .unwrap_or(false);
    let permanent = config.permanent_verdicts && profile_allows && !conn.inspecting;

    match apply_verdict(packet, verdict, permanent) {
        Ok(()) => {
            if permanent {
                conn.verdict_permanent = true;
            }

            tracing::trace!(conn = %conn.id, %verdict, %permanent, "Applied verdict");
        }
        Err(e) => {
            tracing::warn!(conn = %conn.id, %verdict, packet = ?packet.info(), "Failed to apply verdict: {e:#}");

            conn.set_verdict_failed(
                Reason::new(format!("failed to apply verdict {verdict}"))
                    .with_context(serde_json::json!({ "error": format!("{e:#}") })),
            );
        }
    }
}
