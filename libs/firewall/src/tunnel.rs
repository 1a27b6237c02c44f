//! Contract to the external tunnel manager.
//!
//! The core only emits [`RerouteToTunnel`](warden_model::Verdict) verdicts;
//! building and maintaining the tunnel is the manager's business.

use anyhow::Result;

pub trait TunnelController: Send + Sync + 'static {
    /// Tears the tunnel down, e.g. on account changes.
    fn stop_tunnel(&self) -> Result<()>;

    /// The current exit node, when a tunnel is up.
    fn exit_node_id(&self) -> Option<String>;
}

/// No tunnel manager attached; reroute verdicts are never emitted.
pub struct NoTunnel;

impl TunnelController for NoTunnel {
    fn stop_tunnel(&self) -> Result<()> {
        Ok(())
    }

    fn exit_node_id(&self) -> Option<String> {
        None
    }
}
