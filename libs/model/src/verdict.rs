use serde::{Deserialize, Serialize};
use std::fmt;

/// The policy decision applied to a packet or flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No decision has been made yet.
    #[default]
    Undecided,
    /// A decision was attempted but could not be reached.
    Undeterminable,
    /// Let the packet/flow pass.
    Accept,
    /// Reject with a response the peer can observe (TCP RST / ICMP unreachable).
    Block,
    /// Silently discard.
    Drop,
    /// Redirect to our own nameserver.
    RerouteToNameserver,
    /// Redirect into the tunnel.
    RerouteToTunnel,
    /// Applying an earlier verdict failed.
    Failed,
}

impl Verdict {
    /// Severity rating used for "worst verdict" tracking and for inspectors,
    /// which may only ever raise a verdict.
    ///
    /// Accept < RerouteToTunnel < RerouteToNameserver < Block < Drop <
    /// Failed < Undeterminable < Undecided.
    pub fn severity(&self) -> u8 {
        match self {
            Verdict::Accept => 1,
            Verdict::RerouteToTunnel => 2,
            Verdict::RerouteToNameserver => 3,
            Verdict::Block => 4,
            Verdict::Drop => 5,
            Verdict::Failed => 6,
            Verdict::Undeterminable => 7,
            Verdict::Undecided => 8,
        }
    }

    pub fn is_worse_than(&self, other: Verdict) -> bool {
        self.severity() > other.severity()
    }

    /// Whether a real decision has been reached.
    pub fn is_decided(&self) -> bool {
        !matches!(self, Verdict::Undecided | Verdict::Undeterminable)
    }

    /// Whether this verdict lets traffic flow.
    pub fn is_allowing(&self) -> bool {
        matches!(
            self,
            Verdict::Accept | Verdict::RerouteToNameserver | Verdict::RerouteToTunnel
        )
    }

    /// Folds unresolved verdicts into the fail-safe default.
    ///
    /// Undecided, Undeterminable and Failed must never reach the interceptor
    /// as-is; they become Drop for inbound and Block for outbound traffic.
    pub fn fold_unresolved(self, inbound: bool) -> Verdict {
        match self {
            Verdict::Undecided | Verdict::Undeterminable | Verdict::Failed => {
                if inbound {
                    Verdict::Drop
                } else {
                    Verdict::Block
                }
            }
            decided => decided,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Verdict::Undecided => "undecided",
            Verdict::Undeterminable => "undeterminable",
            Verdict::Accept => "accept",
            Verdict::Block => "block",
            Verdict::Drop => "drop",
            Verdict::RerouteToNameserver => "reroute to nameserver",
            Verdict::RerouteToTunnel => "reroute to tunnel",
            Verdict::Failed => "failed",
        };

        write!(f, "{verb}")
    }
}
