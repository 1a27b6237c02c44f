use crate::entity::{Entity, canonical_domain};
use chrono::{DateTime, Utc};
use packet_info::{ConnectionId, IpVersion, Packet, PacketInfo, TransportProtocol};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use warden_model::{IpScope, PID_UNIDENTIFIED, Pid, ProfileId, Verdict};
use warden_profile::Process;

/// Capacity of the per-connection packet queue.
pub(crate) const PACKET_QUEUE_CAPACITY: usize = 100;

pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Ip,
    Dns,
}

/// The user-facing explanation of a verdict.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Reason {
    pub message: String,
    /// The option that caused the decision, if any.
    pub option_key: Option<String>,
    pub profile_id: Option<ProfileId>,
    /// Free-form details, e.g. the matched filter list.
    pub context: Option<serde_json::Value>,
}

impl Reason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_option_key(mut self, key: &str) -> Self {
        self.option_key = Some(key.to_owned());
        self
    }

    pub fn with_profile(mut self, id: ProfileId) -> Self {
        self.profile_id = Some(id);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

/// Semantic location of the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnScope {
    IncomingHost,
    IncomingLan,
    IncomingInternet,
    IncomingInvalid,
    PeerHost,
    PeerLan,
    PeerInternet,
    PeerInvalid,
    /// Outbound connection to a known domain.
    Domain(String),
}

impl ConnScope {
    fn derive(inbound: bool, entity: &Entity) -> Self {
        if let Some(domain) = &entity.domain
            && !inbound
        {
            return ConnScope::Domain(domain.clone());
        }

        let scope = entity.scope;
        match (inbound, scope) {
            (true, s) if s.is_localhost() => ConnScope::IncomingHost,
            (true, s) if s.is_lan() => ConnScope::IncomingLan,
            (true, s) if s.is_global() => ConnScope::IncomingInternet,
            (true, _) => ConnScope::IncomingInvalid,
            (false, s) if s.is_localhost() => ConnScope::PeerHost,
            (false, s) if s.is_lan() => ConnScope::PeerLan,
            (false, s) if s.is_global() => ConnScope::PeerInternet,
            (false, _) => ConnScope::PeerInvalid,
        }
    }
}

impl fmt::Display for ConnScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnScope::IncomingHost => write!(f, "incoming-host"),
            ConnScope::IncomingLan => write!(f, "incoming-lan"),
            ConnScope::IncomingInternet => write!(f, "incoming-internet"),
            ConnScope::IncomingInvalid => write!(f, "incoming-invalid"),
            ConnScope::PeerHost => write!(f, "peer-host"),
            ConnScope::PeerLan => write!(f, "peer-lan"),
            ConnScope::PeerInternet => write!(f, "peer-internet"),
            ConnScope::PeerInvalid => write!(f, "peer-invalid"),
            ConnScope::Domain(domain) => write!(f, "{domain}"),
        }
    }
}

/// One observed flow (or DNS request) and everything we know about it.
pub struct Connection {
    /// Stable string key; equals the flow ID for IP connections.
    pub id: String,
    pub conn_type: ConnectionType,
    /// The 5-tuple key; `None` for DNS request connections.
    pub flow: Option<ConnectionId>,

    pub inbound: bool,
    pub version: Option<IpVersion>,
    pub protocol: TransportProtocol,
    pub local_ip: Option<IpAddr>,
    pub local_port: u16,
    /// Classification of `local_ip`.
    pub local_scope: IpScope,

    pub entity: Entity,
    pub scope: ConnScope,

    pub pid: Pid,
    pub process: Option<Arc<Process>>,
    /// Revision of the process profile this connection was last decided
    /// under.
    pub profile_revision: u64,

    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub(crate) started_mono: Instant,
    pub(crate) last_seen: Instant,
    pub(crate) ended_mono: Option<Instant>,

    verdict_active: Verdict,
    verdict_firewall: Verdict,
    verdict_worst: Verdict,
    pub reason: Reason,

    /// The verdict was handed to the kernel for the whole flow.
    pub verdict_permanent: bool,
    pub inspecting: bool,
    /// Connection belongs to the firewall itself.
    pub internal: bool,
    pub tunneled: bool,
    pub encrypted: bool,

    pub data_complete: bool,
    pub save_when_finished: bool,

    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_seen: u64,

    queue: Option<mpsc::Sender<Box<dyn Packet>>>,
    packets_dropped: u64,
}

impl Connection {
    pub fn from_packet(info: &PacketInfo) -> Self {
        let flow = info.connection_id();
        let entity = Entity::from_packet(info);
        let scope = ConnScope::derive(info.inbound, &entity);
        let local_ip = info.local_ip();

        Self {
            id: flow.to_string(),
            conn_type: ConnectionType::Ip,
            flow: Some(flow),
            inbound: info.inbound,
            version: Some(info.version),
            protocol: info.protocol,
            local_ip: Some(local_ip),
            local_port: info.local_port(),
            local_scope: IpScope::classify(local_ip),
            entity,
            scope,
            pid: info.pid.unwrap_or(PID_UNIDENTIFIED),
            process: None,
            profile_revision: 0,
            started: Utc::now(),
            ended: None,
            started_mono: info.seen,
            last_seen: info.seen,
            ended_mono: None,
            verdict_active: Verdict::Undecided,
            verdict_firewall: Verdict::Undecided,
            verdict_worst: Verdict::Undecided,
            reason: Reason::default(),
            verdict_permanent: false,
            inspecting: false,
            internal: false,
            tunneled: false,
            encrypted: false,
            data_complete: false,
            save_when_finished: false,
            bytes_received: 0,
            bytes_sent: 0,
            packets_seen: 1,
            queue: None,
            packets_dropped: 0,
        }
    }

    /// A DNS request connection; ended the moment it is created.
    pub fn from_dns_request(pid: Pid, fqdn: &str, qtype: u16, now: Instant) -> Self {
        let fqdn = canonical_domain(fqdn);
        let entity = Entity::from_domain(&fqdn);
        let started = Utc::now();

        Self {
            id: format!("dns-{pid}-{fqdn}-{qtype}"),
            conn_type: ConnectionType::Dns,
            flow: None,
            inbound: false,
            version: None,
            protocol: TransportProtocol::Udp,
            local_ip: None,
            local_port: 0,
            local_scope: IpScope::Host,
            scope: ConnScope::Domain(fqdn),
            entity,
            pid,
            process: None,
            profile_revision: 0,
            started,
            ended: Some(started),
            started_mono: now,
            last_seen: now,
            ended_mono: Some(now),
            verdict_active: Verdict::Undecided,
            verdict_firewall: Verdict::Undecided,
            verdict_worst: Verdict::Undecided,
            reason: Reason::default(),
            verdict_permanent: false,
            inspecting: false,
            internal: false,
            tunneled: false,
            encrypted: false,
            data_complete: false,
            save_when_finished: true,
            bytes_received: 0,
            bytes_sent: 0,
            packets_seen: 0,
            queue: None,
            packets_dropped: 0,
        }
    }

    pub fn verdict_active(&self) -> Verdict {
        self.verdict_active
    }

    pub fn verdict_firewall(&self) -> Verdict {
        self.verdict_firewall
    }

    pub fn verdict_worst(&self) -> Verdict {
        self.verdict_worst
    }

    /// Applies a firewall decision and returns the resulting active verdict.
    ///
    /// Unresolved verdicts fold to the fail-safe default. The active verdict
    /// follows the firewall verdict except for stream protocols, where any
    /// divergence from an applied verdict kills the flow outright; moving
    /// away from a non-allowed state is always permitted.
    pub fn set_firewall_verdict(&mut self, proposed: Verdict) -> Verdict {
        let proposed = proposed.fold_unresolved(self.inbound);
        self.verdict_firewall = proposed;

        self.verdict_active = if self.verdict_active == Verdict::Undecided {
            proposed
        } else if matches!(
            self.verdict_worst,
            Verdict::Block | Verdict::Drop | Verdict::Failed | Verdict::Undeterminable
        ) {
            // Unblocking from a non-allowed state is always possible.
            proposed
        } else if !self.protocol.is_stream_oriented() {
            proposed
        } else if proposed == self.verdict_active {
            self.verdict_active
        } else {
            // A live stream whose verdict changed is killed in both
            // directions; the application has to reconnect.
            tracing::debug!(
                conn = %self.id,
                active = %self.verdict_active,
                %proposed,
                "Stream verdict diverged, killing flow"
            );
            Verdict::Block
        };

        if self.verdict_worst == Verdict::Undecided || proposed.is_worse_than(self.verdict_worst) {
            self.verdict_worst = proposed;
        }

        self.verdict_active
    }

    pub fn set_verdict(&mut self, proposed: Verdict, reason: Reason) -> Verdict {
        self.reason = reason;
        self.set_firewall_verdict(proposed)
    }

    /// Marks a failed verdict application.
    pub fn set_verdict_failed(&mut self, reason: Reason) {
        self.reason = reason;
        self.verdict_firewall = Verdict::Failed;
        if Verdict::Failed.is_worse_than(self.verdict_worst)
            || self.verdict_worst == Verdict::Undecided
        {
            self.verdict_worst = Verdict::Failed;
        }
    }

    pub fn set_process(&mut self, process: Arc<Process>) {
        self.pid = process.pid;
        self.profile_revision = process.profile.revision();
        self.process = Some(process);
    }

    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    pub fn profile_id(&self) -> Option<ProfileId> {
        self.process.as_ref().map(|p| p.profile_id().clone())
    }

    /// Recomputes the derived scope after entity enrichment.
    pub fn update_scope(&mut self) {
        self.scope = ConnScope::derive(self.inbound, &self.entity);
    }

    /// Latches data completeness once process, profile and entity are known.
    pub fn mark_data_complete(&mut self) {
        self.data_complete = true;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.packets_seen += 1;
    }

    pub fn add_bandwidth(&mut self, received: u64, sent: u64) {
        self.bytes_received += received;
        self.bytes_sent += sent;
    }

    pub fn end(&mut self, now: Instant) {
        if self.ended.is_none() {
            self.ended = Some(Utc::now());
            self.ended_mono = Some(now);
        }
    }

    pub fn has_ended(&self) -> bool {
        self.ended.is_some()
    }

    /// Installs the per-connection packet queue; packets arriving while no
    /// queue is installed are handled with the stored verdict.
    pub fn set_packet_queue(&mut self) -> mpsc::Receiver<Box<dyn Packet>> {
        let (tx, rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        self.queue = Some(tx);
        rx
    }

    pub fn clear_packet_queue(&mut self) {
        self.queue = None;
    }

    pub fn has_packet_queue(&self) -> bool {
        self.queue.is_some()
    }

    /// Hands a packet to the connection's worker.
    ///
    /// Returns the packet back when no worker is installed. A saturated
    /// queue drops the packet; the interceptor must never be blocked.
    pub fn try_enqueue(&mut self, packet: Box<dyn Packet>) -> Result<(), Box<dyn Packet>> {
        let Some(queue) = &self.queue else {
            return Err(packet);
        };

        match queue.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(packet)) => {
                self.packets_dropped += 1;
                tracing::warn!(
                    conn = %self.id,
                    dropped = %self.packets_dropped,
                    "Packet queue saturated, dropping packet"
                );
                crate::metrics::packet_dropped(&packet.info().protocol);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(packet)) => {
                self.queue = None;
                Err(packet)
            }
        }
    }

    /// JSON rendering for the query surface.
    pub(crate) fn render(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "type": self.conn_type,
            "inbound": self.inbound,
            "protocol": self.protocol.to_string(),
            "local_ip": self.local_ip.map(|ip| ip.to_string()),
            "local_port": self.local_port,
            "remote_ip": self.entity.ip.map(|ip| ip.to_string()),
            "remote_port": self.entity.port,
            "domain": self.entity.domain,
            "cnames": self.entity.cnames,
            "scope": self.scope.to_string(),
            "pid": self.pid,
            "profile": self.profile_id().map(|id| id.to_string()),
            "verdict": {
                "active": self.verdict_active,
                "firewall": self.verdict_firewall,
                "worst": self.verdict_worst,
                "permanent": self.verdict_permanent,
            },
            "reason": self.reason,
            "started": self.started.to_rfc3339(),
            "ended": self.ended.map(|t| t.to_rfc3339()),
            "internal": self.internal,
            "tunneled": self.tunneled,
            "encrypted": self.encrypted,
            "bytes_received": self.bytes_received,
            "bytes_sent": self.bytes_sent,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("pid", &self.pid)
            .field("verdict", &self.verdict_active)
            .field("data_complete", &self.data_complete)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_info::testing::{icmp_v4_packet_info, tcp_v4_packet_info};

    fn tcp_conn() -> Connection {
        Connection::from_packet(&tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443"))
    }

    #[test]
    fn first_decision_sets_all_verdicts() {
        let mut conn = tcp_conn();

        let active = conn.set_firewall_verdict(Verdict::Accept);

        assert_eq!(active, Verdict::Accept);
        assert_eq!(conn.verdict_firewall(), Verdict::Accept);
        assert_eq!(conn.verdict_worst(), Verdict::Accept);
    }

    #[test]
    fn setting_the_same_verdict_twice_changes_nothing() {
        let mut conn = tcp_conn();

        conn.set_firewall_verdict(Verdict::Accept);
        let active = conn.set_firewall_verdict(Verdict::Accept);

        assert_eq!(active, Verdict::Accept);
        assert_eq!(conn.verdict_worst(), Verdict::Accept);
    }

    #[test]
    fn diverging_stream_verdict_kills_the_flow() {
        let mut conn = tcp_conn();

        conn.set_firewall_verdict(Verdict::Accept);
        let active = conn.set_firewall_verdict(Verdict::RerouteToTunnel);

        assert_eq!(active, Verdict::Block);
        assert_eq!(conn.verdict_firewall(), Verdict::RerouteToTunnel);
    }

    #[test]
    fn packet_protocols_follow_the_firewall_verdict() {
        let mut conn =
            Connection::from_packet(&icmp_v4_packet_info("10.0.0.2", "1.1.1.1"));

        conn.set_firewall_verdict(Verdict::Accept);
        let active = conn.set_firewall_verdict(Verdict::Drop);

        assert_eq!(active, Verdict::Drop);

        let active = conn.set_firewall_verdict(Verdict::Accept);
        assert_eq!(active, Verdict::Accept);
    }

    #[test]
    fn unblocking_from_blocked_state_is_allowed() {
        let mut conn = tcp_conn();

        conn.set_firewall_verdict(Verdict::Block);
        let active = conn.set_firewall_verdict(Verdict::Accept);

        assert_eq!(active, Verdict::Accept);
        // The worst verdict keeps the block on record.
        assert_eq!(conn.verdict_worst(), Verdict::Block);
    }

    #[test]
    fn unresolved_verdicts_fold_by_direction() {
        let mut outbound = tcp_conn();
        assert_eq!(outbound.set_firewall_verdict(Verdict::Undecided), Verdict::Block);

        let mut info = tcp_v4_packet_info("203.0.113.9:51000", "10.0.0.2:22");
        info.inbound = true;
        let mut inbound = Connection::from_packet(&info);
        assert_eq!(inbound.set_firewall_verdict(Verdict::Undeterminable), Verdict::Drop);
    }

    #[test]
    fn worst_verdict_is_monotonic() {
        let mut conn = tcp_conn();

        conn.set_firewall_verdict(Verdict::Drop);
        conn.set_firewall_verdict(Verdict::Accept);

        assert_eq!(conn.verdict_worst(), Verdict::Drop);
    }

    #[test]
    fn dns_requests_are_born_ended() {
        let conn = Connection::from_dns_request(100, "Example.COM.", 1, Instant::now());

        assert!(conn.has_ended());
        assert_eq!(conn.id, "dns-100-example.com-1");
        assert_eq!(conn.scope, ConnScope::Domain("example.com".to_owned()));
        assert!(conn.save_when_finished);
    }

    #[test]
    fn local_scope_matches_local_ip() {
        let conn = tcp_conn();

        assert_eq!(
            conn.local_scope,
            IpScope::classify(conn.local_ip.unwrap())
        );
    }

    #[test]
    fn enqueue_without_worker_returns_packet() {
        use packet_info::testing::MockPacket;

        let mut conn = tcp_conn();
        let packet = Box::new(MockPacket::new(tcp_v4_packet_info(
            "10.0.0.2:44321",
            "1.1.1.1:443",
        )));

        assert!(conn.try_enqueue(packet).is_err());

        let mut rx = conn.set_packet_queue();
        let packet = Box::new(MockPacket::new(tcp_v4_packet_info(
            "10.0.0.2:44321",
            "1.1.1.1:443",
        )));
        assert!(conn.try_enqueue(packet).is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
