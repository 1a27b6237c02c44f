//! The per-packet pre-filter.
//!
//! Runs before a connection is created and emits verdicts for traffic that
//! must never depend on profiles: interceptor-permitted flows, DHCP, ICMP,
//! the API and queries to our own resolver. "Permanent" verdicts are handed
//! to the kernel so the flow stops consulting us.

use crate::config::Config;
use packet_info::{PacketInfo, TransportProtocol, is_blocked_destination};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::IpAddr;
use tokio::sync::mpsc;
use warden_model::{IpScope, Pid, Verdict};
use warden_network::DnsRequestIndex;

const DHCP_PORTS: [u16; 4] = [67, 68, 546, 547];
const DNS_PORT: u16 = 53;

/// What the fast-track gate decided for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastTrackDecision {
    Verdict {
        verdict: Verdict,
        permanent: bool,
        reason: &'static str,
    },
    /// Not special; the packet proceeds into the connection pipeline.
    Continue,
}

impl FastTrackDecision {
    fn accept(permanent: bool, reason: &'static str) -> Self {
        FastTrackDecision::Verdict {
            verdict: Verdict::Accept,
            permanent,
            reason,
        }
    }
}

/// Runtime registrations the fast-track rules consult.
///
/// The resolver and API layers publish their listen predicates here; the
/// network environment keeps the set of own local IPs current.
pub struct Registrations {
    pub own_pid: Pid,
    local_ips: RwLock<HashSet<IpAddr>>,
    nameserver_check: RwLock<Option<NameserverCheck>>,
    icmp_listener: Mutex<Option<mpsc::UnboundedSender<PacketInfo>>>,
    self_check: RwLock<Option<(u8, IpAddr)>>,
}

type NameserverCheck = Box<dyn Fn(IpAddr, u16) -> bool + Send + Sync>;

impl Registrations {
    pub fn new(own_pid: Pid) -> Self {
        Self {
            own_pid,
            local_ips: RwLock::default(),
            nameserver_check: RwLock::new(None),
            icmp_listener: Mutex::new(None),
            self_check: RwLock::new(None),
        }
    }

    pub fn set_local_ips(&self, ips: impl IntoIterator<Item = IpAddr>) {
        *self.local_ips.write() = ips.into_iter().collect();
    }

    /// Registers the resolver's "is this one of my listen addresses".
    pub fn set_nameserver_check(&self, check: NameserverCheck) {
        *self.nameserver_check.write() = Some(check);
    }

    /// Registers a listener that gets offered every ICMP packet, e.g. for
    /// traceroute tooling.
    pub fn set_icmp_listener(&self, listener: mpsc::UnboundedSender<PacketInfo>) {
        *self.icmp_listener.lock() = Some(listener);
    }

    /// Registers the OS-integration self-check flow (protocol +
    /// destination).
    pub fn set_self_check(&self, protocol: u8, destination: IpAddr) {
        *self.self_check.write() = Some((protocol, destination));
    }

    pub fn is_own_ip(&self, ip: IpAddr) -> bool {
        IpScope::classify(ip).is_localhost() || self.local_ips.read().contains(&ip)
    }

    fn is_own_nameserver(&self, ip: IpAddr, port: u16) -> bool {
        self.nameserver_check
            .read()
            .as_ref()
            .is_some_and(|check| check(ip, port))
    }

    fn offer_to_icmp_listener(&self, info: &PacketInfo) -> bool {
        let mut listener = self.icmp_listener.lock();

        match listener.as_ref() {
            Some(tx) => {
                if tx.send(info.clone()).is_err() {
                    *listener = None;
                    return false;
                }
                true
            }
            None => false,
        }
    }
}

/// Evaluates the fast-track rules in order; the first match wins.
///
/// Pure in the packet and the registration state, so re-applying it to the
/// same packet yields the same decision.
pub fn fast_track(
    info: &PacketInfo,
    regs: &Registrations,
    config: &Config,
    dns_index: &DnsRequestIndex,
) -> FastTrackDecision {
    // 1. The interceptor already permitted this flow in-kernel.
    if info.pre_permitted {
        return FastTrackDecision::accept(true, "pre-permitted by interceptor");
    }

    // 2. Kernel-blocked sentinel destination.
    if is_blocked_destination(info.dst) {
        return FastTrackDecision::Verdict {
            verdict: Verdict::Block,
            permanent: true,
            reason: "blocked destination sentinel",
        };
    }

    // 3. Network self-check: both ends are the same endpoint.
    if info.is_self_loop() {
        return FastTrackDecision::accept(true, "network self-check");
    }

    // 4. ICMP is offered to tracing listeners; only echo runs the pipeline.
    if info.protocol.is_icmp() {
        regs.offer_to_icmp_listener(info);

        if !info.is_icmp_echo() {
            return FastTrackDecision::accept(true, "non-echo ICMP");
        }

        return FastTrackDecision::Continue;
    }

    if info.protocol.has_ports() {
        // 5. DHCP within the local segment.
        let dst_scope = IpScope::classify(info.dst);
        if DHCP_PORTS.contains(&info.dst_port)
            && (dst_scope.is_localhost()
                || dst_scope.is_lan()
                || dst_scope == IpScope::GlobalMulticast)
        {
            return FastTrackDecision::accept(true, "DHCP");
        }

        // 6. Our own API.
        if info.protocol == TransportProtocol::Tcp
            && let Some(api) = config.api_listen_address
            && info.dst == api.ip()
            && info.dst_port == api.port()
            && regs.is_own_ip(info.src)
        {
            return FastTrackDecision::accept(true, "to own API");
        }

        // 7. DNS to our own resolver; also remember who asked so the
        // resolver can attribute the query without a socket lookup.
        if info.dst_port == DNS_PORT
            && regs.is_own_nameserver(info.dst, info.dst_port)
            && regs.is_own_ip(info.src)
        {
            if let Some(pid) = info.pid {
                dns_index.register_socket_hint(
                    info.protocol.ip_proto(),
                    info.src,
                    info.src_port,
                    pid,
                    info.seen,
                );
            }

            // Without the PID the flow must keep consulting us, the hint
            // is what makes future attribution work.
            return FastTrackDecision::accept(info.pid.is_some(), "to own resolver");
        }
    }

    // 8. OS-integration self-check flows are swallowed, transiently.
    if let Some((protocol, destination)) = *regs.self_check.read()
        && info.protocol.ip_proto() == protocol
        && info.dst == destination
    {
        return FastTrackDecision::Verdict {
            verdict: Verdict::Drop,
            permanent: false,
            reason: "OS-integration self-check",
        };
    }

    FastTrackDecision::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_info::testing::{icmp_v4_packet_info, packet_info, tcp_v4_packet_info, udp_v4_packet_info};
    use test_case::test_case;

    fn setup() -> (Registrations, Config, DnsRequestIndex) {
        let regs = Registrations::new(4200);
        regs.set_local_ips(["10.0.0.2".parse().unwrap()]);

        let config = Config {
            api_listen_address: Some("127.0.0.1:817".parse().unwrap()),
            ..Config::default()
        };

        (regs, config, DnsRequestIndex::default())
    }

    fn decide(info: &PacketInfo) -> FastTrackDecision {
        let (regs, config, index) = setup();
        fast_track(info, &regs, &config, &index)
    }

    #[test]
    fn pre_permitted_packets_pass_permanently() {
        let mut info = tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443");
        info.pre_permitted = true;

        assert_eq!(
            decide(&info),
            FastTrackDecision::Verdict {
                verdict: Verdict::Accept,
                permanent: true,
                reason: "pre-permitted by interceptor"
            }
        );
    }

    #[test]
    fn blocked_sentinel_destination_is_blocked() {
        let info = tcp_v4_packet_info("10.0.0.2:44321", "0.0.0.17:443");

        let FastTrackDecision::Verdict { verdict, permanent, .. } = decide(&info) else {
            panic!("expected a verdict");
        };

        assert_eq!(verdict, Verdict::Block);
        assert!(permanent);
    }

    #[test]
    fn self_loop_is_accepted() {
        let info = tcp_v4_packet_info("10.0.0.2:5000", "10.0.0.2:5000");

        assert!(matches!(
            decide(&info),
            FastTrackDecision::Verdict { verdict: Verdict::Accept, permanent: true, .. }
        ));
    }

    #[test_case("255.255.255.255:67"; "v4 broadcast")]
    #[test_case("192.168.1.1:67"; "lan dhcp server")]
    #[test_case("224.0.0.1:68"; "multicast")]
    fn dhcp_is_fast_tracked(dst: &str) {
        let info = udp_v4_packet_info("0.0.0.0:68", dst);

        assert!(matches!(
            decide(&info),
            FastTrackDecision::Verdict { verdict: Verdict::Accept, permanent: true, .. }
        ));
    }

    #[test]
    fn dhcp_to_global_unicast_is_not() {
        let info = udp_v4_packet_info("10.0.0.2:68", "1.2.3.4:67");

        assert_eq!(decide(&info), FastTrackDecision::Continue);
    }

    #[test]
    fn non_echo_icmp_is_accepted_echo_continues() {
        let mut info = icmp_v4_packet_info("10.0.0.2", "1.1.1.1");

        info.icmp_type = Some(3); // destination unreachable
        assert!(matches!(
            decide(&info),
            FastTrackDecision::Verdict { verdict: Verdict::Accept, permanent: true, .. }
        ));

        info.icmp_type = Some(8); // echo request
        assert_eq!(decide(&info), FastTrackDecision::Continue);
    }

    #[test]
    fn icmp_is_offered_to_listener() {
        let (regs, config, index) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        regs.set_icmp_listener(tx);

        let info = icmp_v4_packet_info("10.0.0.2", "1.1.1.1");
        fast_track(&info, &regs, &config, &index);

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn api_access_from_own_ip_is_accepted() {
        let info = tcp_v4_packet_info("127.0.0.1:51000", "127.0.0.1:817");

        assert!(matches!(
            decide(&info),
            FastTrackDecision::Verdict { verdict: Verdict::Accept, permanent: true, .. }
        ));
    }

    #[test]
    fn dns_to_own_resolver_is_permanent_only_with_pid() {
        let (regs, config, index) = setup();
        regs.set_nameserver_check(Box::new(|ip, _| ip == "127.0.0.1".parse::<IpAddr>().unwrap()));

        let mut info = udp_v4_packet_info("127.0.0.1:54321", "127.0.0.1:53");

        let FastTrackDecision::Verdict { verdict, permanent, .. } =
            fast_track(&info, &regs, &config, &index)
        else {
            panic!("expected a verdict");
        };
        assert_eq!(verdict, Verdict::Accept);
        assert!(!permanent);
        assert_eq!(index.pid_for_socket(17, info.src, info.src_port), None);

        info.pid = Some(123);
        let FastTrackDecision::Verdict { permanent, .. } =
            fast_track(&info, &regs, &config, &index)
        else {
            panic!("expected a verdict");
        };
        assert!(permanent);
        assert_eq!(index.pid_for_socket(17, info.src, info.src_port), Some(123));
    }

    #[test]
    fn self_check_flow_is_dropped_transiently() {
        let (regs, config, index) = setup();
        regs.set_self_check(17, "10.255.255.1".parse().unwrap());

        let info = udp_v4_packet_info("10.0.0.2:40000", "10.255.255.1:7");

        assert_eq!(
            fast_track(&info, &regs, &config, &index),
            FastTrackDecision::Verdict {
                verdict: Verdict::Drop,
                permanent: false,
                reason: "OS-integration self-check"
            }
        );
    }

    #[test]
    fn fast_track_is_idempotent() {
        let (regs, config, index) = setup();
        let info = udp_v4_packet_info("0.0.0.0:68", "255.255.255.255:67");

        let first = fast_track(&info, &regs, &config, &index);
        let second = fast_track(&info, &regs, &config, &index);

        assert_eq!(first, second);
    }

    #[test]
    fn ordinary_traffic_continues() {
        let info = tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443");

        assert_eq!(decide(&info), FastTrackDecision::Continue);
    }

    #[test]
    fn packet_info_ctor_for_other_protocols() {
        let info = packet_info(TransportProtocol::Other(132), "10.0.0.2:0", "1.1.1.1:0");

        assert_eq!(decide(&info), FastTrackDecision::Continue);
    }
}
