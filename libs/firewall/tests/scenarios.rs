//! End-to-end scenarios against a running firewall: packets go in through
//! the interceptor channel, verdicts come out on the packets.

use dns_records::{QueryInfo, RRCache, RecordType, ResolverInfo, record, records};
use packet_info::testing::{MockPacket, tcp_v4_packet_info, udp_v4_packet_info};
use packet_info::{BandwidthUpdate, FragmentMeta, Packet, PacketInfo, TcpSegmentMeta};
use parking_lot::Mutex;
use socket_table::testing::FakeSource;
use socket_table::SocketTables;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warden_firewall::{
    Config, Firewall, FirewallBuilder, Inspector, InspectorFactory, Notifier, PromptAction,
    PromptRequest, ResetEvent,
};
use warden_model::{Pid, ProfileId, Verdict};
use warden_network::Connection;
use warden_profile::{DefaultAction, LayeredProfile, Process, ProcessStore, Profile};

const OWN_PID: Pid = 4200;
const CURL_PID: Pid = 100;

struct TestProcesses {
    processes: Mutex<HashMap<Pid, Arc<Process>>>,
}

impl TestProcesses {
    fn with_curl(profile: Profile) -> Self {
        let curl = Arc::new(Process {
            pid: CURL_PID,
            name: "curl".to_owned(),
            exec_path: "/usr/bin/curl".into(),
            profile: LayeredProfile::new(ProfileId::local("curl"), profile),
        });

        Self {
            processes: Mutex::new(HashMap::from([(CURL_PID, curl)])),
        }
    }
}

impl ProcessStore for TestProcesses {
    fn get_or_find_process(&self, pid: Pid) -> anyhow::Result<Arc<Process>> {
        self.processes
            .lock()
            .get(&pid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such process {pid}"))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    requests: Mutex<Vec<PromptRequest>>,
}

struct SharedNotifier(Arc<RecordingNotifier>);

impl Notifier for SharedNotifier {
    fn notify(&self, request: PromptRequest) {
        self.0.requests.lock().push(request);
    }
}

struct Harness {
    firewall: Firewall,
    packets: mpsc::Sender<Box<dyn Packet>>,
    bandwidth: mpsc::Sender<BandwidthUpdate>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(profile: Profile) -> Harness {
    let source = FakeSource::default()
        .with_tcp4_connection("10.0.0.2:44321", "104.16.132.229:443", 1000, 77, Some(CURL_PID))
        .with_tcp4_connection("10.0.0.2:44322", "1.1.1.1:443", 1000, 78, Some(CURL_PID))
        .with_udp4_bind("0.0.0.0:54321", 1000, 79, Some(CURL_PID))
        .with_tcp4_listener("0.0.0.0:8080", 1000, 80, Some(CURL_PID));

    let sockets = Arc::new(SocketTables::new(Arc::new(source)));
    let processes = Arc::new(TestProcesses::with_curl(profile));
    let notifier = Arc::new(RecordingNotifier::default());

    let (packet_tx, packet_rx) = mpsc::channel(64);
    let (bandwidth_tx, bandwidth_rx) = mpsc::channel(64);

    let firewall = FirewallBuilder::new(sockets, processes)
        .with_config(Config::default())
        .with_notifier(Box::new(SharedNotifier(notifier.clone())))
        .with_own_pid(OWN_PID)
        .spawn(packet_rx, bandwidth_rx);

    Harness {
        firewall,
        packets: packet_tx,
        bandwidth: bandwidth_tx,
        notifier,
    }
}

async fn send(harness: &Harness, info: PacketInfo) -> Arc<MockPacket> {
    send_packet(harness, MockPacket::new(info)).await
}

async fn send_packet(harness: &Harness, packet: MockPacket) -> Arc<MockPacket> {
    let packet = Arc::new(packet);

    harness
        .packets
        .send(Box::new(packet.clone()))
        .await
        .expect("packet channel open");

    packet
}

async fn wait_for_verdict(packet: &Arc<MockPacket>) -> (Verdict, bool) {
    for _ in 0..500 {
        if let Some(applied) = packet.last_applied() {
            return applied;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("no verdict was applied");
}

#[tokio::test(start_paused = true)]
async fn dhcp_is_fast_tracked_without_a_connection() {
    let harness = harness(Profile::standard());

    let packet = send(&harness, udp_v4_packet_info("0.0.0.0:68", "255.255.255.255:67")).await;

    assert_eq!(wait_for_verdict(&packet).await, (Verdict::Accept, true));
    // Fast-tracked packets never reach the pipeline, so no connection is
    // saved.
    assert!(harness.firewall.query("network:tree").is_none_or(|tree| tree == serde_json::json!({})));
}

#[tokio::test(start_paused = true)]
async fn permitted_flow_is_accepted_permanently() {
    let harness = harness(Profile::standard());

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;

    assert_eq!(wait_for_verdict(&packet).await, (Verdict::Accept, true));
}

#[tokio::test(start_paused = true)]
async fn blocked_scope_blocks_the_whole_stream() {
    let harness = harness(Profile {
        block_scope_internet: true,
        ..Profile::standard()
    });

    let first = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;
    assert_eq!(wait_for_verdict(&first).await.0, Verdict::Block);

    let second = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;
    assert_eq!(wait_for_verdict(&second).await.0, Verdict::Block);
}

#[tokio::test(start_paused = true)]
async fn unmatched_inbound_connection_is_dropped_by_default() {
    let harness = harness(Profile::standard());

    let mut info = tcp_v4_packet_info("203.0.113.9:51000", "10.0.0.2:8080");
    info.inbound = true;
    let packet = send(&harness, info).await;

    assert_eq!(wait_for_verdict(&packet).await.0, Verdict::Drop);

    let tree = harness
        .firewall
        .query(&format!("network:tree/{CURL_PID}/incoming-internet"))
        .expect("connection listed");
    assert_eq!(tree.as_array().expect("connections").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn icmp_echo_without_attribution_follows_the_default_action() {
    let harness = harness(Profile::standard());

    let packet = send(
        &harness,
        packet_info::testing::icmp_v4_packet_info("10.0.0.2", "1.1.1.1"),
    )
    .await;

    // No socket table covers ICMP; the flow is attributed to the
    // unidentified process, whose standard profile permits by default.
    assert_eq!(wait_for_verdict(&packet).await.0, Verdict::Accept);
}

#[tokio::test(start_paused = true)]
async fn connection_is_visible_via_the_query_surface() {
    let harness = harness(Profile::standard());

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;
    wait_for_verdict(&packet).await;

    let tree = harness
        .firewall
        .query(&format!("network:tree/{CURL_PID}/peer-internet"))
        .expect("connection listed");
    let conns = tree.as_array().expect("array of connections");

    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0]["verdict"]["active"], "accept");
    assert_eq!(conns[0]["pid"], CURL_PID);

    let state = harness.firewall.query("network:system/state").expect("system state");
    assert_eq!(state["active_connections"], 1);
}

#[tokio::test(start_paused = true)]
async fn ask_profile_prompts_and_drops_during_grace() {
    let harness = harness(Profile {
        default_action: DefaultAction::Ask,
        disable_auto_permit: true,
        ..Profile::standard()
    });

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44322", "1.1.1.1:443")).await;

    // The grace period expires without an answer; the packet is dropped
    // but the prompt notification stays up.
    assert_eq!(wait_for_verdict(&packet).await.0, Verdict::Drop);
    assert_eq!(harness.notifier.requests.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn prompt_answer_persists_a_rule_and_reevaluates() {
    let harness = harness(Profile {
        default_action: DefaultAction::Ask,
        disable_auto_permit: true,
        ..Profile::standard()
    });

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44322", "1.1.1.1:443")).await;
    assert_eq!(wait_for_verdict(&packet).await.0, Verdict::Drop);

    let prompt_id = harness.notifier.requests.lock()[0].id.clone();
    harness.firewall.resolve_prompt(&prompt_id, PromptAction::PermitIp);

    // The persisted rule triggers a profile reset; the next evaluation
    // accepts. Give the reset worker a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tree = harness
        .firewall
        .query(&format!("network:tree/{CURL_PID}/peer-internet"))
        .expect("connection listed");

    assert_eq!(tree.as_array().expect("connections")[0]["verdict"]["active"], "accept");
}

#[tokio::test(start_paused = true)]
async fn canary_dns_query_is_blocked_with_bypass_reason() {
    let harness = harness(Profile {
        prevent_bypassing: true,
        ..Profile::standard()
    });

    let (verdict, reason) = harness
        .firewall
        .decide_dns_query(&QueryInfo {
            fqdn: "use-application-dns.net".parse().unwrap(),
            qtype: RecordType::A,
            pid: CURL_PID,
        })
        .await;

    assert_eq!(verdict, Verdict::Block);
    assert!(reason.message.contains("canary"), "reason: {}", reason.message);
}

#[tokio::test(start_paused = true)]
async fn dga_dns_query_is_blocked() {
    let harness = harness(Profile {
        domain_heuristics: true,
        ..Profile::standard()
    });

    let (verdict, reason) = harness
        .firewall
        .decide_dns_query(&QueryInfo {
            fqdn: "xzqwvbntrlkmfj.example".parse().unwrap(),
            qtype: RecordType::A,
            pid: CURL_PID,
        })
        .await;

    assert_eq!(verdict, Verdict::Block);
    assert!(reason.message.contains("possible DGA domain"));
}

#[tokio::test(start_paused = true)]
async fn related_domain_is_auto_permitted() {
    let harness = harness(Profile {
        default_action: DefaultAction::Ask,
        ..Profile::standard()
    });

    let (verdict, reason) = harness
        .firewall
        .decide_dns_query(&QueryInfo {
            fqdn: "curl.example.com".parse().unwrap(),
            qtype: RecordType::A,
            pid: CURL_PID,
        })
        .await;

    assert_eq!(verdict, Verdict::Accept);
    assert!(reason.message.contains("curl"));
    // No prompt was needed.
    assert!(harness.notifier.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn split_view_answer_blocks_the_dns_request() {
    let harness = harness(Profile::standard());

    let query = QueryInfo {
        fqdn: "foo.example".parse().unwrap(),
        qtype: RecordType::A,
        pid: CURL_PID,
    };

    let (verdict, _) = harness.firewall.decide_dns_query(&query).await;
    assert_eq!(verdict, Verdict::Accept);

    let conn = harness
        .firewall
        .dns_request_connection(CURL_PID, "foo.example", RecordType::A.to_int())
        .expect("pending DNS request");

    // A global resolver returning a private address is a split-view
    // answer; with nothing left, the response is withheld.
    let rr = RRCache::new(
        "foo.example".parse().unwrap(),
        RecordType::A,
        ResolverInfo::new("9.9.9.9".parse().unwrap(), 53),
    )
    .with_answer([record(
        "foo.example".parse().unwrap(),
        60,
        records::a("192.168.1.10".parse().unwrap()),
    )]);

    let filtered = harness.firewall.filter_resolved_dns(&conn, rr);

    assert!(filtered.is_none());
    assert_eq!(conn.lock().verdict_active(), Verdict::Block);
}

#[tokio::test(start_paused = true)]
async fn bandwidth_updates_reach_the_connection() {
    let harness = harness(Profile::standard());

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;
    wait_for_verdict(&packet).await;

    let conn_id = packet.info().connection_id();
    harness
        .bandwidth
        .send(BandwidthUpdate {
            conn_id,
            bytes_received: 1000,
            bytes_sent: 200,
        })
        .await
        .expect("bandwidth channel open");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let tree = harness
        .firewall
        .query(&format!("network:tree/{CURL_PID}/peer-internet"))
        .expect("connection listed");

    assert_eq!(tree.as_array().expect("connections")[0]["bytes_received"], 1000);
}

#[tokio::test(start_paused = true)]
async fn config_reset_reevaluates_connections() {
    let harness = harness(Profile::standard());

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;
    assert_eq!(wait_for_verdict(&packet).await.0, Verdict::Accept);

    // Tighten the profile and poke the reset coordinator.
    harness
        .firewall
        .ctx()
        .processes
        .get_or_find_process(CURL_PID)
        .unwrap()
        .profile
        .set_profile(Profile {
            block_scope_internet: true,
            ..Profile::standard()
        });
    harness.firewall.emit(ResetEvent::ProfileChanged(ProfileId::local("curl")));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let tree = harness
        .firewall
        .query(&format!("network:tree/{CURL_PID}/peer-internet"))
        .expect("connection listed");

    assert_eq!(tree.as_array().expect("connections")[0]["verdict"]["active"], "block");
}

#[tokio::test(start_paused = true)]
async fn disabled_filter_accepts_everything() {
    let harness = harness(Profile::standard());
    harness.firewall.ctx().config.update(|c| c.filter_enabled = false);

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44399", "203.0.113.50:4444")).await;

    assert_eq!(wait_for_verdict(&packet).await.0, Verdict::Accept);
}

/// Collects the payload data handed to the inspection framework.
struct PayloadRecorder {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl Inspector for PayloadRecorder {
    fn name(&self) -> &'static str {
        "payload-recorder"
    }

    fn inspect_stream(&mut self, _conn: &Connection, data: &[u8], _inbound: bool) -> Verdict {
        self.seen.lock().extend_from_slice(data);
        Verdict::Undecided
    }

    fn inspect_datagram(&mut self, _conn: &Connection, data: &[u8], _inbound: bool) -> Verdict {
        self.seen.lock().extend_from_slice(data);
        Verdict::Undecided
    }
}

struct PayloadRecorderFactory {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl InspectorFactory for PayloadRecorderFactory {
    fn name(&self) -> &'static str {
        "payload-recorder"
    }

    fn create(&self, _conn: &Connection) -> Option<Box<dyn Inspector>> {
        Some(Box::new(PayloadRecorder {
            seen: self.seen.clone(),
        }))
    }
}

fn record_payloads(harness: &Harness) -> Arc<Mutex<Vec<u8>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));

    harness
        .firewall
        .ctx()
        .inspection
        .register(Arc::new(PayloadRecorderFactory { seen: seen.clone() }));

    seen
}

#[tokio::test(start_paused = true)]
async fn out_of_order_tcp_segments_reach_inspectors_in_stream_order() {
    let harness = harness(Profile::standard());
    let seen = record_payloads(&harness);

    let segment = |seq: u32, payload: &[u8]| {
        let mut info = tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443");
        info.tcp = Some(TcpSegmentMeta { seq, syn: false, fin: false });
        MockPacket::new(info).with_payload(payload.to_vec())
    };

    let first = send_packet(&harness, segment(1000, b"hello ")).await;
    wait_for_verdict(&first).await;
    assert_eq!(seen.lock().as_slice(), b"hello ");

    // A gap holds the later segment back from the inspectors.
    let late = send_packet(&harness, segment(1012, b"world")).await;
    wait_for_verdict(&late).await;
    assert_eq!(seen.lock().as_slice(), b"hello ");

    // The filler releases both in stream order.
    let filler = send_packet(&harness, segment(1006, b"there ")).await;
    wait_for_verdict(&filler).await;
    assert_eq!(seen.lock().as_slice(), b"hello there world");
}

#[tokio::test(start_paused = true)]
async fn split_ipv4_fragments_reach_inspectors_as_one_datagram() {
    let harness = harness(Profile::standard());
    let seen = record_payloads(&harness);

    // One UDP datagram (8-byte header plus payload), split in two.
    let payload = b"fragmented dns payload";
    let mut datagram = vec![0xd4, 0x31, 0x00, 0x35];
    datagram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    let (head, tail) = datagram.split_at(16);

    let fragment = |offset: u16, more: bool, chunk: &[u8]| {
        let mut info = udp_v4_packet_info("10.0.0.2:54321", "1.1.1.1:53");
        info.fragment = Some(FragmentMeta {
            ident: 21,
            offset,
            more_fragments: more,
        });
        MockPacket::new(info).with_payload(chunk.to_vec())
    };

    let first = send_packet(&harness, fragment(0, true, head)).await;
    wait_for_verdict(&first).await;
    assert!(seen.lock().is_empty());

    let second = send_packet(&harness, fragment(16, false, tail)).await;
    wait_for_verdict(&second).await;
    assert_eq!(seen.lock().as_slice(), payload);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_all_workers() {
    let harness = harness(Profile::standard());

    let packet = send(&harness, tcp_v4_packet_info("10.0.0.2:44321", "104.16.132.229:443")).await;
    wait_for_verdict(&packet).await;

    harness.firewall.shut_down().await;
}
