//! The per-packet decision engine.
//!
//! [`Firewall`] wires the packet intake, the connection pipeline (fast
//! track → gather → deciders → verdict application), DNS filtering and the
//! maintenance workers together. External collaborators (the interceptor,
//! the process/profile store, the resolver, notifications) are attached
//! through the narrow traits re-exported here.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod apply;
mod bypass;
mod config;
mod deciders;
mod dns_filter;
mod fast_track;
mod gather;
mod heuristics;
mod inspect;
mod intake;
mod intel;
mod prompt;
mod reassembly;
mod reset;
mod tunnel;

pub use apply::{NoKernelVerdicts, VerdictUpdater};
pub use bypass::DOH_CANARY_DOMAIN;
pub use config::{Config, ConfigHandle, key as config_key};
pub use fast_track::{FastTrackDecision, Registrations, fast_track};
pub use inspect::{ActiveInspectors, InspectionRegistry, Inspector, InspectorFactory};
pub use intel::{FilterListIndex, NetworkStateHandle, NoLists, StaticLists};
pub use prompt::{NoNotifier, Notifier, PromptAction, PromptDispatcher, PromptRequest};
pub use reset::ResetEvent;
pub use tunnel::{NoTunnel, TunnelController};

use deciders::{DeciderCtx, PipelineOutcome};
use dns_records::{QueryInfo, RRCache};
use packet_info::{BandwidthUpdate, ConnectionId, IpVersion, Packet, PacketInfo};
use parking_lot::Mutex;
use socket_table::SocketTables;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_model::{Pid, Verdict};
use warden_network::{Connection, ConnectionStore, DnsRequestIndex, IpInfoStore, Reason, clean};
use warden_profile::ProcessStore;

/// Cadence of the cleaner worker.
const CLEANER_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the stat logger (only spawned with trace logging).
const STAT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Everything the workers share.
pub struct FirewallCtx {
    pub config: ConfigHandle,
    pub store: Arc<ConnectionStore>,
    pub dns_index: Arc<DnsRequestIndex>,
    pub ip_info: Arc<IpInfoStore>,
    pub sockets: Arc<SocketTables>,
    pub processes: Arc<dyn ProcessStore>,
    pub prompts: Arc<PromptDispatcher>,
    pub intel: Arc<dyn FilterListIndex>,
    pub inspection: Arc<InspectionRegistry>,
    pub verdicts: Arc<dyn VerdictUpdater>,
    pub regs: Registrations,
    pub net_state: NetworkStateHandle,
    pub(crate) cancel: CancellationToken,
    reset_tx: broadcast::Sender<ResetEvent>,
}

impl FirewallCtx {
    pub(crate) fn decider_ctx(&self) -> DeciderCtx<'_> {
        DeciderCtx {
            own_pid: self.regs.own_pid,
            sockets: Some(&self.sockets),
            network_state: self.net_state.current(),
            intel: self.intel.as_ref(),
        }
    }
}

/// Builds a [`Firewall`] with defaults for the optional collaborators.
pub struct FirewallBuilder {
    config: Config,
    sockets: Arc<SocketTables>,
    processes: Arc<dyn ProcessStore>,
    notifier: Box<dyn Notifier>,
    intel: Arc<dyn FilterListIndex>,
    verdicts: Arc<dyn VerdictUpdater>,
    tunnel: Arc<dyn TunnelController>,
    own_pid: Pid,
}

impl FirewallBuilder {
    pub fn new(sockets: Arc<SocketTables>, processes: Arc<dyn ProcessStore>) -> Self {
        Self {
            config: Config::default(),
            sockets,
            processes,
            notifier: Box::new(NoNotifier),
            intel: Arc::new(NoLists),
            verdicts: Arc::new(NoKernelVerdicts),
            tunnel: Arc::new(NoTunnel),
            own_pid: std::process::id() as Pid,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_intel(mut self, intel: Arc<dyn FilterListIndex>) -> Self {
        self.intel = intel;
        self
    }

    pub fn with_verdict_updater(mut self, verdicts: Arc<dyn VerdictUpdater>) -> Self {
        self.verdicts = verdicts;
        self
    }

    pub fn with_tunnel(mut self, tunnel: Arc<dyn TunnelController>) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Overrides the own-PID detection, e.g. in tests.
    pub fn with_own_pid(mut self, pid: Pid) -> Self {
        self.own_pid = pid;
        self
    }

    /// Spawns all service workers and returns the running firewall.
    pub fn spawn(
        self,
        packet_rx: mpsc::Receiver<Box<dyn Packet>>,
        bandwidth_rx: mpsc::Receiver<BandwidthUpdate>,
    ) -> Firewall {
        let cancel = CancellationToken::new();
        let (reset_tx, _) = broadcast::channel(64);

        let prompts = Arc::new(PromptDispatcher::new(self.notifier, reset_tx.clone()));

        let ctx = Arc::new(FirewallCtx {
            config: ConfigHandle::new(self.config),
            store: Arc::new(ConnectionStore::new()),
            dns_index: Arc::new(DnsRequestIndex::default()),
            ip_info: Arc::new(IpInfoStore::default()),
            sockets: self.sockets,
            processes: self.processes,
            prompts,
            intel: self.intel,
            inspection: Arc::new(InspectionRegistry::default()),
            verdicts: self.verdicts,
            regs: Registrations::new(self.own_pid),
            net_state: NetworkStateHandle::default(),
            cancel: cancel.clone(),
            reset_tx,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(intake::packet_worker(ctx.clone(), packet_rx)));
        tasks.push(tokio::spawn(intake::bandwidth_worker(ctx.clone(), bandwidth_rx)));
        tasks.push(tokio::spawn(cleaner_worker(ctx.clone())));
        tasks.push(tokio::spawn(reset_worker(ctx.clone())));

        if tracing::enabled!(tracing::Level::TRACE) {
            tasks.push(tokio::spawn(stat_logger(ctx.clone())));
        }

        Firewall {
            ctx,
            tunnel: self.tunnel,
            tasks: Mutex::new(tasks),
        }
    }
}

/// The running firewall core.
pub struct Firewall {
    ctx: Arc<FirewallCtx>,
    tunnel: Arc<dyn TunnelController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Firewall {
    pub fn ctx(&self) -> &Arc<FirewallCtx> {
        &self.ctx
    }

    pub fn tunnel(&self) -> &Arc<dyn TunnelController> {
        &self.tunnel
    }

    /// Triggers re-evaluation of the affected connections.
    pub fn emit(&self, event: ResetEvent) {
        let _ = self.ctx.reset_tx.send(event);
    }

    /// Delivers a user's answer to a prompt.
    pub fn resolve_prompt(&self, prompt_id: &str, action: PromptAction) {
        self.ctx.prompts.resolve(prompt_id, action);
    }

    /// Read-only query surface, e.g. `network:tree/<pid>/<scope>`.
    pub fn query(&self, key: &str) -> Option<serde_json::Value> {
        warden_network::query(&self.ctx.store, key)
    }

    /// Decides on a DNS query before it is resolved.
    ///
    /// Creates the DNS request connection, runs it through the pipeline and
    /// registers it for follow-up attribution. The resolver answers
    /// NXDOMAIN for anything non-allowing.
    pub async fn decide_dns_query(&self, query: &QueryInfo) -> (Verdict, Reason) {
        let now = Instant::now();
        let fqdn = query.fqdn.to_string();
        let mut conn =
            Connection::from_dns_request(query.pid, &fqdn, query.qtype.to_int(), now);

        match self.ctx.processes.get_or_find_process(query.pid) {
            Ok(process) => conn.set_process(process),
            Err(e) => {
                tracing::debug!(pid = %query.pid, "No process for DNS query: {e:#}");
                conn.set_process(self.ctx.processes.unidentified_process(false));
            }
        }
        conn.mark_data_complete();

        let outcome = deciders::run(&self.ctx.decider_ctx(), &mut conn);

        let shared = Arc::new(Mutex::new(conn));

        if outcome == PipelineOutcome::NeedsPrompt {
            let ticket = {
                let conn = shared.lock();
                let timeout = self.ctx.config.current().prompt_timeout;
                self.ctx.prompts.begin(&conn, timeout)
            };

            let (verdict, reason) = self.ctx.prompts.wait(ticket, &self.ctx.cancel).await;
            shared.lock().set_verdict(verdict, reason);
        }

        self.ctx.dns_index.register_request(
            query.pid,
            &fqdn,
            query.qtype.to_int(),
            shared.clone(),
            now,
        );

        let conn = shared.lock();
        (conn.verdict_active(), conn.reason.clone())
    }

    /// Filters a resolved DNS response for the request connection.
    ///
    /// `None` means the response is withheld entirely (the connection then
    /// carries verdict and reason).
    pub fn filter_resolved_dns(
        &self,
        shared: &warden_network::SharedConnection,
        rr: RRCache,
    ) -> Option<RRCache> {
        let mut conn = shared.lock();

        let Some(process) = conn.process() else {
            return Some(rr);
        };

        let layered = process.profile.clone();
        let profile = layered.read();

        dns_filter::filter_resolved_dns(
            &mut conn,
            &profile,
            rr,
            self.ctx.intel.as_ref(),
            self.ctx.regs.own_pid,
        )
    }

    /// Publishes surviving records for reverse attribution.
    pub fn update_ips_and_cnames(&self, rr: &RRCache, shared: &warden_network::SharedConnection) {
        dns_filter::update_ips_and_cnames(rr, &shared.lock(), &self.ctx.ip_info);
    }

    /// The pending DNS request connection for a query, if any.
    pub fn dns_request_connection(
        &self,
        pid: Pid,
        fqdn: &str,
        qtype: u16,
    ) -> Option<warden_network::SharedConnection> {
        self.ctx.dns_index.take_request(pid, fqdn, qtype)
    }

    /// Stops all workers and waits for them to finish.
    pub async fn shut_down(self) {
        tracing::info!("Initiating graceful shutdown");

        self.ctx.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Worker ended abnormally: {e}");
            }
        }
    }
}

/// Ends stale connections, deletes old ones and compacts the caches.
async fn cleaner_worker(ctx: Arc<FirewallCtx>) {
    let mut interval = tokio::time::interval(CLEANER_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let now = Instant::now();

        let stats = clean::clean(&ctx.store, now, |flow| flow_has_socket(&ctx.sockets, flow, now));

        if stats.ended + stats.deleted > 0 {
            tracing::debug!(ended = %stats.ended, deleted = %stats.deleted, "Cleaned connections");
        }

        // Unanswered DNS requests become history entries.
        for expired in ctx.dns_index.flush_expired(now) {
            expired.lock().mark_data_complete();
            ctx.store.add_shared(expired);
        }

        ctx.sockets.shrink_udp_states(now);
        ctx.ip_info.prune(chrono::Utc::now().timestamp());
    }
}

fn flow_has_socket(sockets: &SocketTables, flow: &ConnectionId, now: Instant) -> bool {
    let protocol = flow.transport();

    if !protocol.has_ports() {
        // No OS table to consult; idle aging handles these.
        return true;
    }

    let (src, src_port, dst, dst_port) = if flow.inbound {
        (flow.remote_ip, flow.remote_port, flow.local_ip, flow.local_port)
    } else {
        (flow.local_ip, flow.local_port, flow.remote_ip, flow.remote_port)
    };

    let info = PacketInfo {
        inbound: flow.inbound,
        version: if flow.local_ip.is_ipv4() { IpVersion::V4 } else { IpVersion::V6 },
        protocol,
        src,
        src_port,
        dst,
        dst_port,
        pid: None,
        icmp_type: None,
        tcp: None,
        fragment: None,
        seen: now,
        info_only: true,
        pre_permitted: false,
    };

    sockets.has_socket(&info, now)
}

/// Subscribes to reset triggers and re-evaluates affected connections.
async fn reset_worker(ctx: Arc<FirewallCtx>) {
    let mut events = ctx.reset_tx.subscribe();
    let mut config_rx = ctx.config.subscribe();

    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            changed = config_rx.changed() => match changed {
                Ok(()) => ResetEvent::ConfigChanged,
                Err(_) => return,
            },
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(%missed, "Reset events lagged, re-evaluating everything");
                    ResetEvent::ConfigChanged
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        tracing::debug!(?event, "Re-evaluating connections");

        let timeout = ctx.config.current().prompt_timeout;

        for shared in reset::affected_connections(&ctx.store, &event) {
            reset::re_evaluate(
                &ctx.decider_ctx(),
                &ctx.prompts,
                ctx.verdicts.as_ref(),
                timeout,
                &ctx.cancel,
                &shared,
            )
            .await;
        }
    }
}

/// Logs store and queue statistics while trace logging is active.
async fn stat_logger(ctx: Arc<FirewallCtx>) {
    let mut interval = tokio::time::interval(STAT_LOG_INTERVAL);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        tracing::trace!(
            connections = %ctx.store.len(),
            open_dns_requests = %ctx.dns_index.len(),
            ip_infos = %ctx.ip_info.len(),
            "Core statistics"
        );
    }
}
