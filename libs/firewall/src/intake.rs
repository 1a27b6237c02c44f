//! Packet intake and the per-connection workers.
//!
//! The service worker drains the interceptor channel: packets of known
//! connections are enqueued on the connection's own bounded queue, new
//! flows run the fast-track gate and, if nothing fast-tracks them, get a
//! connection and a dedicated worker. All decision work for one flow is
//! serialized on that worker.

use crate::deciders::{self, PipelineOutcome};
use crate::fast_track::{FastTrackDecision, fast_track};
use crate::gather::{self, GatherDeps};
use crate::inspect::ActiveInspectors;
use crate::reassembly::{InspectData, PayloadPipeline};
use crate::{FirewallCtx, apply};
use packet_info::{BandwidthUpdate, Packet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use warden_network::{Connection, SharedConnection};

/// The service worker consuming the interceptor's packet channel.
pub(crate) async fn packet_worker(ctx: Arc<FirewallCtx>, mut rx: mpsc::Receiver<Box<dyn Packet>>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            packet = rx.recv() => match packet {
                Some(packet) => handle_packet(&ctx, packet).await,
                None => {
                    tracing::info!("Interceptor packet channel closed");
                    return;
                }
            }
        }
    }
}

/// The service worker folding bandwidth updates into connections.
pub(crate) async fn bandwidth_worker(
    ctx: Arc<FirewallCtx>,
    mut rx: mpsc::Receiver<BandwidthUpdate>,
) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            update = rx.recv() => match update {
                Some(update) => {
                    if let Some(shared) = ctx.store.get(&update.conn_id) {
                        shared
                            .lock()
                            .add_bandwidth(update.bytes_received, update.bytes_sent);
                    }
                }
                None => return,
            }
        }
    }
}

async fn handle_packet(ctx: &Arc<FirewallCtx>, packet: Box<dyn Packet>) {
    let info = packet.info().clone();
    let config = ctx.config.current();

    if !config.filter_enabled && !info.info_only {
        if let Err(e) = packet.accept(false) {
            tracing::warn!(packet = ?info, "Failed to accept packet: {e:#}");
        }
        return;
    }

    let conn_id = info.connection_id();

    if let Some(shared) = ctx.store.get(&conn_id) {
        let mut conn = shared.lock();
        conn.touch(info.seen);

        if info.info_only {
            return;
        }

        match conn.try_enqueue(packet) {
            Ok(()) => {}
            Err(packet) => {
                // No worker (or a dead one): decided connections apply
                // their stored verdict, undecided ones get a fresh worker.
                if conn.verdict_active().is_decided() {
                    apply::apply_to_connection(&mut conn, &*packet, &config);
                } else {
                    let queue = conn.set_packet_queue();
                    let _ = conn.try_enqueue(packet);
                    drop(conn);

                    spawn_connection_worker(ctx, shared.clone(), queue);
                }
            }
        }
        return;
    }

    if info.info_only {
        // Metadata-only packets seed an (incomplete) connection and are
        // done; they never carry a verdict.
        ctx.store.add(Connection::from_packet(&info));
        return;
    }

    match fast_track(&info, &ctx.regs, &config, &ctx.dns_index) {
        FastTrackDecision::Verdict { verdict, permanent, reason } => {
            tracing::trace!(packet = ?info, %verdict, %permanent, %reason, "Fast-tracked packet");

            if let Err(e) = apply::apply_verdict(&*packet, verdict, permanent) {
                tracing::warn!(packet = ?info, %reason, "Failed to apply fast-track verdict: {e:#}");
            }
        }
        FastTrackDecision::Continue => {
            let shared = ctx.store.add(Connection::from_packet(&info));

            let queue = {
                let mut conn = shared.lock();
                let queue = conn.set_packet_queue();
                let _ = conn.try_enqueue(packet);
                queue
            };

            spawn_connection_worker(ctx, shared, queue);
        }
    }
}

fn spawn_connection_worker(
    ctx: &Arc<FirewallCtx>,
    shared: SharedConnection,
    queue: mpsc::Receiver<Box<dyn Packet>>,
) {
    tokio::spawn(connection_worker(ctx.clone(), shared, queue));
}

/// Per-worker state of the inspection framework.
#[derive(Default)]
struct Inspection {
    active: Option<ActiveInspectors>,
    payloads: PayloadPipeline,
}

/// Consumes one connection's packet queue sequentially.
async fn connection_worker(
    ctx: Arc<FirewallCtx>,
    shared: SharedConnection,
    mut queue: mpsc::Receiver<Box<dyn Packet>>,
) {
    let mut inspection = Inspection::default();

    loop {
        let packet = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        process_packet(&ctx, &shared, &mut inspection, packet).await;
    }

    shared.lock().clear_packet_queue();
}

async fn process_packet(
    ctx: &Arc<FirewallCtx>,
    shared: &SharedConnection,
    inspection: &mut Inspection,
    packet: Box<dyn Packet>,
) {
    let info = packet.info().clone();

    if !shared.lock().data_complete {
        let deps = GatherDeps {
            sockets: &ctx.sockets,
            processes: ctx.processes.as_ref(),
            ip_info: &ctx.ip_info,
            dns_index: &ctx.dns_index,
            portal: ctx.net_state.portal(),
        };

        if !gather::gather(&deps, shared, &info).await {
            // Still incomplete after a real packet is exceptional; fail
            // safe without committing the connection to a verdict.
            tracing::debug!(conn = %shared.lock().id, "Connection data still incomplete");

            let verdict = warden_model::Verdict::Undeterminable.fold_unresolved(info.inbound);
            if let Err(e) = apply::apply_verdict(&*packet, verdict, false) {
                tracing::warn!(packet = ?info, "Failed to apply fail-safe verdict: {e:#}");
            }
            return;
        }
    }

    if !shared.lock().verdict_active().is_decided() {
        let (outcome, ticket) = {
            let mut conn = shared.lock();
            let decider_ctx = ctx.decider_ctx();
            match deciders::run(&decider_ctx, &mut conn) {
                PipelineOutcome::Decided => (PipelineOutcome::Decided, None),
                PipelineOutcome::NeedsPrompt => {
                    let timeout = ctx.config.current().prompt_timeout;
                    (PipelineOutcome::NeedsPrompt, Some(ctx.prompts.begin(&conn, timeout)))
                }
            }
        };

        if let (PipelineOutcome::NeedsPrompt, Some(ticket)) = (outcome, ticket) {
            let (verdict, reason) = ctx.prompts.wait(ticket, &ctx.cancel).await;
            shared.lock().set_verdict(verdict, reason);
        }

        // Inspectors attach once the first decision is made.
        let mut conn = shared.lock();
        let active = ctx.inspection.acquire(&conn);
        conn.inspecting = !active.is_empty();
        inspection.active = Some(active);
    }

    let config = ctx.config.current();
    let mut conn = shared.lock();

    if let Some(active) = &mut inspection.active
        && !active.is_empty()
    {
        active.inspect_packet(&mut conn, &*packet);

        // Payloads reach the inspectors defragmented and, for TCP, in
        // stream order.
        match packet.payload() {
            Ok(payload) => {
                let fed = inspection.payloads.feed(packet.info(), payload, Instant::now());

                match fed {
                    Some(InspectData::Stream(data)) => {
                        active.inspect_stream(&mut conn, &data, info.inbound);
                    }
                    Some(InspectData::Datagram(data)) => {
                        active.inspect_datagram(&mut conn, &data, info.inbound);
                    }
                    None => {}
                }
            }
            Err(e) => {
                tracing::debug!(conn = %conn.id, "Failed to fetch packet payload: {e:#}");
            }
        }
    }

    apply::apply_to_connection(&mut conn, &*packet, &config);
}
