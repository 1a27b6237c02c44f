//! Re-evaluation of existing connections.
//!
//! Config changes, profile edits, tunnel connects, account updates and
//! reattributions all funnel into one broadcast channel; the coordinator
//! re-runs the filter over the affected connections and pushes changed
//! verdicts back to the interceptor.

use crate::apply::VerdictUpdater;
use crate::deciders::{self, DeciderCtx, PipelineOutcome};
use crate::prompt::PromptDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warden_model::ProfileId;
use warden_network::{ConnectionStore, SharedConnection};

/// Events that trigger re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetEvent {
    ConfigChanged,
    /// A single profile's configuration changed.
    ProfileChanged(ProfileId),
    TunnelConnected,
    AccountUpdated,
    /// A connection was attributed to a different process after the fact.
    ConnectionReattributed(String),
}

/// Selects the connections an event affects.
pub(crate) fn affected_connections(
    store: &ConnectionStore,
    event: &ResetEvent,
) -> Vec<SharedConnection> {
    match event {
        ResetEvent::ConfigChanged | ResetEvent::TunnelConnected | ResetEvent::AccountUpdated => {
            store.list()
        }
        ResetEvent::ProfileChanged(profile_id) => store
            .list()
            .into_iter()
            .filter(|shared| {
                shared.lock().profile_id().as_ref() == Some(profile_id)
            })
            .collect(),
        ResetEvent::ConnectionReattributed(conn_id) => store
            .list()
            .into_iter()
            .filter(|shared| shared.lock().id == *conn_id)
            .collect(),
    }
}

/// Re-runs the filter over one connection and pushes a changed verdict.
pub(crate) async fn re_evaluate(
    ctx: &DeciderCtx<'_>,
    prompts: &Arc<PromptDispatcher>,
    updater: &dyn VerdictUpdater,
    prompt_timeout: Duration,
    cancel: &CancellationToken,
    shared: &SharedConnection,
) {
    let (previous, outcome, ticket) = {
        let mut conn = shared.lock();

        if !conn.data_complete || conn.has_ended() {
            return;
        }

        let previous = conn.verdict_active();
        conn.entity.reset_matching_caches();

        let outcome = deciders::run(ctx, &mut conn);
        let ticket = match outcome {
            PipelineOutcome::NeedsPrompt => Some(prompts.begin(&conn, prompt_timeout)),
            PipelineOutcome::Decided => None,
        };

        (previous, outcome, ticket)
    };

    if let (PipelineOutcome::NeedsPrompt, Some(ticket)) = (outcome, ticket) {
        let (verdict, reason) = prompts.wait(ticket, cancel).await;
        shared.lock().set_verdict(verdict, reason);
    }

    let (flow, verdict) = {
        let conn = shared.lock();
        (conn.flow, conn.verdict_active())
    };

    if verdict != previous {
        tracing::debug!(conn = %shared.lock().id, %previous, new = %verdict, "Verdict changed on re-evaluation");

        if let Some(flow) = flow
            && let Err(e) = updater.update_verdict(&flow, verdict)
        {
            tracing::warn!(%flow, "Failed to push verdict update: {e:#}");
        }
    }
}
