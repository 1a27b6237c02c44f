//! Decision prompts.
//!
//! When a profile's default action is "ask", the connection is presented to
//! the user. The first packets are not held hostage: after a short grace
//! the flow is dropped with "prompting in progress" and the final decision
//! is applied by the reset coordinator once the user answers (the persisted
//! endpoint rule bumps the profile revision).

use crate::reset::ResetEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_model::Verdict;
use warden_network::{Connection, Reason};
use warden_profile::{DomainPattern, Endpoint, EndpointValue, LayeredProfile};

/// How long the first packets wait for an answer before being dropped.
pub(crate) const PROMPT_GRACE: Duration = Duration::from_secs(1);

/// The actions a prompt can offer, identified by their wire IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    PermitDomainAll,
    PermitDomainDistinct,
    DenyDomainAll,
    DenyDomainDistinct,
    PermitIp,
    DenyIp,
    PermitServingIp,
    DenyServingIp,
}

impl PromptAction {
    pub fn id(&self) -> &'static str {
        match self {
            PromptAction::PermitDomainAll => "permit-domain-all",
            PromptAction::PermitDomainDistinct => "permit-domain-distinct",
            PromptAction::DenyDomainAll => "deny-domain-all",
            PromptAction::DenyDomainDistinct => "deny-domain-distinct",
            PromptAction::PermitIp => "permit-ip",
            PromptAction::DenyIp => "deny-ip",
            PromptAction::PermitServingIp => "permit-serving-ip",
            PromptAction::DenyServingIp => "deny-serving-ip",
        }
    }

    fn is_permit(&self) -> bool {
        matches!(
            self,
            PromptAction::PermitDomainAll
                | PromptAction::PermitDomainDistinct
                | PromptAction::PermitIp
                | PromptAction::PermitServingIp
        )
    }
}

/// What the connection looks like to the user; decides the offered actions.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PromptShape {
    Inbound { remote: IpAddr },
    OutboundIp { remote: IpAddr },
    OutboundDomain { domain: String },
}

impl PromptShape {
    fn of(conn: &Connection) -> PromptShape {
        if conn.inbound {
            return PromptShape::Inbound {
                remote: conn.entity.ip.unwrap_or(IpAddr::from([0u8; 4])),
            };
        }

        match &conn.entity.domain {
            Some(domain) => PromptShape::OutboundDomain { domain: domain.clone() },
            None => PromptShape::OutboundIp {
                remote: conn.entity.ip.unwrap_or(IpAddr::from([0u8; 4])),
            },
        }
    }

    fn actions(&self) -> Vec<PromptAction> {
        match self {
            PromptShape::Inbound { .. } => {
                vec![PromptAction::PermitServingIp, PromptAction::DenyServingIp]
            }
            PromptShape::OutboundIp { .. } => vec![PromptAction::PermitIp, PromptAction::DenyIp],
            PromptShape::OutboundDomain { .. } => vec![
                PromptAction::PermitDomainAll,
                PromptAction::PermitDomainDistinct,
                PromptAction::DenyDomainDistinct,
                PromptAction::DenyDomainAll,
            ],
        }
    }

    fn timeout_action(&self) -> PromptAction {
        match self {
            PromptShape::Inbound { .. } => PromptAction::DenyServingIp,
            PromptShape::OutboundIp { .. } => PromptAction::DenyIp,
            PromptShape::OutboundDomain { .. } => PromptAction::DenyDomainDistinct,
        }
    }
}

/// A prompt handed to the notification subsystem.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// `prompt-<pid>-<scope>[-<remote-ip>]`.
    pub id: String,
    pub message: String,
    pub actions: Vec<PromptAction>,
    pub valid_for: Duration,
}

/// The outward contract to the notification subsystem.
///
/// Responses come back through [`PromptDispatcher::resolve`].
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, request: PromptRequest);
}

/// Discards prompts; every ask times out.
pub struct NoNotifier;

impl Notifier for NoNotifier {
    fn notify(&self, _request: PromptRequest) {}
}

/// A subscription to a pending prompt's answer.
pub struct PromptTicket {
    rx: Option<broadcast::Receiver<PromptAction>>,
}

struct Pending {
    response: broadcast::Sender<PromptAction>,
    expires: Instant,
    shape: PromptShape,
    profile: Arc<LayeredProfile>,
    inbound: bool,
}

/// Tracks open prompts and rendezvouses answers with waiting workers.
pub struct PromptDispatcher {
    notifier: Box<dyn Notifier>,
    pending: Mutex<HashMap<String, Pending>>,
    reset_tx: broadcast::Sender<ResetEvent>,
}

impl PromptDispatcher {
    pub fn new(notifier: Box<dyn Notifier>, reset_tx: broadcast::Sender<ResetEvent>) -> Self {
        Self {
            notifier,
            pending: Mutex::new(HashMap::new()),
            reset_tx,
        }
    }

    /// Registers (or extends) the prompt for a connection.
    ///
    /// Synchronous so the caller can do this under its connection lock and
    /// await the answer afterwards.
    pub fn begin(self: &Arc<Self>, conn: &Connection, timeout: Duration) -> PromptTicket {
        let Some(process) = conn.process() else {
            return PromptTicket { rx: None };
        };

        let id = prompt_id(conn);
        let shape = PromptShape::of(conn);
        let profile = process.profile.clone();
        let now = Instant::now();

        let mut pending = self.pending.lock();

        let rx = match pending.get_mut(&id) {
            Some(entry) => {
                // Same question is already on screen; just extend it.
                entry.expires = now + timeout;
                entry.response.subscribe()
            }
            None => {
                let (tx, rx) = broadcast::channel(1);

                pending.insert(
                    id.clone(),
                    Pending {
                        response: tx,
                        expires: now + timeout,
                        shape: shape.clone(),
                        profile,
                        inbound: conn.inbound,
                    },
                );

                self.notifier.notify(PromptRequest {
                    id: id.clone(),
                    message: format!(
                        "{} wants to connect to {}",
                        conn.process().map(|p| p.name.as_str()).unwrap_or("unknown"),
                        conn.scope,
                    ),
                    actions: shape.actions(),
                    valid_for: timeout,
                });

                tokio::spawn(Self::expire(self.clone(), id.clone()));

                rx
            }
        };

        PromptTicket { rx: Some(rx) }
    }

    /// Waits for grace, answer or shutdown.
    ///
    /// The returned verdict is what the caller applies now; the durable
    /// outcome arrives via the persisted rule.
    pub async fn wait(&self, ticket: PromptTicket, cancel: &CancellationToken) -> (Verdict, Reason) {
        let Some(mut rx) = ticket.rx else {
            return (Verdict::Drop, Reason::new("no process to ask about"));
        };

        tokio::select! {
            action = rx.recv() => match action {
                Ok(action) => action_outcome(action, false),
                Err(_) => (Verdict::Drop, Reason::new("prompt vanished")),
            },
            _ = tokio::time::sleep(PROMPT_GRACE) => {
                (Verdict::Drop, Reason::new("prompting in progress"))
            }
            _ = cancel.cancelled() => (Verdict::Drop, Reason::new("shutting down")),
        }
    }

    /// [`begin`](Self::begin) and [`wait`](Self::wait) in one go.
    pub async fn prompt(
        self: &Arc<Self>,
        conn: &Connection,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Verdict, Reason) {
        let ticket = self.begin(conn, timeout);
        self.wait(ticket, cancel).await
    }

    /// Applies a user response: persists the matching endpoint rule and
    /// wakes both the waiting workers and the reset coordinator.
    pub fn resolve(&self, prompt_id: &str, action: PromptAction) {
        self.finish(prompt_id, action, true);
    }

    fn finish(&self, prompt_id: &str, action: PromptAction, persist: bool) {
        let Some(entry) = self.pending.lock().remove(prompt_id) else {
            tracing::debug!(%prompt_id, "Response to unknown or expired prompt");
            return;
        };

        if persist {
            if let Some(rule) = rule_for(&entry.shape, action) {
                entry.profile.add_endpoint_rule(rule, entry.inbound);

                let _ = self
                    .reset_tx
                    .send(ResetEvent::ProfileChanged(entry.profile.id().clone()));
            }
        }

        let _ = entry.response.send(action);
    }

    async fn expire(dispatcher: Arc<Self>, prompt_id: String) {
        loop {
            let expires = {
                let pending = dispatcher.pending.lock();
                let Some(entry) = pending.get(&prompt_id) else {
                    return;
                };
                entry.expires
            };

            tokio::time::sleep_until(expires).await;

            let timed_out = {
                let pending = dispatcher.pending.lock();
                pending
                    .get(&prompt_id)
                    .is_some_and(|entry| entry.expires <= Instant::now())
            };

            if timed_out {
                let action = {
                    let pending = dispatcher.pending.lock();
                    pending.get(&prompt_id).map(|entry| entry.shape.timeout_action())
                };

                if let Some(action) = action {
                    tracing::debug!(%prompt_id, "No response to prompt");
                    dispatcher.finish(&prompt_id, action, false);
                }
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn open_prompts(&self) -> usize {
        self.pending.lock().len()
    }
}

/// The durable verdict for a prompt answer.
pub(crate) fn action_outcome(action: PromptAction, timed_out: bool) -> (Verdict, Reason) {
    let verdict = if action.is_permit() {
        Verdict::Accept
    } else if matches!(action, PromptAction::DenyServingIp) {
        Verdict::Drop
    } else {
        Verdict::Block
    };

    let reason = if timed_out {
        Reason::new("no response to prompt")
    } else {
        Reason::new(format!("user decision: {}", action.id()))
    };

    (verdict, reason)
}

fn prompt_id(conn: &Connection) -> String {
    match (&conn.entity.domain, conn.entity.ip) {
        (Some(_), _) => format!("prompt-{}-{}", conn.pid, conn.scope),
        (None, Some(ip)) => format!("prompt-{}-{}-{}", conn.pid, conn.scope, ip),
        (None, None) => format!("prompt-{}-{}", conn.pid, conn.scope),
    }
}

fn rule_for(shape: &PromptShape, action: PromptAction) -> Option<Endpoint> {
    let value = match (shape, action) {
        (PromptShape::OutboundDomain { domain }, PromptAction::PermitDomainAll | PromptAction::DenyDomainAll) => {
            EndpointValue::Domain(DomainPattern::new(&format!(".{domain}")).ok()?)
        }
        (
            PromptShape::OutboundDomain { domain },
            PromptAction::PermitDomainDistinct | PromptAction::DenyDomainDistinct,
        ) => EndpointValue::Domain(DomainPattern::new(domain).ok()?),
        (PromptShape::OutboundIp { remote }, PromptAction::PermitIp | PromptAction::DenyIp) => {
            EndpointValue::Ip(*remote)
        }
        (
            PromptShape::Inbound { remote },
            PromptAction::PermitServingIp | PromptAction::DenyServingIp,
        ) => EndpointValue::Ip(*remote),
        _ => return None,
    };

    Some(if action.is_permit() {
        Endpoint::permit(value)
    } else {
        Endpoint::deny(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_info::testing::tcp_v4_packet_info;
    use std::sync::Arc;
    use warden_model::ProfileId;
    use warden_profile::{Process, Profile};

    struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, request: PromptRequest) {
            self.0.lock().push(request.id);
        }
    }

    fn asked() -> (Arc<PromptDispatcher>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (reset_tx, _) = broadcast::channel(8);

        let dispatcher = Arc::new(PromptDispatcher::new(
            Box::new(RecordingNotifier(seen.clone())),
            reset_tx,
        ));

        (dispatcher, seen)
    }

    fn conn_for_domain(domain: &str) -> Connection {
        let mut conn =
            Connection::from_packet(&tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443"));
        conn.set_process(Arc::new(Process {
            pid: 100,
            name: "curl".to_owned(),
            exec_path: "/usr/bin/curl".into(),
            profile: LayeredProfile::new(ProfileId::local("curl"), Profile::standard()),
        }));
        conn.entity.set_domain(domain, Vec::new(), None);
        conn.update_scope();
        conn.mark_data_complete();
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_drops_with_prompting_in_progress() {
        let (dispatcher, _) = asked();
        let conn = conn_for_domain("example.com");
        let cancel = CancellationToken::new();

        let (verdict, reason) = dispatcher
            .prompt(&conn, Duration::from_secs(60), &cancel)
            .await;

        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(reason.message, "prompting in progress");
        // The notification stays alive for the user.
        assert_eq!(dispatcher.open_prompts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_resolves_and_persists_rule() {
        let (dispatcher, seen) = asked();
        let conn = conn_for_domain("example.com");
        let profile = conn.process().unwrap().profile.clone();
        let revision = profile.revision();
        let cancel = CancellationToken::new();

        let waiter = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher.prompt(&conn, Duration::from_secs(60), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = seen.lock().first().cloned().unwrap();
        dispatcher.resolve(&id, PromptAction::PermitDomainAll);

        let (verdict, reason) = waiter.await.unwrap();

        assert_eq!(verdict, Verdict::Accept);
        assert!(reason.message.contains("permit-domain-all"));
        assert_eq!(dispatcher.open_prompts(), 0);
        // The answer was persisted as an endpoint rule.
        assert!(profile.revision() > revision);
        assert!(!profile.read().endpoints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_prompts_extend_instead_of_renotify() {
        let (dispatcher, seen) = asked();
        let conn = conn_for_domain("example.com");
        let cancel = CancellationToken::new();

        dispatcher.prompt(&conn, Duration::from_secs(60), &cancel).await;
        dispatcher.prompt(&conn, Duration::from_secs(60), &cancel).await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(dispatcher.open_prompts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_without_persisting() {
        let (dispatcher, _) = asked();
        let conn = conn_for_domain("example.com");
        let profile = conn.process().unwrap().profile.clone();
        let revision = profile.revision();
        let cancel = CancellationToken::new();

        dispatcher.prompt(&conn, Duration::from_secs(5), &cancel).await;

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(dispatcher.open_prompts(), 0);
        assert_eq!(profile.revision(), revision);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_with_shutting_down() {
        let (dispatcher, _) = asked();
        let conn = conn_for_domain("example.com");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (verdict, reason) = dispatcher
            .prompt(&conn, Duration::from_secs(60), &cancel)
            .await;

        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(reason.message, "shutting down");
    }

    #[test]
    fn inbound_and_ip_shapes_offer_the_right_actions() {
        let mut info = tcp_v4_packet_info("203.0.113.9:51000", "10.0.0.2:22");
        info.inbound = true;
        let conn = Connection::from_packet(&info);

        assert_eq!(
            PromptShape::of(&conn).actions(),
            vec![PromptAction::PermitServingIp, PromptAction::DenyServingIp]
        );

        let conn = Connection::from_packet(&tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443"));
        assert_eq!(
            PromptShape::of(&conn).actions(),
            vec![PromptAction::PermitIp, PromptAction::DenyIp]
        );
    }

    #[test]
    fn permit_all_rule_covers_subdomains() {
        let shape = PromptShape::OutboundDomain { domain: "example.com".to_owned() };
        let rule = rule_for(&shape, PromptAction::PermitDomainAll).unwrap();

        let EndpointValue::Domain(pattern) = &rule.value else {
            panic!("expected a domain rule");
        };
        assert!(pattern.matches("example.com"));
        assert!(pattern.matches("sub.example.com"));
        assert!(rule.permit);
    }
}
