//! The inspection framework.
//!
//! Inspectors are optional per-connection payload handlers (TLS, HTTP,
//! UPnP, ...). A factory decides per connection whether its inspector is in
//! scope; active inspectors then see every packet, reassembled TCP stream
//! data and whole (defragmented) datagrams, and may only ever make the
//! verdict stricter.

use packet_info::Packet;
use parking_lot::RwLock;
use std::sync::Arc;
use warden_model::Verdict;
use warden_network::{Connection, Reason};

/// A per-connection payload inspector.
///
/// Return [`Verdict::Undecided`] to express no opinion and
/// [`Verdict::Undeterminable`] to be removed from the connection. Any other
/// verdict is applied if it is stricter than the current one.
pub trait Inspector: Send + 'static {
    fn name(&self) -> &'static str;

    fn inspect_packet(&mut self, _conn: &Connection, _packet: &dyn Packet) -> Verdict {
        Verdict::Undecided
    }

    /// Reassembled TCP stream data, in flow order per direction.
    fn inspect_stream(&mut self, _conn: &Connection, _data: &[u8], _inbound: bool) -> Verdict {
        Verdict::Undecided
    }

    /// One UDP datagram payload.
    fn inspect_datagram(&mut self, _conn: &Connection, _data: &[u8], _inbound: bool) -> Verdict {
        Verdict::Undecided
    }
}

/// Creates inspectors for connections that are in scope.
pub trait InspectorFactory: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// `None` when this connection is out of scope for the inspector.
    fn create(&self, conn: &Connection) -> Option<Box<dyn Inspector>>;
}

/// The registry of inspector factories, keyed by name.
#[derive(Default)]
pub struct InspectionRegistry {
    factories: RwLock<Vec<Arc<dyn InspectorFactory>>>,
}

impl InspectionRegistry {
    pub fn register(&self, factory: Arc<dyn InspectorFactory>) {
        let mut factories = self.factories.write();

        if factories.iter().any(|f| f.name() == factory.name()) {
            tracing::warn!(name = %factory.name(), "Inspector factory already registered");
            return;
        }

        factories.push(factory);
    }

    /// Instantiates all in-scope inspectors for a connection.
    pub fn acquire(&self, conn: &Connection) -> ActiveInspectors {
        let inspectors = self
            .factories
            .read()
            .iter()
            .filter_map(|factory| factory.create(conn))
            .collect();

        ActiveInspectors { inspectors }
    }
}

/// The inspectors currently attached to one connection; owned by the
/// connection's packet worker.
#[derive(Default)]
pub struct ActiveInspectors {
    inspectors: Vec<Box<dyn Inspector>>,
}

impl ActiveInspectors {
    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }

    /// Runs all inspectors over a packet and applies the strictest raise.
    ///
    /// Returns whether any inspectors remain.
    pub fn inspect_packet(&mut self, conn: &mut Connection, packet: &dyn Packet) -> bool {
        self.run(conn, |inspector, conn| inspector.inspect_packet(conn, packet))
    }

    /// Feeds reassembled, in-order stream data to all inspectors.
    pub fn inspect_stream(&mut self, conn: &mut Connection, data: &[u8], inbound: bool) -> bool {
        self.run(conn, |inspector, conn| inspector.inspect_stream(conn, data, inbound))
    }

    /// Feeds one whole (defragmented) datagram to all inspectors.
    pub fn inspect_datagram(&mut self, conn: &mut Connection, data: &[u8], inbound: bool) -> bool {
        self.run(conn, |inspector, conn| inspector.inspect_datagram(conn, data, inbound))
    }

    fn run(
        &mut self,
        conn: &mut Connection,
        mut inspect: impl FnMut(&mut Box<dyn Inspector>, &Connection) -> Verdict,
    ) -> bool {
        let mut raise: Option<(Verdict, &'static str)> = None;

        self.inspectors.retain_mut(|inspector| {
            match inspect(inspector, conn) {
                Verdict::Undecided => true,
                Verdict::Undeterminable => {
                    tracing::debug!(conn = %conn.id, inspector = %inspector.name(), "Inspector gave up");
                    false
                }
                verdict => {
                    let strictest = raise.map(|(v, _)| v).unwrap_or(conn.verdict_active());
                    if verdict.is_worse_than(strictest) {
                        raise = Some((verdict, inspector.name()));
                    }
                    true
                }
            }
        });

        if let Some((verdict, name)) = raise
            && verdict.is_worse_than(conn.verdict_active())
        {
            conn.set_verdict(
                verdict,
                Reason::new(format!("raised by {name} inspector")),
            );
        }

        conn.inspecting = !self.inspectors.is_empty();

        !self.inspectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_info::testing::{MockPacket, tcp_v4_packet_info};

    struct Fixed {
        name: &'static str,
        verdict: Verdict,
    }

    impl Inspector for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn inspect_packet(&mut self, _conn: &Connection, _packet: &dyn Packet) -> Verdict {
            self.verdict
        }
    }

    struct FixedFactory {
        name: &'static str,
        verdict: Verdict,
        in_scope: bool,
    }

    impl InspectorFactory for FixedFactory {
        fn name(&self) -> &'static str {
            self.name
        }

        fn create(&self, _conn: &Connection) -> Option<Box<dyn Inspector>> {
            self.in_scope.then(|| {
                Box::new(Fixed {
                    name: self.name,
                    verdict: self.verdict,
                }) as Box<dyn Inspector>
            })
        }
    }

    fn conn() -> Connection {
        let mut conn =
            Connection::from_packet(&tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443"));
        conn.set_firewall_verdict(Verdict::Accept);
        conn
    }

    fn packet() -> MockPacket {
        MockPacket::new(tcp_v4_packet_info("10.0.0.2:44321", "1.1.1.1:443"))
    }

    #[test]
    fn out_of_scope_factories_create_nothing() {
        let registry = InspectionRegistry::default();
        registry.register(Arc::new(FixedFactory {
            name: "tls",
            verdict: Verdict::Undecided,
            in_scope: false,
        }));

        assert!(registry.acquire(&conn()).is_empty());
    }

    #[test]
    fn inspectors_can_only_raise_verdicts() {
        let registry = InspectionRegistry::default();
        registry.register(Arc::new(FixedFactory {
            name: "strict",
            verdict: Verdict::Block,
            in_scope: true,
        }));

        let mut conn = conn();
        let mut active = registry.acquire(&conn);

        active.inspect_packet(&mut conn, &packet());
        // TCP stream diverging from Accept is killed, which is exactly the
        // stricter outcome the inspector asked for.
        assert_eq!(conn.verdict_active(), Verdict::Block);

        // A later milder opinion cannot lower it again.
        let registry = InspectionRegistry::default();
        registry.register(Arc::new(FixedFactory {
            name: "mild",
            verdict: Verdict::Accept,
            in_scope: true,
        }));
        let mut active = registry.acquire(&conn);
        active.inspect_packet(&mut conn, &packet());

        assert_eq!(conn.verdict_active(), Verdict::Block);
    }

    #[test]
    fn undeterminable_removes_the_inspector() {
        let registry = InspectionRegistry::default();
        registry.register(Arc::new(FixedFactory {
            name: "confused",
            verdict: Verdict::Undeterminable,
            in_scope: true,
        }));

        let mut conn = conn();
        let mut active = registry.acquire(&conn);

        assert!(!active.inspect_packet(&mut conn, &packet()));
        assert!(active.is_empty());
        assert!(!conn.inspecting);
    }

    #[test]
    fn duplicate_factory_names_are_rejected() {
        let registry = InspectionRegistry::default();
        registry.register(Arc::new(FixedFactory {
            name: "tls",
            verdict: Verdict::Undecided,
            in_scope: true,
        }));
        registry.register(Arc::new(FixedFactory {
            name: "tls",
            verdict: Verdict::Undecided,
            in_scope: true,
        }));

        assert_eq!(registry.acquire(&conn()).inspectors.len(), 1);
    }
}
