use crate::connection::Connection;
use opentelemetry::KeyValue;
use packet_info::TransportProtocol;

/// Connection accounting, attached to the store.
pub(crate) struct Metrics {
    connections_total: opentelemetry::metrics::Counter<u64>,
    active_connections: opentelemetry::metrics::UpDownCounter<i64>,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        let meter = opentelemetry::global::meter("warden");

        Self {
            connections_total: meter
                .u64_counter("network.connections.total")
                .with_description("The number of connections handled, by outcome.")
                .build(),
            active_connections: meter
                .i64_up_down_counter("network.connections.active")
                .with_description("The number of connections currently tracked.")
                .build(),
        }
    }

    pub(crate) fn connection_added(&self, _conn: &Connection) {
        self.active_connections.add(1, &[]);
    }

    pub(crate) fn connection_removed(&self, conn: &Connection) {
        self.active_connections.add(-1, &[]);
        self.connections_total.add(
            1,
            &[
                KeyValue::new(
                    "network.io.direction",
                    if conn.inbound { "receive" } else { "transmit" },
                ),
                KeyValue::new("warden.verdict.blocked", !conn.verdict_active().is_allowing()),
                KeyValue::new("warden.connection.encrypted", conn.encrypted),
                KeyValue::new("warden.connection.tunneled", conn.tunneled),
            ],
        );
    }
}

/// Records a packet dropped at enqueue time because a queue was saturated.
pub(crate) fn packet_dropped(protocol: &TransportProtocol) {
    let counter = opentelemetry::global::meter("warden")
        .u64_counter("network.packets.dropped")
        .with_description("Packets dropped before a verdict could be applied.")
        .build();

    counter.add(1, &[KeyValue::new("network.protocol.name", protocol.to_string())]);
}
