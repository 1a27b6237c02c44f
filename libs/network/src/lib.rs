//! The connection model: connection objects, their stores, DNS request
//! attribution and the read-only query surface.
//!
//! A [`Connection`] is created for the first packet of a flow (or for a DNS
//! request), enriched until [`Connection::data_complete`], decided by the
//! firewall and aged out by the cleaner. All shared structures are guarded
//! by per-structure locks; the connection itself carries its own mutex and
//! callers hold it for any mutation.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod clean;
mod connection;
mod dns_attribution;
mod entity;
mod ipinfo;
mod metrics;
mod query;
mod store;

pub use connection::{ConnScope, Connection, ConnectionType, Reason, SharedConnection};
pub use dns_attribution::DnsRequestIndex;
pub use entity::Entity;
pub use ipinfo::{IpInfoStore, LocalhostNotPersisted};
pub use query::query;
pub use store::ConnectionStore;

use std::time::Duration;

/// Attribution window for DNS request connections.
pub const DNS_REQUEST_TTL: Duration = Duration::from_secs(3);

/// Inactivity after which a TCP or UDP connection counts as ended.
pub const STREAM_IDLE_TTL: Duration = Duration::from_secs(5 * 60);

/// Inactivity after which an ICMP (or other port-less) exchange ends.
pub const PACKET_IDLE_TTL: Duration = Duration::from_secs(60);

/// How long an ended connection stays visible before deletion.
pub const ENDED_RETENTION: Duration = Duration::from_secs(10 * 60);

/// How long an incomplete connection may linger before it is GCed.
pub const INCOMPLETE_RETENTION: Duration = Duration::from_secs(60);
