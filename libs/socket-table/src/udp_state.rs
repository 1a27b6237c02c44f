use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Default lifetime of a direction entry.
const ENTRY_TTL: Duration = Duration::from_secs(72 * 60 * 60);
/// Lifetime once a single bind has accumulated many remotes.
const ENTRY_TTL_CROWDED: Duration = Duration::from_secs(3 * 60 * 60);
/// Remote count at which a bind counts as crowded.
const CROWDED_THRESHOLD: usize = 256;

type BindKey = (IpAddr, u16);
type RemoteKey = (IpAddr, u16);

#[derive(Debug, Clone, Copy)]
struct RemoteEntry {
    inbound: bool,
    last_seen: Instant,
}

/// Remembers which end initiated a UDP exchange.
///
/// UDP sockets carry no direction; the first packet observed between a bind
/// and a remote fixes the direction of everything that follows on that pair.
#[derive(Debug, Default)]
pub struct UdpDirectionMap {
    binds: Mutex<HashMap<BindKey, HashMap<RemoteKey, RemoteEntry>>>,
}

impl UdpDirectionMap {
    /// Returns the recorded direction for `(bind, remote)`, creating an
    /// entry with `packet_inbound` on first sight.
    pub fn check_or_register(
        &self,
        bind: BindKey,
        remote: RemoteKey,
        packet_inbound: bool,
        now: Instant,
    ) -> bool {
        let mut binds = self.binds.lock();
        let remotes = binds.entry(bind).or_default();

        let entry = remotes.entry(remote).or_insert(RemoteEntry {
            inbound: packet_inbound,
            last_seen: now,
        });
        entry.last_seen = now;

        entry.inbound
    }

    /// Drops entries that have outlived their TTL.
    ///
    /// Binds holding more than [`CROWDED_THRESHOLD`] remotes are aged with
    /// the aggressive TTL to bound scan-heavy workloads.
    pub fn shrink(&self, now: Instant) {
        let mut binds = self.binds.lock();

        for remotes in binds.values_mut() {
            let ttl = if remotes.len() > CROWDED_THRESHOLD {
                ENTRY_TTL_CROWDED
            } else {
                ENTRY_TTL
            };

            remotes.retain(|_, entry| now.duration_since(entry.last_seen) <= ttl);
        }

        binds.retain(|_, remotes| !remotes.is_empty());
    }

    pub fn len(&self) -> usize {
        self.binds.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
