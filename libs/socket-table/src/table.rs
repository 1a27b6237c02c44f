use crate::{SocketTableSource, TableKind, TableSnapshot};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

/// Minimum interval between two real reads of the same OS table.
const MIN_FETCH_INTERVAL: Duration = Duration::from_millis(10);

/// One cached OS socket table.
pub(crate) struct Table {
    kind: TableKind,
    snapshot: RwLock<TableSnapshot>,
    limiter: CallLimiter,
}

impl Table {
    pub(crate) fn new(kind: TableKind) -> Self {
        Self {
            kind,
            snapshot: RwLock::new(TableSnapshot::default()),
            limiter: CallLimiter::new(MIN_FETCH_INTERVAL),
        }
    }

    /// Refreshes the cached snapshot unless a refresh happened within the
    /// limiter interval. Concurrent callers past the limiter see the cache.
    pub(crate) fn refresh(&self, source: &dyn SocketTableSource, now: Instant) {
        if !self.limiter.acquire(now) {
            return;
        }

        match source.read(self.kind) {
            Ok(snapshot) => *self.snapshot.write() = snapshot,
            Err(e) => {
                tracing::warn!(table = %self.kind, "Failed to read socket table: {e}");
            }
        }
    }

    pub(crate) fn snapshot(&self) -> RwLockReadGuard<'_, TableSnapshot> {
        self.snapshot.read()
    }
}

/// Grants at most one call per interval.
pub(crate) struct CallLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl CallLimiter {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// True when the caller may proceed; the slot is consumed either way.
    pub(crate) fn acquire(&self, now: Instant) -> bool {
        let mut last = self.last.lock();

        match *last {
            Some(previous) if now.duration_since(previous) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSource;

    #[test]
    fn limiter_grants_once_per_interval() {
        let limiter = CallLimiter::new(Duration::from_millis(10));
        let start = Instant::now();

        assert!(limiter.acquire(start));
        assert!(!limiter.acquire(start + Duration::from_millis(5)));
        assert!(!limiter.acquire(start + Duration::from_millis(9)));
        assert!(limiter.acquire(start + Duration::from_millis(10)));
    }

    #[test]
    fn refresh_past_limiter_serves_cache() {
        let source = FakeSource::default().with_udp4_bind("0.0.0.0:53", 0, 1, Some(1));
        let table = Table::new(TableKind::Udp4);
        let start = Instant::now();

        table.refresh(&source, start);
        table.refresh(&source, start + Duration::from_millis(1));
        table.refresh(&source, start + Duration::from_millis(2));

        assert_eq!(source.reads(TableKind::Udp4), 1);

        table.refresh(&source, start + Duration::from_millis(12));

        assert_eq!(source.reads(TableKind::Udp4), 2);
    }
}
