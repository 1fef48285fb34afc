use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{hash64, Cache, Stats};

type DeadlineMap = HashMap<u64, i64, RandomState>;

/// Expiry bookkeeping for the `*_with_ttl` methods: a deadline map parallel
/// to the ring, its counters, and the lazily started sweeper.
#[derive(Debug)]
pub(crate) struct TtlState {
    deadlines: Arc<RwLock<DeadlineMap>>,
    get_with_ttl_calls: AtomicU64,
    set_with_ttl_calls: AtomicU64,
    misses_with_ttl: AtomicU64,
    sweeper: Once,
}

impl TtlState {
    pub(crate) fn new() -> Self {
        TtlState {
            deadlines: Arc::new(RwLock::new(HashMap::default())),
            get_with_ttl_calls: AtomicU64::new(0),
            set_with_ttl_calls: AtomicU64::new(0),
            misses_with_ttl: AtomicU64::new(0),
            sweeper: Once::new(),
        }
    }

    pub(crate) fn update_stats(&self, s: &mut Stats) {
        s.get_with_ttl_calls += self.get_with_ttl_calls.load(Ordering::Relaxed);
        s.set_with_ttl_calls += self.set_with_ttl_calls.load(Ordering::Relaxed);
        s.misses_with_ttl += self.misses_with_ttl.load(Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.deadlines.write().clear();
        self.get_with_ttl_calls.store(0, Ordering::Relaxed);
        self.set_with_ttl_calls.store(0, Ordering::Relaxed);
        self.misses_with_ttl.store(0, Ordering::Relaxed);
    }

    /// Starts the sweeper thread on the first TTL write. The thread holds
    /// only a weak reference and exits once the cache is dropped.
    fn ensure_sweeper(&self, interval: Duration) {
        self.sweeper.call_once(|| {
            let weak: Weak<RwLock<DeadlineMap>> = Arc::downgrade(&self.deadlines);
            std::thread::spawn(move || loop {
                std::thread::sleep(interval);
                let Some(deadlines) = weak.upgrade() else {
                    break;
                };
                let now = unix_now();
                let removed = {
                    let mut map = deadlines.write();
                    let before = map.len();
                    map.retain(|_, deadline| *deadline > now);
                    before - map.len()
                };
                if removed > 0 {
                    debug!(removed, "pruned expired ttl deadlines");
                }
            });
        });
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn ttl_valid(deadline: i64) -> bool {
    deadline > unix_now()
}

impl Cache {
    /// Stores (key, value) with a deadline of now + `ttl`, at one-second
    /// resolution. Read the entry back with [`Cache::get_with_ttl`].
    ///
    /// The deadline is at-most-once effort: ring overwrite may retire the
    /// entry earlier. Entries beyond one chunk are not supported with TTLs.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) {
        self.ttl.set_with_ttl_calls.fetch_add(1, Ordering::Relaxed);
        self.ttl.ensure_sweeper(self.ttl_sweep_interval);

        let h = hash64(key);
        let deadline = unix_now() + ttl.as_secs() as i64;
        self.ttl.deadlines.write().insert(h, deadline);
        self.set_with_hash(key, value, h);
    }

    /// Appends the value for `key` to `dst` if its deadline has not passed.
    /// Only entries stored via [`Cache::set_with_ttl`] are returned.
    pub fn get_with_ttl(&self, dst: &mut Vec<u8>, key: &[u8]) {
        self.ttl.get_with_ttl_calls.fetch_add(1, Ordering::Relaxed);
        let h = hash64(key);
        let deadline = self.ttl.deadlines.read().get(&h).copied();
        match deadline {
            Some(d) if ttl_valid(d) => {
                self.get_with_hash(dst, key, h);
            }
            _ => {
                self.ttl.misses_with_ttl.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns true if a deadline for `key` exists and has not passed.
    pub fn has_with_ttl(&self, key: &[u8]) -> bool {
        let h = hash64(key);
        let deadline = self.ttl.deadlines.read().get(&h).copied();
        matches!(deadline, Some(d) if ttl_valid(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_set_get_with_ttl() {
        let c = Cache::new(1024);
        c.set_with_ttl(b"key", b"value", Duration::from_secs(100));

        let mut buf = Vec::new();
        c.get_with_ttl(&mut buf, b"key");
        assert_eq!(buf, b"value");
        assert!(c.has_with_ttl(b"key"));

        // The entry is also visible through the plain path.
        buf.clear();
        c.get(&mut buf, b"key");
        assert_eq!(buf, b"value");
    }

    #[test]
    fn test_expired_entry_is_filtered() {
        let c = Cache::new(1024);
        // Zero TTL: the deadline is already due.
        c.set_with_ttl(b"gone", b"value", Duration::from_secs(0));

        let mut buf = Vec::new();
        c.get_with_ttl(&mut buf, b"gone");
        assert!(buf.is_empty());
        assert!(!c.has_with_ttl(b"gone"));

        let mut s = Stats::default();
        c.update_stats(&mut s);
        assert_eq!(s.set_with_ttl_calls, 1);
        assert_eq!(s.get_with_ttl_calls, 1);
        assert_eq!(s.misses_with_ttl, 1);
    }

    #[test]
    fn test_plain_entries_are_invisible_to_ttl_reads() {
        let c = Cache::new(1024);
        c.set(b"plain", b"value");

        let mut buf = Vec::new();
        c.get_with_ttl(&mut buf, b"plain");
        assert!(buf.is_empty());
        assert!(!c.has_with_ttl(b"plain"));
    }

    #[test]
    fn test_sweeper_prunes_dead_deadlines() {
        let config = Config::new(1024).ttl_sweep_interval(Duration::from_millis(20));
        let c = Cache::with_config(config);
        c.set_with_ttl(b"dead", b"value", Duration::from_secs(0));
        c.set_with_ttl(b"alive", b"value", Duration::from_secs(100));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if c.ttl.deadlines.read().len() == 1 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "sweeper never pruned the dead deadline"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(c.has_with_ttl(b"alive"));
    }

    #[test]
    fn test_reset_clears_deadlines_and_counters() {
        let c = Cache::new(1024);
        c.set_with_ttl(b"key", b"value", Duration::from_secs(100));
        c.reset();

        assert!(!c.has_with_ttl(b"key"));
        let mut s = Stats::default();
        c.update_stats(&mut s);
        assert_eq!(s.set_with_ttl_calls, 0);
        assert_eq!(s.misses_with_ttl, 0);
    }
}
