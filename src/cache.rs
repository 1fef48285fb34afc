use std::time::Duration;

use xxhash_rust::xxh3::xxh3_64;

use crate::bigvalue::BigStats;
use crate::bucket::Bucket;
use crate::config::Config;
use crate::ttl::TtlState;

/// Number of independent shards. A key deterministically belongs to one
/// bucket via the low bits of its hash.
pub(crate) const BUCKETS: usize = 256;

/// Cache counters.
///
/// Use [`Cache::update_stats`] for obtaining fresh values; updates are
/// additive so callers can aggregate several caches into one struct.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of get calls.
    pub get_calls: u64,
    /// Number of set calls.
    pub set_calls: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of reads that hit a hash slot holding a different key.
    pub collisions: u64,
    /// Current number of entries across all buckets.
    pub entries_count: u64,
    /// Bytes currently held by bucket chunks.
    pub bytes_size: u64,
    /// Total chunk capacity across all buckets.
    pub max_bytes_size: u64,
    /// Number of set_big calls.
    pub set_big_calls: u64,
    /// Number of get_big calls.
    pub get_big_calls: u64,
    /// Number of get_with_ttl calls.
    pub get_with_ttl_calls: u64,
    /// Number of set_with_ttl calls.
    pub set_with_ttl_calls: u64,
    /// Number of get_with_ttl calls that found no live deadline.
    pub misses_with_ttl: u64,
}

impl Stats {
    pub fn reset(&mut self) {
        *self = Stats::default();
    }
}

/// A fast thread-safe in-process cache for large numbers of small entries.
///
/// Entries live in per-bucket chunk rings allocated off the managed heap;
/// eviction is strictly by ring overwrite, so a stored entry may disappear
/// at any time. Any method may be called from any thread.
#[derive(Debug)]
pub struct Cache {
    pub(crate) buckets: Vec<Bucket>,
    pub(crate) big_stats: BigStats,
    pub(crate) ttl: TtlState,
    pub(crate) ttl_sweep_interval: Duration,
}

pub(crate) fn hash64(data: &[u8]) -> u64 {
    xxh3_64(data)
}

impl Cache {
    /// Creates a cache with the given capacity in bytes, rounded up to at
    /// least one chunk per bucket.
    ///
    /// Panics if `max_bytes` is zero; a zero-capacity cache is a caller bug.
    pub fn new(max_bytes: usize) -> Self {
        Cache::with_config(Config::new(max_bytes))
    }

    /// Creates a cache from a full [`Config`].
    pub fn with_config(config: Config) -> Self {
        assert!(
            config.max_bytes > 0,
            "maxBytes must be greater than 0; got {}",
            config.max_bytes
        );
        let max_bucket_bytes = ((config.max_bytes + BUCKETS - 1) / BUCKETS) as u64;
        let buckets = (0..BUCKETS).map(|_| Bucket::new(max_bucket_bytes)).collect();
        Cache {
            buckets,
            big_stats: BigStats::default(),
            ttl: TtlState::new(),
            ttl_sweep_interval: config.ttl_sweep_interval,
        }
    }

    pub(crate) fn from_buckets(buckets: Vec<Bucket>) -> Self {
        Cache {
            buckets,
            big_stats: BigStats::default(),
            ttl: TtlState::new(),
            ttl_sweep_interval: crate::config::DEFAULT_TTL_SWEEP_INTERVAL,
        }
    }

    /// Stores (key, value). Entries whose encoded size exceeds one chunk are
    /// dropped silently; use [`Cache::set_big`] for those. The entry may be
    /// evicted at any time by ring overwrite or an unlikely hash collision.
    pub fn set(&self, key: &[u8], value: &[u8]) {
        let h = hash64(key);
        self.set_with_hash(key, value, h);
    }

    /// Appends the value for `key` to `dst`. Absent keys leave `dst`
    /// untouched; use [`Cache::has_get`] to distinguish an empty stored
    /// value from a miss.
    pub fn get(&self, dst: &mut Vec<u8>, key: &[u8]) {
        let h = hash64(key);
        self.get_with_hash(dst, key, h);
    }

    /// Returns true if an entry for `key` exists.
    pub fn has(&self, key: &[u8]) -> bool {
        let h = hash64(key);
        self.buckets[(h % BUCKETS as u64) as usize].get(None, key, h)
    }

    /// Appends the value for `key` to `dst` and reports whether the entry
    /// was found. An empty stored value is still found.
    pub fn has_get(&self, dst: &mut Vec<u8>, key: &[u8]) -> bool {
        let h = hash64(key);
        self.get_with_hash(dst, key, h)
    }

    /// Deletes the entry for `key`. Missing keys are a no-op.
    pub fn del(&self, key: &[u8]) {
        let h = hash64(key);
        self.buckets[(h % BUCKETS as u64) as usize].del(h);
    }

    /// Removes all items from the cache.
    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.reset();
        }
        self.big_stats.reset();
        self.ttl.reset();
    }

    /// Adds cache stats to `s`.
    pub fn update_stats(&self, s: &mut Stats) {
        for bucket in &self.buckets {
            bucket.update_stats(s);
        }
        self.big_stats.update_stats(s);
        self.ttl.update_stats(s);
    }

    pub(crate) fn set_with_hash(&self, key: &[u8], value: &[u8], h: u64) {
        self.buckets[(h % BUCKETS as u64) as usize].set(key, value, h);
    }

    pub(crate) fn get_with_hash(&self, dst: &mut Vec<u8>, key: &[u8], h: u64) -> bool {
        self.buckets[(h % BUCKETS as u64) as usize].get(Some(dst), key, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CHUNK_SIZE;

    #[test]
    fn test_cache_small() {
        let c = Cache::new(1);

        let mut buf = Vec::new();
        c.get(&mut buf, b"aaa");
        assert!(buf.is_empty(), "unexpected value from empty cache: {buf:?}");
        assert!(!c.has_get(&mut buf, b"aaa"));

        c.set(b"key", b"value");
        c.get(&mut buf, b"key");
        assert_eq!(buf, b"value");

        buf.clear();
        c.get(&mut buf, b"");
        assert!(buf.is_empty());
        assert!(!c.has_get(&mut buf, b""));

        c.set(b"aaa", b"bbb");
        buf.clear();
        assert!(c.has_get(&mut buf, b"aaa"));
        assert_eq!(buf, b"bbb");

        c.reset();
        buf.clear();
        c.get(&mut buf, b"aaa");
        assert!(buf.is_empty(), "value survived reset: {buf:?}");
        assert!(!c.has_get(&mut buf, b"aaa"));

        // An empty stored value is still found.
        c.set(b"empty", b"");
        buf.clear();
        c.get(&mut buf, b"empty");
        assert!(buf.is_empty());
        assert!(c.has_get(&mut buf, b"empty"));
        assert!(buf.is_empty());
        assert!(c.has(b"empty"));
        assert!(!c.has(b"foobar"));
    }

    #[test]
    fn test_cache_wrap() {
        let c = Cache::new(BUCKETS * CHUNK_SIZE * 3 / 2);

        const CALLS: u64 = 5_000_000;

        let mut buf = Vec::new();
        for i in 0..CALLS {
            let k = format!("key {i}");
            let v = format!("value {i}");
            c.set(k.as_bytes(), v.as_bytes());
            buf.clear();
            c.get(&mut buf, k.as_bytes());
            assert_eq!(buf, v.as_bytes(), "wrong value right after set of {k}");
        }
        for i in 0..CALLS / 10 {
            let x = i * 10;
            let k = format!("key {x}");
            let v = format!("value {x}");
            buf.clear();
            c.get(&mut buf, k.as_bytes());
            assert!(
                buf.is_empty() || buf == v.as_bytes(),
                "wrong surviving value for {k}"
            );
        }

        let mut s = Stats::default();
        c.update_stats(&mut s);
        assert_eq!(s.get_calls, CALLS + CALLS / 10);
        assert_eq!(s.set_calls, CALLS);
        assert!(
            s.misses > 0 && s.misses < CALLS / 10,
            "misses {} out of expected range",
            s.misses
        );
        assert_eq!(s.collisions, 0);
        assert!(
            s.entries_count >= CALLS / 5,
            "entries_count {} too small",
            s.entries_count
        );
        assert!(s.bytes_size >= 1024);
        assert!(s.max_bytes_size >= 32 * 1024 * 1024);
    }

    #[test]
    fn test_cache_del() {
        let c = Cache::new(1024);
        let mut buf = Vec::new();
        for i in 0..100 {
            let k = format!("key {i}");
            let v = format!("value {i}");
            c.set(k.as_bytes(), v.as_bytes());
            buf.clear();
            c.get(&mut buf, k.as_bytes());
            assert_eq!(buf, v.as_bytes());
            c.del(k.as_bytes());
            buf.clear();
            c.get(&mut buf, k.as_bytes());
            assert!(buf.is_empty(), "value survived delete of {k}");
        }
    }

    #[test]
    fn test_cache_big_key_value() {
        let c = Cache::new(1024);
        let mut buf = Vec::new();

        // Both key and value exceed 64 KiB.
        let k = vec![0u8; 90 * 1024];
        let v = vec![0u8; 100 * 1024];
        c.set(&k, &v);
        c.get(&mut buf, &k);
        assert!(buf.is_empty());

        // key + value exceed 64 KiB together.
        let k = vec![1u8; 40 * 1024];
        let v = vec![2u8; 40 * 1024];
        c.set(&k, &v);
        c.get(&mut buf, &k);
        assert!(buf.is_empty());
    }

    fn check_get_set(c: &Cache, items: usize) {
        let mut buf = Vec::new();
        for i in 0..items {
            let k = format!("key {i}");
            let v = format!("value {i}");
            c.set(k.as_bytes(), v.as_bytes());
            buf.clear();
            c.get(&mut buf, k.as_bytes());
            assert_eq!(buf, v.as_bytes(), "wrong value right after set of {k}");
        }
        let mut misses = 0;
        for i in 0..items {
            let k = format!("key {i}");
            let v = format!("value {i}");
            buf.clear();
            c.get(&mut buf, k.as_bytes());
            if buf != v.as_bytes() {
                assert!(buf.is_empty(), "wrong value for {k}");
                misses += 1;
            }
        }
        assert!(misses < items / 100, "too many misses: {misses}");
    }

    #[test]
    fn test_cache_get_set_serial() {
        let items = 10_000;
        let c = Cache::new(30 * items);
        check_get_set(&c, items);
    }

    #[test]
    fn test_cache_get_set_concurrent() {
        let items = 10_000;
        let workers = 10;
        let c = Cache::new(30 * items * workers);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| check_get_set(&c, items));
            }
        });
    }

    #[test]
    fn test_cache_reset_update_stats_set_concurrent() {
        let c = Cache::new(12334);
        std::thread::scope(|scope| {
            for _ in 0..5 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        c.reset();
                        std::thread::yield_now();
                    }
                });
            }
            for _ in 0..5 {
                scope.spawn(|| {
                    let mut s = Stats::default();
                    for _ in 0..50 {
                        c.update_stats(&mut s);
                        std::thread::yield_now();
                    }
                });
            }
            for _ in 0..5 {
                scope.spawn(|| {
                    for j in 0..100 {
                        let k = format!("key_{j}");
                        let v = format!("value_{j}");
                        c.set(k.as_bytes(), v.as_bytes());
                        std::thread::yield_now();
                    }
                });
            }
        });
    }

    /// Finds two keys routed to the same bucket so a test can fill one ring
    /// deterministically.
    fn same_bucket_keys() -> (Vec<u8>, Vec<u8>, usize) {
        let first = b"gen key 0".to_vec();
        let target = (hash64(&first) % BUCKETS as u64) as usize;
        for i in 1..10_000u32 {
            let candidate = format!("gen key {i}").into_bytes();
            if (hash64(&candidate) % BUCKETS as u64) as usize == target {
                return (first, candidate, target);
            }
        }
        unreachable!("no bucket sibling found within 10k candidates");
    }

    #[test]
    fn test_generation_overflow() {
        let c = Cache::new(1); // one 64 KiB chunk per bucket
        let (k1, k2, bucket) = same_bucket_keys();

        // Sized so the pair fills the bucket's single chunk: the first entry
        // takes exactly half, the second one byte less than the remainder,
        // so every following pair wraps the ring exactly once.
        let v1 = vec![1u8; 32 * 1024 - 4 - k1.len()];
        let v2 = vec![2u8; 32 * 1024 - 5 - k2.len()];

        let mut buf = Vec::new();
        let mut fill_and_check = |expected_gen: u64| {
            c.set(&k1, &v1);
            c.set(&k2, &v2);
            buf.clear();
            c.get(&mut buf, &k1);
            assert_eq!(buf, v1, "lost k1 at gen {expected_gen}");
            buf.clear();
            c.get(&mut buf, &k2);
            assert_eq!(buf, v2, "lost k2 at gen {expected_gen}");
            assert_eq!(c.buckets[bucket].generation(), expected_gen);
        };

        // The first pair fits without wrapping; each following pair wraps.
        for i in 0..10 {
            fill_and_check(1 + i);
        }

        // Jump close to the 24-bit ceiling instead of wrapping 2^24 times.
        c.buckets[bucket].force_generation((1 << 24) - 2);

        fill_and_check((1 << 24) - 1);
        // The wrap skips zero and the bucket keeps working.
        fill_and_check(1);
        for i in 0..10 {
            fill_and_check(2 + i);
        }
    }
}
