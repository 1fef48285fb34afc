use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;

use crate::cache::Stats;
use crate::pool::{Chunk, CHUNK_SIZE};

/// Low 40 bits of a packed position hold the ring offset, bounding one
/// bucket at 1 TiB. The top 24 bits hold the generation.
const OFFSET_BITS: u64 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Generations live in [1, MAX_GEN): the counter wraps back to 1 so the
/// stored 24-bit field always equals it and zero stays the absent sentinel.
const MAX_GEN: u64 = 1 << 24;

/// Stale map entries are pruned once every this many set calls.
const CLEAN_INTERVAL: u64 = 1 << 14;

/// One of the cache's 256 shards: a ring of chunks, a generation-tagged
/// hash -> position map, and call counters updated outside the lock.
#[derive(Debug)]
pub(crate) struct Bucket {
    core: RwLock<BucketCore>,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
}

#[derive(Debug)]
struct BucketCore {
    /// Chunk slots filled lazily in order; the write cursor wraps over them.
    chunks: Vec<Option<Chunk>>,
    /// hash(key) -> (gen << 40) | ring offset of the entry.
    map: HashMap<u64, u64, RandomState>,
    /// Next-write byte offset within the logical ring.
    idx: u64,
    /// Ring generation, bumped on every wrap.
    gen: u64,
}

impl BucketCore {
    /// A position is live iff it was written in the current generation below
    /// the cursor, or in the previous generation at or above it.
    fn is_live(&self, gen: u64, offset: u64) -> bool {
        gen == self.gen && offset < self.idx || gen + 1 == self.gen && offset >= self.idx
    }
}

impl Bucket {
    /// Creates a bucket holding up to `max_bytes` rounded up to whole chunks.
    ///
    /// Panics if `max_bytes` does not fit the 40-bit ring offset; sizing a
    /// single bucket at 1 TiB is a caller bug, not a runtime condition.
    pub(crate) fn new(max_bytes: u64) -> Self {
        assert!(
            max_bytes < 1 << OFFSET_BITS,
            "too big maxBytes={max_bytes} per bucket; should be smaller than {}",
            1u64 << OFFSET_BITS
        );
        let max_chunks = (max_bytes + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64;
        let mut chunks = Vec::with_capacity(max_chunks as usize);
        chunks.resize_with(max_chunks as usize, || None);
        Bucket {
            core: RwLock::new(BucketCore {
                chunks,
                map: HashMap::default(),
                idx: 0,
                gen: 1,
            }),
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
        }
    }

    /// Rebuilds a bucket from snapshot parts.
    pub(crate) fn from_parts(
        idx: u64,
        gen: u64,
        pairs: Vec<(u64, u64)>,
        chunks: Vec<Option<Chunk>>,
    ) -> Self {
        let mut map = HashMap::with_capacity_and_hasher(pairs.len(), RandomState::new());
        map.extend(pairs);
        Bucket {
            core: RwLock::new(BucketCore {
                chunks,
                map,
                idx,
                gen,
            }),
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
        }
    }

    /// Appends the (key, value) entry to the ring and points the map at it.
    ///
    /// Oversize entries are dropped without effect: their lengths cannot be
    /// encoded in the 2-byte header fields, or the record would not fit one
    /// chunk.
    pub(crate) fn set(&self, key: &[u8], value: &[u8], hash: u64) {
        let set_calls = self.set_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if set_calls % CLEAN_INTERVAL == 0 {
            self.clean();
        }

        if key.len() >= 1 << 16 || value.len() >= 1 << 16 {
            return;
        }
        let mut header = [0u8; 4];
        BigEndian::write_u16(&mut header[..2], key.len() as u16);
        BigEndian::write_u16(&mut header[2..], value.len() as u16);
        let entry_len = (header.len() + key.len() + value.len()) as u64;
        if entry_len >= CHUNK_SIZE as u64 {
            return;
        }

        let mut core = self.core.write();
        let num_chunks = core.chunks.len() as u64;
        let mut idx = core.idx;
        let mut idx_new = idx + entry_len;
        let mut chunk_idx = idx / CHUNK_SIZE as u64;
        let chunk_idx_new = idx_new / CHUNK_SIZE as u64;
        if chunk_idx_new > chunk_idx {
            // The entry would straddle a chunk boundary: move it whole into
            // the next chunk, wrapping the ring when the last chunk is hit.
            if chunk_idx_new >= num_chunks {
                idx = 0;
                idx_new = entry_len;
                chunk_idx = 0;
                core.gen += 1;
                if core.gen >= MAX_GEN {
                    core.gen = 1;
                }
            } else {
                idx = chunk_idx_new * CHUNK_SIZE as u64;
                idx_new = idx + entry_len;
                chunk_idx = chunk_idx_new;
            }
            if let Some(chunk) = core.chunks[chunk_idx as usize].as_mut() {
                chunk.clear();
            }
        }
        let gen = core.gen;
        let chunk = core.chunks[chunk_idx as usize].get_or_insert_with(Chunk::acquire);
        chunk.append(&header);
        chunk.append(key);
        chunk.append(value);
        core.map.insert(hash, idx | (gen << OFFSET_BITS));
        core.idx = idx_new;
    }

    /// Looks up `hash`, validates liveness, byte-compares the stored key and
    /// appends the value to `dst` when given. Returns whether the entry was
    /// found; an empty stored value is still found.
    pub(crate) fn get(&self, dst: Option<&mut Vec<u8>>, key: &[u8], hash: u64) -> bool {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let mut found = false;
        {
            let core = self.core.read();
            if let Some(&pos) = core.map.get(&hash) {
                let gen = pos >> OFFSET_BITS;
                let offset = pos & OFFSET_MASK;
                if core.is_live(gen, offset) {
                    let chunk_idx = (offset / CHUNK_SIZE as u64) as usize;
                    let intra = (offset % CHUNK_SIZE as u64) as usize;
                    if let Some(chunk) = core.chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
                        let data = chunk.data();
                        let key_len = BigEndian::read_u16(&data[intra..intra + 2]) as usize;
                        let value_len = BigEndian::read_u16(&data[intra + 2..intra + 4]) as usize;
                        let key_start = intra + 4;
                        if key == &data[key_start..key_start + key_len] {
                            if let Some(dst) = dst {
                                let value_start = key_start + key_len;
                                dst.extend_from_slice(&data[value_start..value_start + value_len]);
                            }
                            found = true;
                        } else {
                            self.collisions.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        if !found {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Unmaps the key. The entry bytes stay in the ring until overwritten.
    pub(crate) fn del(&self, hash: u64) {
        self.core.write().map.remove(&hash);
    }

    /// Prunes map entries whose positions the ring has already overwritten,
    /// bounding map growth between wraps.
    pub(crate) fn clean(&self) {
        let mut core = self.core.write();
        let (bucket_gen, bucket_idx) = (core.gen, core.idx);
        core.map.retain(|_, pos| {
            let gen = *pos >> OFFSET_BITS;
            let offset = *pos & OFFSET_MASK;
            gen == bucket_gen && offset < bucket_idx
                || gen + 1 == bucket_gen && offset >= bucket_idx
        });
    }

    /// Drops every entry and rewinds the ring. Chunks stay acquired.
    pub(crate) fn reset(&self) {
        let mut core = self.core.write();
        for slot in core.chunks.iter_mut() {
            if let Some(chunk) = slot.as_mut() {
                chunk.clear();
            }
        }
        core.map.clear();
        core.idx = 0;
        core.gen = 1;
        drop(core);
        self.get_calls.store(0, Ordering::Relaxed);
        self.set_calls.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.collisions.store(0, Ordering::Relaxed);
    }

    /// Adds this bucket's counters and sizes to `s`.
    pub(crate) fn update_stats(&self, s: &mut Stats) {
        s.get_calls += self.get_calls.load(Ordering::Relaxed);
        s.set_calls += self.set_calls.load(Ordering::Relaxed);
        s.misses += self.misses.load(Ordering::Relaxed);
        s.collisions += self.collisions.load(Ordering::Relaxed);

        let core = self.core.read();
        s.entries_count += core.map.len() as u64;
        let held = core.chunks.iter().filter(|c| c.is_some()).count();
        s.bytes_size += (held * CHUNK_SIZE) as u64;
        s.max_bytes_size += (core.chunks.len() * CHUNK_SIZE) as u64;
    }

    /// Copies every live key out of the ring, for the iterator's snapshot.
    pub(crate) fn copy_keys(&self) -> Vec<Vec<u8>> {
        let core = self.core.read();
        let mut keys = Vec::with_capacity(core.map.len());
        for &pos in core.map.values() {
            let gen = pos >> OFFSET_BITS;
            let offset = pos & OFFSET_MASK;
            if !core.is_live(gen, offset) {
                continue;
            }
            let chunk_idx = (offset / CHUNK_SIZE as u64) as usize;
            let intra = (offset % CHUNK_SIZE as u64) as usize;
            let Some(chunk) = core.chunks.get(chunk_idx).and_then(|c| c.as_ref()) else {
                continue;
            };
            let data = chunk.data();
            let key_len = BigEndian::read_u16(&data[intra..intra + 2]) as usize;
            keys.push(data[intra + 4..intra + 4 + key_len].to_vec());
        }
        keys
    }

    /// One consistent view of the serializable header state: cursor,
    /// generation, map pairs and the count of occupied chunk slots.
    pub(crate) fn snapshot_state(&self) -> (u64, u64, Vec<(u64, u64)>, u64) {
        let core = self.core.read();
        let pairs = core.map.iter().map(|(k, v)| (*k, *v)).collect();
        let chunks_in_use = core.chunks.iter().take_while(|c| c.is_some()).count() as u64;
        (core.idx, core.gen, pairs, chunks_in_use)
    }

    /// Copies one chunk's full 64 KiB into `buf` under a short read lock so
    /// writers can progress between chunks. Returns false for an empty slot.
    pub(crate) fn copy_chunk(&self, chunk_idx: usize, buf: &mut [u8]) -> bool {
        let core = self.core.read();
        match core.chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
            Some(chunk) => {
                buf.copy_from_slice(chunk.data());
                true
            }
            None => false,
        }
    }

    pub(crate) fn max_chunks(&self) -> usize {
        self.core.read().chunks.len()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.core.read().gen
    }

    #[cfg(test)]
    pub(crate) fn force_generation(&self, gen: u64) {
        self.core.write().gen = gen;
    }
}
