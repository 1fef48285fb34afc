use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::cache::{hash64, Cache, Stats};
use crate::pool::CHUNK_SIZE;

/// Per-fragment subkey suffix: value fingerprint, fragment index and total
/// value length, each a little-endian u64.
const SUBKEY_SUFFIX_LEN: usize = 24;

/// The metadata entry stored under the original key carries the same triple.
const META_LEN: usize = 24;

/// Big values are capped at 2 GiB.
const MAX_BIG_VALUE_LEN: u64 = 1 << 31;

/// Counters for the big-value layer, bumped once per outer call.
#[derive(Default, Debug)]
pub(crate) struct BigStats {
    set_big_calls: AtomicU64,
    get_big_calls: AtomicU64,
}

impl BigStats {
    pub(crate) fn update_stats(&self, s: &mut Stats) {
        s.set_big_calls += self.set_big_calls.load(Ordering::Relaxed);
        s.get_big_calls += self.get_big_calls.load(Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.set_big_calls.store(0, Ordering::Relaxed);
        self.get_big_calls.store(0, Ordering::Relaxed);
    }
}

/// Largest fragment payload that still fits one entry together with the
/// header and the synthetic subkey. None when the key leaves no room.
fn max_fragment_len(key_len: usize) -> Option<usize> {
    CHUNK_SIZE
        .checked_sub(4 + key_len + SUBKEY_SUFFIX_LEN + 1)
        .filter(|n| *n > 0)
}

fn push_subkey(subkey: &mut Vec<u8>, key: &[u8], value_hash: u64, index: u64, total_len: u64) {
    subkey.clear();
    subkey.extend_from_slice(key);
    subkey.write_u64::<LittleEndian>(value_hash).unwrap();
    subkey.write_u64::<LittleEndian>(index).unwrap();
    subkey.write_u64::<LittleEndian>(total_len).unwrap();
}

fn fragments_for(total_len: u64, max_fragment: usize) -> u64 {
    (total_len + max_fragment as u64 - 1) / max_fragment as u64
}

impl Cache {
    /// Stores a value of up to 2 GiB as a chain of fragment entries plus a
    /// metadata entry under `key`.
    ///
    /// The chain is as lossy as any other entry: fragments may be evicted
    /// independently, in which case [`Cache::get_big`] reports a miss rather
    /// than a truncated value.
    pub fn set_big(&self, key: &[u8], value: &[u8]) {
        self.big_stats.set_big_calls.fetch_add(1, Ordering::Relaxed);
        let total_len = value.len() as u64;
        if total_len > MAX_BIG_VALUE_LEN {
            return;
        }
        let Some(max_fragment) = max_fragment_len(key.len()) else {
            return;
        };
        let value_hash = hash64(value);

        let mut subkey = Vec::with_capacity(key.len() + SUBKEY_SUFFIX_LEN);
        let mut index = 0u64;
        let mut rest = value;
        while !rest.is_empty() {
            let take = rest.len().min(max_fragment);
            let (fragment, tail) = rest.split_at(take);
            push_subkey(&mut subkey, key, value_hash, index, total_len);
            self.set(&subkey, fragment);
            index += 1;
            rest = tail;
        }

        let mut meta = Vec::with_capacity(META_LEN);
        meta.write_u64::<LittleEndian>(value_hash).unwrap();
        meta.write_u64::<LittleEndian>(index).unwrap();
        meta.write_u64::<LittleEndian>(total_len).unwrap();
        self.set(key, &meta);
    }

    /// Reassembles a value stored with [`Cache::set_big`] and appends it to
    /// `dst`. A missing or malformed metadata entry, a missing fragment, or
    /// a fingerprint mismatch leaves `dst` untouched.
    pub fn get_big(&self, dst: &mut Vec<u8>, key: &[u8]) {
        self.big_stats.get_big_calls.fetch_add(1, Ordering::Relaxed);
        let Some((value_hash, fragments, total_len)) = self.read_big_meta(key) else {
            return;
        };
        let Some(max_fragment) = max_fragment_len(key.len()) else {
            return;
        };
        if fragments != fragments_for(total_len, max_fragment) {
            return;
        }

        let start = dst.len();
        dst.reserve(total_len as usize);
        let mut subkey = Vec::with_capacity(key.len() + SUBKEY_SUFFIX_LEN);
        for index in 0..fragments {
            push_subkey(&mut subkey, key, value_hash, index, total_len);
            if !self.has_get(dst, &subkey) || (dst.len() - start) as u64 > total_len {
                dst.truncate(start);
                return;
            }
        }
        if (dst.len() - start) as u64 != total_len || hash64(&dst[start..]) != value_hash {
            // A concurrent rewrite of the same key spliced fragments from
            // two values; report a miss instead of the hybrid.
            dst.truncate(start);
        }
    }

    /// Returns true if a complete fragment chain for `key` appears present.
    /// Fragment bytes are not copied or verified, so a racing rewrite can
    /// still turn the following [`Cache::get_big`] into a miss.
    pub fn has_big(&self, key: &[u8]) -> bool {
        let Some((value_hash, fragments, total_len)) = self.read_big_meta(key) else {
            return false;
        };
        let Some(max_fragment) = max_fragment_len(key.len()) else {
            return false;
        };
        if fragments != fragments_for(total_len, max_fragment) {
            return false;
        }
        let mut subkey = Vec::with_capacity(key.len() + SUBKEY_SUFFIX_LEN);
        for index in 0..fragments {
            push_subkey(&mut subkey, key, value_hash, index, total_len);
            if !self.has(&subkey) {
                return false;
            }
        }
        true
    }

    /// Reads and parses the metadata entry: (fingerprint, fragments, total).
    fn read_big_meta(&self, key: &[u8]) -> Option<(u64, u64, u64)> {
        let mut meta = Vec::with_capacity(META_LEN);
        if !self.has_get(&mut meta, key) || meta.len() != META_LEN {
            return None;
        }
        let value_hash = u64::from_le_bytes(meta[..8].try_into().ok()?);
        let fragments = u64::from_le_bytes(meta[8..16].try_into().ok()?);
        let total_len = u64::from_le_bytes(meta[16..].try_into().ok()?);
        if total_len > MAX_BIG_VALUE_LEN {
            return None;
        }
        Some((value_hash, fragments, total_len))
    }
}
