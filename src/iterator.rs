use crate::cache::{Cache, BUCKETS};
use crate::error::{Error, Result};

/// A key-value pair yielded by [`CacheIterator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Entry {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Best-effort walk over the live entries of a cache.
///
/// Keys are snapshotted one bucket at a time; each yielded value is re-read
/// from the live cache, so entries evicted or displaced since the snapshot
/// are skipped. No consistency is guaranteed across buckets.
pub struct CacheIterator<'a> {
    cache: &'a Cache,
    bucket_idx: usize,
    keys: Vec<Vec<u8>>,
    key_idx: usize,
    current: Entry,
    valid: bool,
}

impl Cache {
    /// Creates an iterator over the cache's entries.
    pub fn iter(&self) -> CacheIterator<'_> {
        CacheIterator {
            cache: self,
            bucket_idx: 0,
            keys: self.buckets[0].copy_keys(),
            key_idx: 0,
            current: Entry::default(),
            valid: false,
        }
    }
}

impl CacheIterator<'_> {
    /// Moves to the next element and returns true if one exists.
    pub fn set_next(&mut self) -> bool {
        self.valid = false;
        loop {
            while self.key_idx < self.keys.len() {
                let key = &self.keys[self.key_idx];
                self.key_idx += 1;
                let mut value = Vec::new();
                if self.cache.has_get(&mut value, key) {
                    self.current = Entry {
                        key: key.clone(),
                        value,
                    };
                    self.valid = true;
                    return true;
                }
                // Evicted or displaced since the key snapshot was taken.
            }
            self.bucket_idx += 1;
            if self.bucket_idx >= BUCKETS {
                return false;
            }
            self.keys = self.cache.buckets[self.bucket_idx].copy_keys();
            self.key_idx = 0;
        }
    }

    /// Returns the current entry, or [`Error::IterationFinished`] when no
    /// element has been yielded or the walk is exhausted.
    pub fn value(&self) -> Result<&Entry> {
        if !self.valid {
            return Err(Error::IterationFinished);
        }
        Ok(&self.current)
    }
}

impl Iterator for CacheIterator<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.set_next() {
            Some(self.current.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_cache_finishes_immediately() {
        let c = Cache::new(1024);
        let mut it = c.iter();
        assert_eq!(it.value(), Err(Error::IterationFinished));
        assert!(!it.set_next());
        assert_eq!(it.value(), Err(Error::IterationFinished));
    }

    #[test]
    fn test_visits_every_entry_once() {
        let items = 1_000usize;
        let c = Cache::new(30 * items);
        let mut expected = HashMap::new();
        for i in 0..items {
            let k = format!("key {i}").into_bytes();
            let v = format!("value {i}").into_bytes();
            c.set(&k, &v);
            expected.insert(k, v);
        }

        let mut it = c.iter();
        let mut seen = 0usize;
        while it.set_next() {
            let entry = it.value().expect("valid entry after set_next");
            let want = expected
                .get(entry.key())
                .unwrap_or_else(|| panic!("unexpected key {:?}", entry.key()));
            assert_eq!(entry.value(), &want[..]);
            seen += 1;
        }
        assert_eq!(seen, items, "every live entry is visited once");
        assert_eq!(it.value(), Err(Error::IterationFinished));
    }

    #[test]
    fn test_deleted_entries_are_skipped() {
        let c = Cache::new(1024);
        c.set(b"keep", b"1");
        c.set(b"drop", b"2");

        let mut it = c.iter();
        c.del(b"drop");

        let mut seen = Vec::new();
        for entry in it.by_ref() {
            seen.push(entry.key().to_vec());
        }
        assert_eq!(seen, vec![b"keep".to_vec()]);
    }

    #[test]
    fn test_std_iterator_adapter() {
        let c = Cache::new(1024);
        c.set(b"a", b"1");
        c.set(b"b", b"2");
        let count = c.iter().count();
        assert_eq!(count, 2);
    }
}
