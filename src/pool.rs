use std::ptr::NonNull;
use std::slice;

use memmap2::MmapMut;
use parking_lot::Mutex;

/// Size of one chunk, the unit of ring rotation. Also the ceiling for one
/// encoded entry (4-byte header + key + value).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks carved out of a single anonymous mapping: 64 MiB per mmap call.
const CHUNKS_PER_ALLOC: usize = 1024;

/// Process-global pool of 64 KiB chunks backed by anonymous mappings, so the
/// cached bytes never sit on the managed heap. Acquire pops the free list;
/// release pushes back. One new mapping is carved whenever the list runs dry.
static POOL: Mutex<Pool> = Mutex::new(Pool {
    free: Vec::new(),
    mappings: Vec::new(),
});

struct Pool {
    free: Vec<ChunkPtr>,
    mappings: Vec<MmapMut>,
}

/// Raw pointer to a pooled 64 KiB region. The region stays valid for the
/// lifetime of its mapping, which the pool never drops outside `clear`.
#[derive(Debug)]
struct ChunkPtr(NonNull<u8>);

// Moved between threads only under the pool mutex or as part of an
// exclusively-owned Chunk.
unsafe impl Send for ChunkPtr {}

fn acquire_ptr() -> ChunkPtr {
    let mut pool = POOL.lock();
    if pool.free.is_empty() {
        let mut mapping = match MmapMut::map_anon(CHUNK_SIZE * CHUNKS_PER_ALLOC) {
            Ok(m) => m,
            Err(err) => panic!(
                "cannot allocate {} bytes via anonymous mmap: {err}",
                CHUNK_SIZE * CHUNKS_PER_ALLOC
            ),
        };
        let base = mapping.as_mut_ptr();
        for i in 0..CHUNKS_PER_ALLOC {
            // Safety: offsets stay inside the mapping just created.
            let p = unsafe { NonNull::new_unchecked(base.add(i * CHUNK_SIZE)) };
            pool.free.push(ChunkPtr(p));
        }
        pool.mappings.push(mapping);
    }
    pool.free.pop().unwrap()
}

fn release_ptr(ptr: ChunkPtr) {
    POOL.lock().free.push(ptr);
}

/// Returns `(total_reserved, free)` pool bytes.
pub fn memory_stats() -> (u64, u64) {
    let pool = POOL.lock();
    let total = (pool.mappings.len() * CHUNKS_PER_ALLOC * CHUNK_SIZE) as u64;
    let free = (pool.free.len() * CHUNK_SIZE) as u64;
    (total, free)
}

/// Releases every mapping back to the operating system and empties the free
/// list. Intended for test teardown.
///
/// # Safety
///
/// Every cache must have been dropped first: any chunk still held by a live
/// cache points into a mapping this call unmaps.
pub unsafe fn clear() {
    let mut pool = POOL.lock();
    pool.free.clear();
    pool.mappings.clear();
}

/// An owned 64 KiB storage region acquired from the pool.
///
/// `len` is only the append cursor. Reads go through [`Chunk::data`], the
/// full-capacity view: after a ring reset or a snapshot load, live entries
/// of the previous generation sit beyond `len` until overwritten.
#[derive(Debug)]
pub(crate) struct Chunk {
    ptr: ChunkPtr,
    len: usize,
}

// A Chunk is the sole owner of its region; all access is mediated by the
// owning bucket's lock.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Takes a chunk from the pool. Panics if the backing mmap fails, which
    /// is treated as out-of-memory.
    pub(crate) fn acquire() -> Self {
        Chunk {
            ptr: acquire_ptr(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Resets the append cursor. The bytes are left in place.
    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// Full 64 KiB view, independent of the append cursor.
    pub(crate) fn data(&self) -> &[u8] {
        // Safety: the region is CHUNK_SIZE bytes, exclusively ours, and its
        // mapping outlives the chunk.
        unsafe { slice::from_raw_parts(self.ptr.0.as_ptr(), CHUNK_SIZE) }
    }

    /// Appends `bytes` at the cursor. The caller has already checked that
    /// the entry fits the chunk.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        debug_assert!(self.len + bytes.len() <= CHUNK_SIZE);
        // Safety: bounds checked above; exclusive access through &mut self.
        unsafe {
            let dst = self.ptr.0.as_ptr().add(self.len);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        self.len += bytes.len();
    }

    /// Overwrites the whole region and positions the cursor, used when
    /// restoring a chunk from a snapshot.
    pub(crate) fn fill(&mut self, bytes: &[u8], len: usize) {
        debug_assert_eq!(bytes.len(), CHUNK_SIZE);
        debug_assert!(len <= CHUNK_SIZE);
        // Safety: exact-size copy into our exclusively-owned region.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.0.as_ptr(), CHUNK_SIZE);
        }
        self.len = len;
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        release_ptr(ChunkPtr(self.ptr.0));
    }
}
