use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::bucket::Bucket;
use crate::cache::{Cache, BUCKETS};
use crate::error::{Error, Result};
use crate::pool::{Chunk, CHUNK_SIZE};

/// Buffer between the compressor and the file.
const FILE_BUFFER_SIZE: usize = 1024 * 1024;

/// Snapshots favor throughput over ratio; the payload is mostly raw chunks.
const COMPRESSION_LEVEL: i32 = 1;

type SnapshotEncoder<W> = zstd::stream::Encoder<'static, BufWriter<W>>;

impl Cache {
    /// Atomically saves the cache to `path`: the snapshot is written to a
    /// temporary file in the same directory and renamed over the target.
    /// May be called concurrently with any other cache operation.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = NamedTempFile::new_in(snapshot_dir(path))
            .map_err(|e| Error::snapshot("create", e))?;
        let mut zw = new_encoder(tmp.as_file())?;
        self.save_range(&mut zw, 0..BUCKETS, true)?;
        finish_encoder(zw)?;
        tmp.persist(path)
            .map_err(|e| Error::snapshot("persist", e.error))?;
        debug!(path = %path.display(), "saved cache snapshot");
        Ok(())
    }

    /// Like [`Cache::save_to_file`], but serializes `concurrency` contiguous
    /// bucket groups in parallel into segment files which are concatenated
    /// before the atomic rename. The zstd framing is self-delimiting, so the
    /// concatenation decodes as one stream.
    pub fn save_to_file_concurrent(
        &self,
        path: impl AsRef<Path>,
        concurrency: usize,
    ) -> Result<()> {
        let path = path.as_ref();
        let groups = bucket_groups(concurrency);
        if groups.len() == 1 {
            return self.save_to_file(path);
        }

        let dir = snapshot_dir(path);
        let seg_dir = tempfile::tempdir_in(dir).map_err(|e| Error::snapshot("create", e))?;
        std::thread::scope(|scope| -> Result<()> {
            let mut workers = Vec::with_capacity(groups.len());
            for (i, group) in groups.iter().enumerate() {
                let seg_path = seg_dir.path().join(format!("segment.{i}"));
                let group = group.clone();
                workers.push(scope.spawn(move || -> Result<()> {
                    let file =
                        File::create(&seg_path).map_err(|e| Error::snapshot("create", e))?;
                    let mut zw = new_encoder(&file)?;
                    self.save_range(&mut zw, group, i == 0)?;
                    finish_encoder(zw)
                }));
            }
            for worker in workers {
                worker.join().map_err(|_| Error::Snapshot {
                    stage: "write",
                    detail: "segment writer panicked".to_string(),
                })??;
            }
            Ok(())
        })?;

        let tmp = NamedTempFile::new_in(dir).map_err(|e| Error::snapshot("create", e))?;
        let mut out = BufWriter::with_capacity(FILE_BUFFER_SIZE, tmp.as_file());
        for i in 0..groups.len() {
            let seg_path = seg_dir.path().join(format!("segment.{i}"));
            let mut seg = File::open(&seg_path).map_err(|e| Error::snapshot("open", e))?;
            io::copy(&mut seg, &mut out).map_err(|e| Error::snapshot("write", e))?;
        }
        out.flush().map_err(|e| Error::snapshot("flush", e))?;
        drop(out);
        tmp.persist(path)
            .map_err(|e| Error::snapshot("persist", e.error))?;
        debug!(path = %path.display(), segments = groups.len(), "saved cache snapshot");
        Ok(())
    }

    /// Loads a cache previously written by one of the save methods.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Cache> {
        Cache::load(path.as_ref(), None)
    }

    /// Tries loading a snapshot from `path`; any failure (including a
    /// capacity mismatch against `max_bytes`) falls back to a fresh empty
    /// cache of the given capacity.
    pub fn load_from_file_or_new(path: impl AsRef<Path>, max_bytes: usize) -> Cache {
        let path = path.as_ref();
        match Cache::load(path, Some(max_bytes)) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot load cache snapshot; starting empty");
                Cache::new(max_bytes)
            }
        }
    }

    fn save_range(
        &self,
        w: &mut impl Write,
        buckets: Range<usize>,
        with_header: bool,
    ) -> Result<()> {
        if with_header {
            let max_bucket_chunks = self.buckets[0].max_chunks() as u64;
            write_u64(w, max_bucket_chunks)?;
        }
        let mut chunk_buf = vec![0u8; CHUNK_SIZE];
        for i in buckets {
            save_bucket(&self.buckets[i], w, &mut chunk_buf)?;
        }
        Ok(())
    }

    pub(crate) fn load(path: &Path, expected_max_bytes: Option<usize>) -> Result<Cache> {
        let file = File::open(path).map_err(|e| Error::snapshot("open", e))?;
        let br = BufReader::with_capacity(FILE_BUFFER_SIZE, file);
        let mut zr = zstd::stream::read::Decoder::with_buffer(br)
            .map_err(|e| Error::snapshot("read", e))?;

        let max_bucket_chunks = read_u64(&mut zr)?;
        if let Some(expected) = expected_max_bytes {
            let max_bucket_bytes = ((expected + BUCKETS - 1) / BUCKETS) as u64;
            let expected_chunks =
                (max_bucket_bytes + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64;
            if max_bucket_chunks != expected_chunks {
                return Err(Error::CapacityMismatch {
                    file_max_bytes: max_bucket_chunks * CHUNK_SIZE as u64 * BUCKETS as u64,
                    expected_max_bytes: expected as u64,
                });
            }
        }
        let max_bucket_bytes = max_bucket_chunks * CHUNK_SIZE as u64;
        if max_bucket_bytes >= 1 << 40 {
            return Err(Error::Corrupt(format!(
                "too big bucket capacity {max_bucket_bytes}; should be smaller than {}",
                1u64 << 40
            )));
        }

        let mut chunk_buf = vec![0u8; CHUNK_SIZE];
        let mut buckets = Vec::with_capacity(BUCKETS);
        for _ in 0..BUCKETS {
            buckets.push(load_bucket(&mut zr, max_bucket_chunks, &mut chunk_buf)?);
        }
        debug!(path = %path.display(), "loaded cache snapshot");
        Ok(Cache::from_buckets(buckets))
    }
}

/// The directory that receives the snapshot temp files; falling back to the
/// current directory for bare file names.
fn snapshot_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Splits the bucket array into up to `concurrency` contiguous groups.
fn bucket_groups(concurrency: usize) -> Vec<Range<usize>> {
    let workers = concurrency.clamp(1, BUCKETS);
    let per_group = (BUCKETS + workers - 1) / workers;
    let mut groups = Vec::with_capacity(workers);
    let mut start = 0;
    while start < BUCKETS {
        let end = (start + per_group).min(BUCKETS);
        groups.push(start..end);
        start = end;
    }
    groups
}

fn save_bucket(bucket: &Bucket, w: &mut impl Write, chunk_buf: &mut [u8]) -> Result<()> {
    // Drop stale map entries first so the snapshot does not bake in dead
    // positions.
    bucket.clean();

    let (idx, gen, pairs, chunks_in_use) = bucket.snapshot_state();
    write_u64(w, idx)?;
    write_u64(w, gen)?;
    write_u64(w, pairs.len() as u64)?;
    for (hash, pos) in &pairs {
        write_u64(w, *hash)?;
        write_u64(w, *pos)?;
    }

    write_u64(w, chunks_in_use)?;
    for chunk_idx in 0..chunks_in_use as usize {
        // One short read-lock per chunk so writers can progress in between.
        if !bucket.copy_chunk(chunk_idx, chunk_buf) {
            return Err(Error::Corrupt(format!(
                "chunk {chunk_idx} vanished while saving"
            )));
        }
        w.write_all(chunk_buf)
            .map_err(|e| Error::snapshot("write", e))?;
    }
    Ok(())
}

fn load_bucket(r: &mut impl Read, max_chunks: u64, chunk_buf: &mut [u8]) -> Result<Bucket> {
    let idx = read_u64(r)?;
    let gen = read_u64(r)?;

    let map_len = read_u64(r)?;
    // Entries are at least 4 bytes on the ring, bounding any honest map.
    let map_cap = max_chunks * CHUNK_SIZE as u64 / 4;
    if map_len > map_cap {
        return Err(Error::Corrupt(format!(
            "mapLen={map_len} cannot exceed {map_cap} for {max_chunks} chunks"
        )));
    }
    let mut pairs = Vec::with_capacity(map_len as usize);
    for _ in 0..map_len {
        let hash = read_u64(r)?;
        let pos = read_u64(r)?;
        pairs.push((hash, pos));
    }

    let chunks_in_use = read_u64(r)?;
    if chunks_in_use > max_chunks {
        return Err(Error::Corrupt(format!(
            "chunksInUse={chunks_in_use} cannot exceed maxChunks={max_chunks}"
        )));
    }
    let current_chunk = idx / CHUNK_SIZE as u64;
    let mut chunks: Vec<Option<Chunk>> = Vec::with_capacity(max_chunks as usize);
    for chunk_idx in 0..chunks_in_use {
        r.read_exact(chunk_buf)
            .map_err(|e| Error::snapshot("parse", e))?;
        // Chunks before the cursor are full; the cursor chunk is cut at the
        // cursor so future appends continue from it; later chunks (previous
        // generation) keep readable bytes but an empty append position.
        let len = if chunk_idx < current_chunk {
            CHUNK_SIZE
        } else if chunk_idx == current_chunk {
            (idx % CHUNK_SIZE as u64) as usize
        } else {
            0
        };
        let mut chunk = Chunk::acquire();
        chunk.fill(chunk_buf, len);
        chunks.push(Some(chunk));
    }
    chunks.resize_with(max_chunks as usize, || None);

    Ok(Bucket::from_parts(idx, gen, pairs, chunks))
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(v)
        .map_err(|e| Error::snapshot("write", e))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    r.read_u64::<LittleEndian>()
        .map_err(|e| Error::snapshot("parse", e))
}

fn new_encoder<W: Write>(w: W) -> Result<SnapshotEncoder<W>> {
    let bw = BufWriter::with_capacity(FILE_BUFFER_SIZE, w);
    zstd::stream::Encoder::new(bw, COMPRESSION_LEVEL).map_err(|e| Error::snapshot("write", e))
}

fn finish_encoder<W: Write>(zw: SnapshotEncoder<W>) -> Result<()> {
    let mut bw = zw.finish().map_err(|e| Error::snapshot("finish", e))?;
    bw.flush().map_err(|e| Error::snapshot("flush", e))?;
    Ok(())
}
