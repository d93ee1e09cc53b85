//! # Mapped Chunks
//!
//! A [`Chunk`] is one contiguous memory-mapped window over a run of entry
//! slots in the backing file. Chunks are created lazily the first time any
//! entry inside them is touched and released when the last entry handle into
//! them drops.
//!
//! ## Lifetime Model
//!
//! ```text
//! ChunkCache ── Weak<Chunk> ──┐
//!                             ├──> Chunk (owns the mapping)
//! Entry ─────── Arc<Chunk> ───┘
//! ```
//!
//! Entry handles hold strong references; the cache holds weak ones. The
//! mapping is therefore unmapped exactly when the last live entry goes away,
//! and the cache never keeps an idle chunk alive. Dead weak slots are pruned
//! opportunistically on lookup and on entry release.
//!
//! ## Remapping After Growth
//!
//! A chunk maps `[i * chunk_length, min((i+1) * chunk_length, file_length))`
//! at creation time. Growing the file never invalidates existing mappings,
//! but a tail chunk mapped before the growth may be shorter than a slot that
//! now exists within its range. [`ChunkCache::get_covering`] treats such a
//! chunk as a miss so the caller can map a fresh, longer window; the stale
//! chunk stays alive until its outstanding entries drop.
//!
//! ## Sharing
//!
//! The mapping is read/write and shared: bytes written by a renderer are
//! visible to every reader of the same in-memory range and reach the backing
//! file on flush. `MmapRaw` is used rather than `MmapMut` because entry
//! handles to *different* slots of one chunk are read and written
//! concurrently, which a single `&mut` borrow cannot express. All access
//! goes through raw pointers with the aliasing protocol enforced one level
//! up (per-slot monitors and the in-use pin).

use std::fs::File;
use std::sync::{Arc, Weak};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::{MmapOptions, MmapRaw};

/// One mapped window over a range of entry slots.
#[derive(Debug)]
pub struct Chunk {
    index: u32,
    map: MmapRaw,
}

impl Chunk {
    /// Maps `len` bytes of `file` starting at `offset`. The offset must be
    /// page-aligned, which holds for every chunk boundary because entry
    /// lengths are page multiples.
    pub(crate) fn map(file: &File, index: u32, offset: u64, len: usize) -> Result<Arc<Self>> {
        ensure!(len > 0, "cannot map empty chunk {}", index);

        let map = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
            .wrap_err_with(|| {
                format!("failed to map chunk {} ({} bytes at offset {})", index, len, offset)
            })?;

        Ok(Arc::new(Self { index, map }))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Mapped length. May be shorter than the nominal chunk length for the
    /// final chunk of the file.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Whether the mapping covers `len` bytes starting at `offset` (both
    /// chunk-relative).
    pub fn covers(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.map.len())
    }

    /// Base pointer of the mapping. Callers must stay within `len()` and
    /// follow the slot aliasing protocol.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Asks the OS to write the given chunk-relative range back to the file.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        ensure!(
            self.covers(offset, len),
            "flush range {}+{} exceeds chunk {} length {}",
            offset,
            len,
            self.index,
            self.map.len()
        );
        self.map
            .flush_range(offset, len)
            .wrap_err_with(|| format!("failed to flush chunk {}", self.index))
    }

    /// Hints the kernel to fault in the given chunk-relative range.
    pub fn advise_willneed(&self, offset: usize, len: usize) {
        if !self.covers(offset, len) || len == 0 {
            return;
        }

        #[cfg(unix)]
        // SAFETY: the range was bounds-checked against the mapping above, and
        // MADV_WILLNEED is advisory only.
        unsafe {
            libc::madvise(
                self.map.as_mut_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = (offset, len);
    }
}

/// Registry of live chunks by chunk index.
///
/// Holds only weak references; see the module docs for the lifetime model.
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: HashMap<u32, Weak<Chunk>>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self {
            chunks: HashMap::new(),
        }
    }

    /// Returns the cached chunk if it is still alive and covers the given
    /// chunk-relative range. A live chunk that is too short (mapped before
    /// the file grew) is treated as a miss.
    pub fn get_covering(&mut self, index: u32, offset: usize, len: usize) -> Option<Arc<Chunk>> {
        match self.chunks.get(&index) {
            Some(weak) => match weak.upgrade() {
                Some(chunk) if chunk.covers(offset, len) => Some(chunk),
                Some(_) => None,
                None => {
                    self.chunks.remove(&index);
                    None
                }
            },
            None => None,
        }
    }

    /// Inserts or replaces the cache slot for a chunk.
    pub fn insert(&mut self, chunk: &Arc<Chunk>) {
        self.chunks.insert(chunk.index(), Arc::downgrade(chunk));
    }

    /// Drops cache slots whose chunks have been unmapped.
    pub fn prune(&mut self) {
        self.chunks.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Number of chunks currently kept alive by outstanding entries.
    pub fn live_count(&self) -> usize {
        self.chunks.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn file_of_len(len: usize) -> (tempfile::TempDir, File) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.bin");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        (dir, file)
    }

    #[test]
    fn mapping_is_released_when_last_reference_drops() {
        let (_dir, file) = file_of_len(8192);
        let mut cache = ChunkCache::new();

        let chunk = Chunk::map(&file, 0, 0, 8192).unwrap();
        cache.insert(&chunk);
        assert_eq!(cache.live_count(), 1);
        assert!(cache.get_covering(0, 0, 8192).is_some());

        drop(chunk);
        assert_eq!(cache.live_count(), 0);
        assert!(cache.get_covering(0, 0, 8192).is_none());
    }

    #[test]
    fn short_chunk_is_a_miss_for_longer_range() {
        let (_dir, file) = file_of_len(8192);
        let mut cache = ChunkCache::new();

        let chunk = Chunk::map(&file, 0, 0, 4096).unwrap();
        cache.insert(&chunk);

        assert!(cache.get_covering(0, 0, 4096).is_some());
        assert!(cache.get_covering(0, 4096, 4096).is_none());

        // Remapping the grown range replaces the slot; the short mapping
        // stays alive through its own handle.
        let longer = Chunk::map(&file, 0, 0, 8192).unwrap();
        cache.insert(&longer);
        assert!(cache.get_covering(0, 4096, 4096).is_some());
        assert_eq!(chunk.len(), 4096);
    }

    #[test]
    fn writes_are_visible_to_other_mappings() {
        let (_dir, file) = file_of_len(4096);
        let chunk = Chunk::map(&file, 0, 0, 4096).unwrap();

        // SAFETY: the chunk maps 4096 bytes and no other handle aliases this
        // range.
        unsafe {
            chunk.as_ptr().write(0xAB);
        }
        chunk.flush_range(0, 4096).unwrap();

        let second = Chunk::map(&file, 0, 0, 4096).unwrap();
        // SAFETY: reading one byte inside the mapped range.
        let byte = unsafe { second.as_ptr().read() };
        assert_eq!(byte, 0xAB);
    }

    #[test]
    fn prune_drops_dead_slots() {
        let (_dir, file) = file_of_len(4096);
        let mut cache = ChunkCache::new();

        let chunk = Chunk::map(&file, 0, 0, 4096).unwrap();
        cache.insert(&chunk);
        drop(chunk);

        cache.prune();
        assert_eq!(cache.live_count(), 0);
    }
}
