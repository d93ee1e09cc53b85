//! # Image Table Orchestrator
//!
//! An [`ImageTable`] is a persistent, memory-mapped store of pre-rendered
//! pixel buffers for a single image format. Consumers either render-and-store
//! an image keyed by an opaque entity id, or fetch a previously stored one;
//! fetches alias the mapped file directly, so the hot path involves no
//! decode, no scaling, and no copy.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  ImageTable (set / get / exists / delete) │
//! ├──────────────┬──────────────┬─────────────┤
//! │  IndexState  │  ChunkCache  │  per-slot   │
//! │  (MRU, pins) │  (mappings)  │  monitors   │
//! ├──────────────┴──────────────┴─────────────┤
//! │      <name>.imageTable   (mmap'd slots)   │
//! │      <name>.metadata     (writer thread)  │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! One table mutex guards all mutable state: the index maps, the MRU order,
//! the in-use pins, the chunk cache, the monitor map, and the file length.
//! The mutex is released around the two operations that can be slow on
//! behalf of someone else:
//!
//! - the caller's draw callback, which renders pixels; and
//! - metadata serialization and writing, which runs on a dedicated thread.
//!
//! Concurrent draws into the *same* slot are serialized by a per-slot
//! monitor: a stable `Arc<Mutex<()>>` fetched from a map that is never
//! pruned, so lock identity per slot holds for the table's lifetime. Draws
//! into different slots run in parallel.
//!
//! ## Eviction & Aliasing Safety
//!
//! A fetched image pins both its entity (in the in-use multiset) and the
//! slot it aliases, until the image drops. The allocator never selects a
//! pinned entity as an eviction victim and never hands out a pinned slot,
//! so a renderer can never overwrite bytes a reader is displaying:
//!
//! - re-rendering an entity with live images renders into a *fresh* slot
//!   and repoints the index there; the readers' old bytes stay pinned and
//!   untouched until released;
//! - deleting an entity with live images frees its index entry but the
//!   aliased slot stays out of the free pool until the last image drops;
//! - slots with an in-flight draw are withheld from allocation and their
//!   entities from eviction, so two writers meet only on the same slot,
//!   where the monitor serializes them.
//!
//! A fetch that lands while the same entity's draw is still in flight
//! observes the bookkeeping (updated under the table lock before the draw
//! begins) and may alias pixels mid-render; the next completed draw is the
//! content callers see thereafter.
//!
//! ## Crash Behavior
//!
//! Metadata persistence is best-effort: it is rewritten asynchronously after
//! every mutation, overwriting in place. On open, stale metadata is
//! reconciled against the data file: entries pointing beyond the file reset
//! the table, and a fingerprint mismatch with the current format discards
//! both files.

mod metadata;
mod state;

pub use metadata::{MetadataSnapshot, MetadataWriter};
pub use state::{Allocation, IndexState, RestoredEntry};

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{self, METADATA_FILE_EXTENSION, TABLE_FILE_EXTENSION};
use crate::format::ImageFormat;
use crate::image::{CachedImage, PixelBuffer};
use crate::layout::TableLayout;
use crate::storage::{Chunk, ChunkCache, Entry};

/// Persistent, memory-mapped image store for one format.
///
/// All operations take `&self` and may be called from any thread.
pub struct ImageTable {
    shared: Arc<TableShared>,
}

struct TableShared {
    format: ImageFormat,
    layout: TableLayout,
    data_path: PathBuf,
    core: Mutex<TableCore>,
    metadata: MetadataWriter,
}

struct TableCore {
    file: File,
    file_length: u64,
    state: IndexState,
    chunks: ChunkCache,
    monitors: HashMap<u32, Arc<Mutex<()>>>,
}

impl ImageTable {
    /// Opens (creating if missing) the table for `format` in the process
    /// cache directory.
    pub fn open(format: ImageFormat) -> Result<Self> {
        Self::open_in(config::cache_directory(), format)
    }

    /// Opens (creating if missing) the table for `format` in `dir`.
    ///
    /// Fails only when the backing file cannot be opened. Stale or
    /// unreadable metadata, a changed format fingerprint, and a data file
    /// whose length disagrees with the metadata are all reconciled here,
    /// not reported as errors.
    pub fn open_in(dir: impl AsRef<Path>, format: ImageFormat) -> Result<Self> {
        let dir = dir.as_ref();
        let layout = TableLayout::for_format(&format);

        if format.maximum_count() < layout.entries_per_chunk() {
            warn!(
                table = %format.name(),
                configured = format.maximum_count(),
                entries_per_chunk = layout.entries_per_chunk(),
                "configured maximum holds less than one chunk; raising effective maximum"
            );
        }

        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create cache directory '{}'", dir.display()))?;

        let data_path = dir.join(format!("{}.{}", format.name(), TABLE_FILE_EXTENSION));
        let meta_path = dir.join(format!("{}.{}", format.name(), METADATA_FILE_EXTENSION));

        let restored = Self::load_metadata(&format, &data_path, &meta_path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .wrap_err_with(|| format!("failed to open image table '{}'", data_path.display()))?;

        let mut file_length = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat image table '{}'", data_path.display()))?
            .len();

        let entry_length = layout.entry_length() as u64;
        if file_length % entry_length != 0 {
            let whole = file_length - file_length % entry_length;
            warn!(
                table = %format.name(),
                file_length,
                entry_length,
                "data file holds a partial entry; truncating to {} bytes",
                whole
            );
            if file.set_len(whole).is_ok() {
                file_length = whole;
            }
        }

        let mut state = IndexState::new();
        let mut reconciled = false;
        if let Some(snapshot) = restored {
            let entry_count = layout.entry_count(file_length);
            let fits = snapshot.entries.len() <= entry_count as usize
                && snapshot.entries.iter().all(|r| r.slot < entry_count);
            if fits {
                state.restore(&snapshot.entries);
            } else {
                warn!(
                    table = %format.name(),
                    entries = snapshot.entries.len(),
                    entry_count,
                    "metadata references entries beyond the data file; resetting table"
                );
                if file.set_len(0).is_ok() {
                    file_length = 0;
                }
                reconciled = true;
            }
        }

        let metadata = MetadataWriter::spawn(meta_path);

        let shared = Arc::new(TableShared {
            format,
            layout,
            data_path,
            core: Mutex::new(TableCore {
                file,
                file_length,
                state,
                chunks: ChunkCache::new(),
                monitors: HashMap::new(),
            }),
            metadata,
        });

        if reconciled {
            let snapshot = {
                let core = shared.core.lock();
                shared.snapshot(&core)
            };
            shared.metadata.submit(snapshot);
        }

        Ok(Self { shared })
    }

    fn load_metadata(
        format: &ImageFormat,
        data_path: &Path,
        meta_path: &Path,
    ) -> Option<MetadataSnapshot> {
        let bytes = match fs::read(meta_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    table = %format.name(),
                    error = %err,
                    "failed to read metadata; starting with an empty index"
                );
                return None;
            }
        };

        let snapshot = match MetadataSnapshot::decode(&bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    table = %format.name(),
                    error = %err,
                    "unreadable metadata; starting with an empty index"
                );
                return None;
            }
        };

        if snapshot.fingerprint != format.fingerprint() {
            info!(
                table = %format.name(),
                "stored format fingerprint differs; discarding both cache files"
            );
            let _ = fs::remove_file(data_path);
            let _ = fs::remove_file(meta_path);
            return None;
        }

        Some(snapshot)
    }

    /// Renders and stores an image for `entity`, recording `source` as its
    /// originating source image.
    ///
    /// Bookkeeping (slot assignment, header ids, MRU promotion) completes
    /// before `draw` runs, and the table lock is not held during the draw.
    /// Failures are logged and swallowed; a store that cannot proceed leaves
    /// the table as it was.
    pub fn set_entry<F>(&self, entity: Uuid, source: Uuid, draw: F)
    where
        F: FnOnce(&mut PixelBuffer<'_>),
    {
        if entity.is_nil() || source.is_nil() {
            return;
        }

        if let Err(err) = self.shared.set_inner(entity, source, draw) {
            warn!(
                table = %self.shared.format.name(),
                %entity,
                error = ?err,
                "failed to store entry"
            );
        }
    }

    /// Returns the stored image for `entity`, or `None` on a miss.
    ///
    /// The header ids must match both arguments; a mismatch (the source was
    /// replaced since the render) deletes the stale entry and reports a
    /// miss. The returned image aliases the mapped file and pins `entity`
    /// against eviction until dropped. With `preheat`, the image's pages are
    /// faulted in before returning.
    pub fn new_image_for(&self, entity: Uuid, source: Uuid, preheat: bool) -> Option<CachedImage> {
        if entity.is_nil() || source.is_nil() {
            return None;
        }

        let entry = TableShared::checked_entry(&self.shared, entity, source, true)?;

        if preheat {
            entry.preheat();
        }

        Some(CachedImage::new(entry, &self.shared.format, &self.shared.layout))
    }

    /// Whether a stored image for `(entity, source)` exists.
    ///
    /// Performs the same header verification as [`Self::new_image_for`],
    /// including deletion of a stale entry, without constructing an image or
    /// pinning the entity.
    pub fn entry_exists(&self, entity: Uuid, source: Uuid) -> bool {
        if entity.is_nil() || source.is_nil() {
            return false;
        }

        TableShared::checked_entry(&self.shared, entity, source, false).is_some()
    }

    /// Removes `entity` from the table. The slot bytes are not zeroed; the
    /// slot becomes eligible for reuse.
    pub fn delete_entry(&self, entity: Uuid) {
        if entity.is_nil() {
            return;
        }

        let snapshot = {
            let mut core = self.shared.core.lock();
            if core.state.remove(&entity).is_none() {
                return;
            }
            self.shared.snapshot(&core)
        };
        self.shared.metadata.submit(snapshot);
    }

    /// Discards every stored image and truncates the backing file.
    ///
    /// Outstanding [`CachedImage`]s alias the truncated file and must not be
    /// read afterwards.
    pub fn reset(&self) {
        let snapshot = {
            let mut core = self.shared.core.lock();
            core.state.clear();
            core.chunks.clear();
            match core.file.set_len(0) {
                Ok(()) => core.file_length = 0,
                Err(err) => {
                    warn!(
                        table = %self.shared.format.name(),
                        error = %err,
                        "failed to truncate data file during reset"
                    );
                }
            }
            self.shared.snapshot(&core)
        };
        self.shared.metadata.submit(snapshot);
    }

    /// Blocks until all queued metadata writes have reached the filesystem.
    pub fn flush_metadata(&self) {
        self.shared.metadata.flush();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.shared.core.lock().state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.core.lock().state.is_empty()
    }

    /// Number of entry slots the backing file currently holds.
    pub fn entry_count(&self) -> u32 {
        let core = self.shared.core.lock();
        self.shared.layout.entry_count(core.file_length)
    }

    /// Current byte length of the backing file.
    pub fn file_length(&self) -> u64 {
        self.shared.core.lock().file_length
    }

    /// Slot index currently assigned to `entity`.
    pub fn index_of(&self, entity: Uuid) -> Option<u32> {
        self.shared.core.lock().state.index_of(&entity)
    }

    /// Entity ids in recency order, most recent first.
    pub fn mru_order(&self) -> Vec<Uuid> {
        self.shared.core.lock().state.mru_order().to_vec()
    }

    pub fn format(&self) -> &ImageFormat {
        &self.shared.format
    }

    pub fn layout(&self) -> &TableLayout {
        &self.shared.layout
    }

    /// Path of the backing data file.
    pub fn data_path(&self) -> &Path {
        &self.shared.data_path
    }
}

impl Drop for ImageTable {
    fn drop(&mut self) {
        // The writer thread drains its mailbox on shutdown; waiting here
        // keeps the common close path deterministic for reopen.
        self.shared.metadata.flush();
    }
}

impl std::fmt::Debug for ImageTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTable")
            .field("format", &self.shared.format.name())
            .field("entries", &self.len())
            .finish()
    }
}

impl TableShared {
    fn snapshot(&self, core: &TableCore) -> MetadataSnapshot {
        let entries = core
            .state
            .entries()
            .map(|(entity, slot, source)| RestoredEntry {
                entity,
                source,
                slot,
                mru_position: core.state.mru_position(&entity),
            })
            .collect();

        MetadataSnapshot {
            fingerprint: self.format.fingerprint(),
            entries,
        }
    }

    /// Maps (or reuses) the chunk containing `slot` and returns a fresh
    /// entry handle over it. Caller holds the table lock.
    fn entry_for(&self, core: &mut TableCore, slot: u32) -> Result<Entry> {
        let chunk_index = self.layout.chunk_of(slot);
        let offset_in_chunk = self.layout.offset_in_chunk(slot);
        let entry_length = self.layout.entry_length();

        let chunk = match core.chunks.get_covering(chunk_index, offset_in_chunk, entry_length) {
            Some(chunk) => chunk,
            None => {
                let (offset, len) = self.layout.chunk_range(chunk_index, core.file_length);
                eyre::ensure!(
                    offset_in_chunk + entry_length <= len,
                    "entry {} lies beyond the data file ({} bytes)",
                    slot,
                    core.file_length
                );
                let chunk = Chunk::map(&core.file, chunk_index, offset, len)?;
                core.chunks.insert(&chunk);
                chunk
            }
        };

        Ok(Entry::new(
            chunk,
            offset_in_chunk,
            slot,
            entry_length,
            self.layout.image_bytes(),
        ))
    }

    fn grow_to(&self, core: &mut TableCore, entry_count: u32) -> Result<()> {
        let new_length = self.layout.file_length(entry_count);
        core.file
            .set_len(new_length)
            .wrap_err_with(|| format!("failed to grow image table to {} bytes", new_length))?;
        core.file_length = new_length;
        Ok(())
    }

    fn set_inner<F>(&self, entity: Uuid, source: Uuid, draw: F) -> Result<()>
    where
        F: FnOnce(&mut PixelBuffer<'_>),
    {
        let (mut entry, monitor, snapshot) = {
            let mut core = self.core.lock();

            let existing = core.state.index_of(&entity);
            let slot = match existing {
                // Overwriting in place is safe only while no image aliases
                // the slot; the per-slot monitor below serializes against
                // other writers.
                Some(slot) if !core.state.is_in_use(&entity) => slot,
                _ => {
                    if existing.is_some() {
                        debug!(
                            table = %self.format.name(),
                            %entity,
                            "entry is aliased by live images; rendering into a fresh slot"
                        );
                    }

                    let entry_count = self.layout.entry_count(core.file_length);
                    let allocation = core
                        .state
                        .allocate(entry_count, self.layout.effective_maximum());

                    for victim in &allocation.evicted {
                        debug!(
                            table = %self.format.name(),
                            entity = %victim,
                            "evicted least-recently-used entry"
                        );
                    }
                    if allocation.pressure {
                        warn!(
                            table = %self.format.name(),
                            slot = allocation.index,
                            effective_maximum = self.layout.effective_maximum(),
                            "every resident entry is in use; growing past the configured maximum"
                        );
                    }
                    allocation.index
                }
            };

            if slot >= self.layout.entry_count(core.file_length) {
                // An eviction always frees an unpinned in-file slot that the
                // candidate scan then returns, so reaching a grow means the
                // allocator evicted nothing: a failed grow leaves the index
                // exactly as it was.
                self.grow_to(&mut core, slot + 1)?;
            }

            let mut entry = self.entry_for(&mut core, slot)?;
            entry.set_header_ids(entity, source);
            core.state.insert(entity, source, slot);
            core.state.begin_write(slot);

            let monitor = Arc::clone(
                core.monitors
                    .entry(slot)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            );
            let snapshot = self.snapshot(&core);

            (entry, monitor, snapshot)
        };

        self.metadata.submit(snapshot);

        let flushed = {
            let _slot_guard = monitor.lock();
            let mut buffer = PixelBuffer::new(entry.pixels_mut(), &self.format, &self.layout);
            draw(&mut buffer);
            entry.flush()
        };

        self.core.lock().state.end_write(entry.index());
        flushed
    }

    /// Looks up `entity`, verifies the slot header against both ids, and
    /// returns an entry handle. A header mismatch deletes the stale entry.
    /// With `pin`, the entity is promoted and pinned and the handle releases
    /// the pin on drop.
    fn checked_entry(this: &Arc<Self>, entity: Uuid, source: Uuid, pin: bool) -> Option<Entry> {
        let self_ = &**this;
        let mut core = self_.core.lock();

        let slot = match core.state.index_of(&entity) {
            Some(slot) => slot,
            None => {
                debug!(table = %self_.format.name(), %entity, "cache miss");
                return None;
            }
        };

        let mut entry = match self_.entry_for(&mut core, slot) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    table = %self_.format.name(),
                    %entity,
                    slot,
                    error = ?err,
                    "failed to map entry"
                );
                return None;
            }
        };

        if entry.entity_id() != entity || entry.source_id() != source {
            debug!(
                table = %self_.format.name(),
                %entity,
                expected_source = %source,
                stored_source = %entry.source_id(),
                "stale entry header; deleting"
            );
            drop(entry);
            core.state.remove(&entity);
            let snapshot = self_.snapshot(&core);
            drop(core);
            self_.metadata.submit(snapshot);
            return None;
        }

        if pin {
            core.state.touch(entity);
            core.state.pin(entity, slot);

            let weak = Arc::downgrade(this);
            entry.set_release(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let mut core = shared.core.lock();
                    core.state.unpin(&entity, slot);
                    core.chunks.prune();
                }
            }));
        }

        Some(entry)
    }
}
