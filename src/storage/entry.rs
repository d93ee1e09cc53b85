//! # Entry Handles
//!
//! An [`Entry`] is a handle over one slot of a mapped chunk: the pixel bytes
//! plus the 32-byte trailing header (entity id, source-image id). Creating an
//! entry pins its chunk's mapping through an `Arc`; a single slot may have
//! several concurrent handles.
//!
//! An entry may carry a one-shot release callback, run when the handle drops.
//! The orchestrator uses this to decrement the in-use count for the entity an
//! image was vended for, which is what gates eviction against in-flight
//! readers.
//!
//! ## Aliasing Protocol
//!
//! Slot bytes live in shared mapped memory, so the usual `&`/`&mut` rules
//! cannot be checked by the compiler. The table enforces them dynamically:
//!
//! - writes to a slot only happen under that slot's monitor (one writer);
//! - a slot with outstanding reader handles is pinned in-use and is never
//!   selected for reuse, so no writer overlaps a reader of the same slot;
//! - handles to different slots never overlap in memory.

use std::sync::Arc;

use eyre::Result;
use uuid::Uuid;

use super::chunk::Chunk;
use crate::config::{self, ENTITY_ID_SIZE, ENTRY_HEADER_SIZE};

pub(crate) type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Handle over one entry slot of a mapped chunk.
pub struct Entry {
    chunk: Arc<Chunk>,
    offset: usize,
    index: u32,
    entry_length: usize,
    image_bytes: usize,
    release: Option<ReleaseFn>,
}

impl Entry {
    pub(crate) fn new(
        chunk: Arc<Chunk>,
        offset: usize,
        index: u32,
        entry_length: usize,
        image_bytes: usize,
    ) -> Self {
        debug_assert!(chunk.covers(offset, entry_length));
        debug_assert!(image_bytes + ENTRY_HEADER_SIZE <= entry_length);

        Self {
            chunk,
            offset,
            index,
            entry_length,
            image_bytes,
            release: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Logical pixel byte length (stride times height), excluding padding
    /// and header.
    pub fn image_bytes(&self) -> usize {
        self.image_bytes
    }

    fn base_ptr(&self) -> *mut u8 {
        // SAFETY: offset + entry_length was validated against the chunk
        // mapping at construction.
        unsafe { self.chunk.as_ptr().add(self.offset) }
    }

    fn header_ptr(&self) -> *mut u8 {
        // SAFETY: the header occupies the final ENTRY_HEADER_SIZE bytes of
        // the slot, inside the validated range.
        unsafe { self.base_ptr().add(self.entry_length - ENTRY_HEADER_SIZE) }
    }

    /// Pixel bytes of this slot.
    pub fn pixels(&self) -> &[u8] {
        // SAFETY: base_ptr is valid for entry_length >= image_bytes bytes and
        // the mapping outlives self via the chunk Arc. Concurrent writers to
        // this range are excluded by the aliasing protocol (module docs).
        unsafe { std::slice::from_raw_parts(self.base_ptr(), self.image_bytes) }
    }

    /// Mutable pixel bytes. Callers must hold the slot's monitor.
    pub(crate) fn pixels_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for pixels(); exclusivity over this range comes from the
        // per-slot monitor held by the writer.
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr(), self.image_bytes) }
    }

    fn header_id(&self, at: usize) -> Uuid {
        let mut bytes = [0u8; ENTITY_ID_SIZE];
        // SAFETY: the header range was validated at construction; at is 0 or
        // ENTITY_ID_SIZE, both inside it.
        unsafe {
            std::ptr::copy_nonoverlapping(self.header_ptr().add(at), bytes.as_mut_ptr(), ENTITY_ID_SIZE);
        }
        Uuid::from_bytes(bytes)
    }

    /// Entity id recorded in the slot header.
    pub fn entity_id(&self) -> Uuid {
        self.header_id(0)
    }

    /// Source-image id recorded in the slot header.
    pub fn source_id(&self) -> Uuid {
        self.header_id(ENTITY_ID_SIZE)
    }

    /// Writes both header ids. Called under the table lock before rendering.
    pub(crate) fn set_header_ids(&mut self, entity: Uuid, source: Uuid) {
        // SAFETY: the header range was validated at construction; the two
        // writes cover exactly ENTRY_HEADER_SIZE bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                entity.as_bytes().as_ptr(),
                self.header_ptr(),
                ENTITY_ID_SIZE,
            );
            std::ptr::copy_nonoverlapping(
                source.as_bytes().as_ptr(),
                self.header_ptr().add(ENTITY_ID_SIZE),
                ENTITY_ID_SIZE,
            );
        }
    }

    /// Asks the OS to write this slot back to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.chunk.flush_range(self.offset, self.entry_length)
    }

    /// Faults the slot's pages in so a later blit does not stall.
    pub fn preheat(&self) {
        self.chunk.advise_willneed(self.offset, self.entry_length);

        let page = config::page_size();
        let mut touched = 0usize;
        while touched < self.image_bytes {
            // SAFETY: touched < image_bytes <= mapped slot length; the
            // volatile read cannot be elided.
            unsafe {
                std::ptr::read_volatile(self.base_ptr().add(touched));
            }
            touched += page;
        }
    }

    /// Registers a callback to run exactly once when this handle drops.
    pub(crate) fn set_release(&mut self, release: ReleaseFn) {
        debug_assert!(self.release.is_none());
        self.release = Some(release);
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("index", &self.index)
            .field("chunk", &self.chunk.index())
            .field("image_bytes", &self.image_bytes)
            .finish()
    }
}
