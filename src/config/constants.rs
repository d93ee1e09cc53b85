//! # Image Table Configuration Constants
//!
//! This module centralizes the layout constants for the image table. Constants
//! that depend on each other are co-located and their relationships documented,
//! with compile-time assertions enforcing the critical ones.
//!
//! ## Dependency Graph
//!
//! ```text
//! HW_ROW_ALIGNMENT (64 bytes)
//!       │
//!       └─> row_stride = align_up(width * bytes_per_pixel, HW_ROW_ALIGNMENT)
//!             GPU/blitter row alignment. Every pixel row in an entry starts
//!             on a 64-byte boundary.
//!
//! ENTRY_HEADER_SIZE (32 bytes)
//!       │
//!       ├─> ENTITY_ID_SIZE (16 bytes, trailing header bytes 0..16)
//!       │
//!       └─> SOURCE_ID_SIZE (16 bytes, trailing header bytes 16..32)
//!             entry_length = align_up(image_bytes + ENTRY_HEADER_SIZE, page)
//!
//! CHUNK_TARGET_BYTES (2 MiB)
//!       │
//!       └─> entries_per_chunk = max(MIN_ENTRIES_PER_CHUNK,
//!                                   CHUNK_TARGET_BYTES / entry_length)
//!             One mapped window should stay around 2 MiB so that mapping
//!             and unmapping chunks is cheap relative to the pixel payload.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `ENTITY_ID_SIZE + SOURCE_ID_SIZE == ENTRY_HEADER_SIZE`
//! 2. `HW_ROW_ALIGNMENT` is a power of two (alignment arithmetic)
//! 3. `CHUNK_TARGET_BYTES` is a multiple of the fallback page size

// ============================================================================
// ENTRY LAYOUT
// ============================================================================

/// Row alignment required by the blit hardware. Pixel rows inside an entry
/// are padded out to this boundary.
pub const HW_ROW_ALIGNMENT: usize = 64;

/// Trailing per-entry header: entity id followed by source-image id.
pub const ENTRY_HEADER_SIZE: usize = 32;

/// Size of the entity id stored at the start of the entry header.
pub const ENTITY_ID_SIZE: usize = 16;

/// Size of the source-image id stored after the entity id.
pub const SOURCE_ID_SIZE: usize = 16;

// ============================================================================
// CHUNK GEOMETRY
// ============================================================================

/// Target byte size of one mapped chunk. The actual chunk length is this
/// rounded to a whole number of entries, never fewer than
/// [`MIN_ENTRIES_PER_CHUNK`].
pub const CHUNK_TARGET_BYTES: usize = 2 * 1024 * 1024;

/// Lower bound on entries per chunk, so very large formats still amortize
/// the cost of a mapping over several entries.
pub const MIN_ENTRIES_PER_CHUNK: u32 = 4;

/// Page size used when the OS cannot be asked (non-unix targets).
pub const FALLBACK_PAGE_SIZE: usize = 4096;

// ============================================================================
// ON-DISK NAMES AND METADATA FORMAT
// ============================================================================

/// Extension of the raw pixel data file, one per format.
pub const TABLE_FILE_EXTENSION: &str = "imageTable";

/// Extension of the serialized index/MRU metadata file.
pub const METADATA_FILE_EXTENSION: &str = "metadata";

/// Magic bytes at offset 0 of the metadata file.
pub const METADATA_MAGIC: &[u8; 16] = b"pixcache meta v1";

/// Current metadata file format version.
pub const METADATA_VERSION: u32 = 1;

const _: () = assert!(ENTITY_ID_SIZE + SOURCE_ID_SIZE == ENTRY_HEADER_SIZE);
const _: () = assert!(HW_ROW_ALIGNMENT.is_power_of_two());
const _: () = assert!(CHUNK_TARGET_BYTES % FALLBACK_PAGE_SIZE == 0);
const _: () = assert!(MIN_ENTRIES_PER_CHUNK >= 1);
