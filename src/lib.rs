//! # pixcache - Persistent Memory-Mapped Image Table
//!
//! pixcache stores pre-rendered pixel buffers of a single image format in a
//! memory-mapped file, so a consumer (typically a UI displaying many
//! thumbnails) can obtain ready-to-display pixel data with no decode, no
//! scaling, and no copy on the hot path: a fetched image aliases the mapped
//! file region directly.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pixcache::{ImageFormat, ImageTable};
//! use uuid::Uuid;
//!
//! let format = ImageFormat::rgba8("thumb-128", 128, 128, 4096)?;
//! let table = ImageTable::open(format)?;
//!
//! let (photo, master) = (Uuid::new_v4(), Uuid::new_v4());
//!
//! // Render once...
//! table.set_entry(photo, master, |buf| render_thumbnail(buf));
//!
//! // ...display many times, straight from the mapped file.
//! if let Some(image) = table.new_image_for(photo, master, true) {
//!     blit(image.pixels(), image.row_stride());
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     Public API (ImageTable, CachedImage)    │
//! ├─────────────────────────────────────────────┤
//! │  Orchestrator: index, MRU eviction, pins,   │
//! │  per-slot monitors, metadata writer thread  │
//! ├─────────────────────────────────────────────┤
//! │  Storage: mapped chunks + entry handles     │
//! ├─────────────────────────────────────────────┤
//! │  <name>.imageTable  +  <name>.metadata      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! The data file is a concatenation of fixed-length, page-aligned entry
//! slots: `row_stride`-aligned pixel rows, padding, then a 32-byte header
//! (16-byte entity id, 16-byte source-image id). The metadata file is a
//! compact binary index (slot assignments, source ids, MRU order, format
//! fingerprint), rewritten asynchronously after each mutation and
//! reconciled against the data file at open.
//!
//! ## Eviction
//!
//! The table holds at most an effective maximum of entries (the configured
//! capacity, raised to at least one chunk). Past that, storing a new entity
//! evicts the least-recently-used entry that no outstanding image pins.
//! Images pin their entity for as long as they are alive, so eviction never
//! invalidates pixels a reader is displaying; if every entry is pinned, the
//! file grows past the maximum instead (logged as pressure).
//!
//! ## Module Overview
//!
//! - [`format`]: image format descriptor and compatibility fingerprint
//! - [`layout`]: derived geometry (strides, entry/chunk sizes)
//! - [`storage`]: memory-mapped chunks and entry handles
//! - [`table`]: the orchestrator, index/MRU state, metadata persistence
//! - [`image`]: draw-target buffer and the aliasing image type
//! - [`config`]: constants and process-wide host values

pub mod config;
pub mod format;
pub mod image;
pub mod layout;
pub mod storage;
pub mod table;

pub use config::{cache_directory, set_cache_directory};
pub use format::ImageFormat;
pub use image::{CachedImage, PixelBuffer};
pub use layout::TableLayout;
pub use table::ImageTable;
