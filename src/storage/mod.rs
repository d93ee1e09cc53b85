//! # Storage Module
//!
//! The mapped-memory layer of the image table. The backing file is a plain
//! concatenation of fixed-length, page-aligned entry slots; this module maps
//! windows of it ([`Chunk`]) and hands out slot handles ([`Entry`]) whose
//! lifetimes keep the mappings alive.
//!
//! ```text
//! <format>.imageTable
//! +-----------+-----------+-----------+-- ... --+
//! | entry 0   | entry 1   | entry 2   |         |
//! +-----------+-----------+-----------+-- ... --+
//! \________________  ________________/
//!                  \/
//!            one mapped Chunk
//! ```
//!
//! Retrieval is zero-copy: a consumer's image aliases the mapped bytes of
//! its entry; nothing is decoded or copied on the read path. The module
//! makes no policy decisions (which slot to use, when to evict, when to
//! flush metadata); those live in [`crate::table`].

mod chunk;
mod entry;

pub use chunk::{Chunk, ChunkCache};
pub use entry::Entry;
