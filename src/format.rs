//! # Image Format Descriptor
//!
//! An [`ImageFormat`] describes one family of pre-rendered images: pixel
//! dimensions, color model, component depth, bitmap layout flags, and the
//! configured capacity of the table holding them. Every image table stores
//! entries of exactly one format; a table's on-disk files are named after the
//! format's stable name.
//!
//! ## Fingerprint
//!
//! [`ImageFormat::fingerprint`] returns a deterministic little-endian
//! encoding of every field that affects the meaning of stored pixel bytes:
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Pixel width (u32)
//! 4       4     Pixel height (u32)
//! 8       4     Bytes per pixel (u32)
//! 12      4     Bits per component (u32)
//! 16      1     Grayscale flag (0 or 1)
//! 17      4     Bitmap layout flags (u32)
//! ```
//!
//! The fingerprint is persisted alongside the table metadata and compared at
//! open: a mismatch means the stored pixel bytes are not interpretable under
//! the current format and both files are discarded.
//!
//! `maximum_count` and `name` deliberately do not participate: resizing the
//! cache budget or renaming the file does not change what the stored bytes
//! mean, so neither must invalidate them.

use eyre::{ensure, Result};

/// Describes the pixel layout and capacity of one image table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFormat {
    name: String,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    bits_per_component: u32,
    grayscale: bool,
    bitmap_flags: u32,
    maximum_count: u32,
}

impl ImageFormat {
    /// Creates a format descriptor.
    ///
    /// The name must be filename-safe (alphanumeric plus `-`, `_`, `.`)
    /// because it becomes the stem of the `.imageTable` and `.metadata`
    /// files. Dimensions, pixel width, and capacity must be non-zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        bits_per_component: u32,
        grayscale: bool,
        bitmap_flags: u32,
        maximum_count: u32,
    ) -> Result<Self> {
        let name = name.into();

        ensure!(!name.is_empty(), "format name must not be empty");
        ensure!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
            "format name '{}' is not filename-safe",
            name
        );
        ensure!(width > 0 && height > 0, "format dimensions must be non-zero");
        ensure!(bytes_per_pixel > 0, "bytes per pixel must be non-zero");
        ensure!(
            bits_per_component > 0,
            "bits per component must be non-zero"
        );
        ensure!(maximum_count > 0, "maximum entry count must be non-zero");

        Ok(Self {
            name,
            width,
            height,
            bytes_per_pixel,
            bits_per_component,
            grayscale,
            bitmap_flags,
            maximum_count,
        })
    }

    /// 8-bit RGBA format, the common case for thumbnails.
    pub fn rgba8(name: impl Into<String>, width: u32, height: u32, maximum_count: u32) -> Result<Self> {
        Self::new(name, width, height, 4, 8, false, 0, maximum_count)
    }

    /// 8-bit single-channel grayscale format.
    pub fn gray8(name: impl Into<String>, width: u32, height: u32, maximum_count: u32) -> Result<Self> {
        Self::new(name, width, height, 1, 8, true, 0, maximum_count)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    pub fn bits_per_component(&self) -> u32 {
        self.bits_per_component
    }

    pub fn is_grayscale(&self) -> bool {
        self.grayscale
    }

    pub fn bitmap_flags(&self) -> u32 {
        self.bitmap_flags
    }

    pub fn maximum_count(&self) -> u32 {
        self.maximum_count
    }

    /// Deterministic encoding of the pixel-affecting fields. Equal iff two
    /// descriptors store compatible pixel bytes.
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21);
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.bytes_per_pixel.to_le_bytes());
        buf.extend_from_slice(&self.bits_per_component.to_le_bytes());
        buf.push(self.grayscale as u8);
        buf.extend_from_slice(&self.bitmap_flags.to_le_bytes());
        buf
    }
}
