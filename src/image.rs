//! # Pixel Buffers and Cached Images
//!
//! Two views over the same mapped entry bytes, one for each side of the
//! cache:
//!
//! - [`PixelBuffer`] is the *write* side: the draw target handed to the
//!   renderer callback during a store. It borrows the slot's pixel bytes
//!   mutably for the duration of the draw.
//! - [`CachedImage`] is the *read* side: a ready-to-display image returned
//!   from a fetch. It owns an entry handle, so the mapped chunk stays alive
//!   for as long as the image does, and the pixel bytes are the mapped file
//!   bytes. No decode, no copy.
//!
//! Dropping a `CachedImage` releases its entry, which unpins the entity for
//! eviction and lets the chunk unmap once no other handles remain.

use uuid::Uuid;

use crate::format::ImageFormat;
use crate::layout::TableLayout;
use crate::storage::Entry;

/// Mutable view of one entry's pixel region, handed to draw callbacks.
pub struct PixelBuffer<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    row_stride: usize,
    bytes_per_pixel: u32,
    bits_per_component: u32,
    grayscale: bool,
    bitmap_flags: u32,
}

impl<'a> PixelBuffer<'a> {
    pub(crate) fn new(data: &'a mut [u8], format: &ImageFormat, layout: &TableLayout) -> Self {
        debug_assert_eq!(data.len(), layout.image_bytes());

        Self {
            data,
            width: format.width(),
            height: format.height(),
            row_stride: layout.row_stride(),
            bytes_per_pixel: format.bytes_per_pixel(),
            bits_per_component: format.bits_per_component(),
            grayscale: format.is_grayscale(),
            bitmap_flags: format.bitmap_flags(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes from one row to the next. At least `width * bytes_per_pixel`,
    /// padded to the hardware row alignment.
    pub fn row_stride(&self) -> usize {
        self.row_stride
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

    /// The full pixel region, including row padding.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// The visible bytes of one row (`width * bytes_per_pixel`, stride
    /// padding excluded).
    pub fn row(&self, y: u32) -> &[u8] {
        assert!(y < self.height, "row {} out of bounds (height={})", y, self.height);
        let start = y as usize * self.row_stride;
        let visible = self.width as usize * self.bytes_per_pixel as usize;
        &self.data[start..start + visible]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        assert!(y < self.height, "row {} out of bounds (height={})", y, self.height);
        let start = y as usize * self.row_stride;
        let visible = self.width as usize * self.bytes_per_pixel as usize;
        &mut self.data[start..start + visible]
    }

    /// Tiles one pixel value across every visible pixel.
    pub fn fill(&mut self, pixel: &[u8]) {
        assert_eq!(pixel.len(), self.bytes_per_pixel as usize);
        for y in 0..self.height {
            for chunk in self.row_mut(y).chunks_exact_mut(pixel.len()) {
                chunk.copy_from_slice(pixel);
            }
        }
    }
}

/// A stored image aliasing the mapped backing file.
///
/// Holding a `CachedImage` pins its entity against eviction; drop it when
/// done displaying. The pixel bytes must not be assumed valid across a
/// [`crate::ImageTable::reset`], which truncates the backing file.
pub struct CachedImage {
    entry: Entry,
    width: u32,
    height: u32,
    row_stride: usize,
    bytes_per_pixel: u32,
}

impl CachedImage {
    pub(crate) fn new(entry: Entry, format: &ImageFormat, layout: &TableLayout) -> Self {
        Self {
            entry,
            width: format.width(),
            height: format.height(),
            row_stride: layout.row_stride(),
            bytes_per_pixel: format.bytes_per_pixel(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    /// The full pixel region, including row padding, straight from the
    /// mapped file.
    pub fn pixels(&self) -> &[u8] {
        self.entry.pixels()
    }

    /// The visible bytes of one row.
    pub fn row(&self, y: u32) -> &[u8] {
        assert!(y < self.height, "row {} out of bounds (height={})", y, self.height);
        let start = y as usize * self.row_stride;
        let visible = self.width as usize * self.bytes_per_pixel as usize;
        &self.pixels()[start..start + visible]
    }

    /// Entity id recorded in the entry header.
    pub fn entity_id(&self) -> Uuid {
        self.entry.entity_id()
    }

    /// Source-image id recorded in the entry header.
    pub fn source_id(&self) -> Uuid {
        self.entry.source_id()
    }
}

impl std::fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("row_stride", &self.row_stride)
            .field("entry", &self.entry.index())
            .finish()
    }
}
