//! # Configuration Module
//!
//! Centralizes layout constants and process-wide host values for the image
//! table. Constants live in [`constants`]; this module additionally exposes
//! the two values that are computed once per process and never change
//! afterwards:
//!
//! - [`page_size`]: the OS page size, queried once via `sysconf` on unix and
//!   falling back to 4096 elsewhere. Entry lengths are multiples of this.
//! - [`cache_directory`]: the directory holding every `<format>.imageTable` /
//!   `<format>.metadata` pair. Defaults to a per-process subdirectory of the
//!   system temp directory; hosts that want a stable location call
//!   [`set_cache_directory`] before opening any table.

pub mod constants;

pub use constants::*;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
static CACHE_DIRECTORY: OnceLock<PathBuf> = OnceLock::new();

/// OS page size, computed on first use.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions; a negative return means
            // the value is unavailable and the fallback applies.
            let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if value > 0 {
                return value as usize;
            }
            FALLBACK_PAGE_SIZE
        }
        #[cfg(not(unix))]
        {
            FALLBACK_PAGE_SIZE
        }
    })
}

/// Directory holding all image table files for this process.
///
/// Defaults to `<tmp>/pixcache-<pid>` on first use.
pub fn cache_directory() -> &'static Path {
    CACHE_DIRECTORY
        .get_or_init(|| std::env::temp_dir().join(format!("pixcache-{}", std::process::id())))
}

/// Overrides the cache directory. Must be called before any table is opened;
/// returns false if the directory was already fixed.
pub fn set_cache_directory<P: Into<PathBuf>>(path: P) -> bool {
    CACHE_DIRECTORY.set(path.into()).is_ok()
}
