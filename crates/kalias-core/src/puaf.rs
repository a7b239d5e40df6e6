//! Descriptors for the memory a session operates on.
//!
//! A session never maps or unmaps memory itself. The caller hands over the
//! user addresses of the dangling puaf pages plus a copy region whose
//! duplication churns the page allocator, and both are validated once at
//! construction so the engine can trust them afterwards.

use crate::select::ConfigError;
use crate::util::{PAGE_MASK, PAGE_SIZE};

/// The user virtual addresses of pages whose backing frames have been freed
/// while the mapping stayed alive.
///
/// Every address is page aligned and stays readable and writable for the
/// lifetime of the session. The set is never empty.
#[derive(Debug, Clone)]
pub struct PuafPages {
    pages: Vec<usize>,
}

impl PuafPages {
    /// Wraps a set of dangling page addresses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyPuafSet`] for an empty set and
    /// [`ConfigError::UnalignedPuafPage`] for any address that is not page
    /// aligned.
    pub fn new(pages: Vec<usize>) -> Result<Self, ConfigError> {
        if pages.is_empty() {
            return Err(ConfigError::EmptyPuafSet);
        }
        for &uaddr in &pages {
            if uaddr & PAGE_MASK != 0 {
                return Err(ConfigError::UnalignedPuafPage(uaddr));
            }
        }
        Ok(Self { pages })
    }

    /// Number of dangling pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True if the set holds no pages. Unreachable after construction, kept
    /// for completeness of the container API.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The page addresses in scan order.
    pub fn as_slice(&self) -> &[usize] {
        &self.pages
    }

    /// Iterates over the page addresses in scan order.
    pub fn iter(&self) -> std::slice::Iter<'_, usize> {
        self.pages.iter()
    }
}

/// A source and destination buffer pair whose repeated duplication forces
/// the kernel to hand out fresh pages.
///
/// Both buffers are `size` bytes long, page aligned, and must not overlap.
/// The engine seeds the head of `src` with a sentinel before churning, so
/// the source must be writable.
#[derive(Debug, Clone, Copy)]
pub struct CopyRegion {
    /// Source buffer address.
    pub src: usize,
    /// Destination buffer address.
    pub dst: usize,
    /// Length of each buffer in bytes, a multiple of the page size.
    pub size: usize,
}

impl CopyRegion {
    /// Wraps a duplication buffer pair.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ShortCopyRegion`] if `size` is smaller than
    /// one page or not page aligned, [`ConfigError::UnalignedPuafPage`] if
    /// either buffer is not page aligned, and
    /// [`ConfigError::OverlappingCopyRegion`] if the buffers overlap.
    pub fn new(src: usize, dst: usize, size: usize) -> Result<Self, ConfigError> {
        if size < PAGE_SIZE || size & PAGE_MASK != 0 {
            return Err(ConfigError::ShortCopyRegion);
        }
        if src & PAGE_MASK != 0 {
            return Err(ConfigError::UnalignedPuafPage(src));
        }
        if dst & PAGE_MASK != 0 {
            return Err(ConfigError::UnalignedPuafPage(dst));
        }
        if src < dst + size && dst < src + size {
            return Err(ConfigError::OverlappingCopyRegion);
        }
        Ok(Self { src, dst, size })
    }

    /// Number of pages each duplication pass moves.
    pub fn pages(&self) -> u64 {
        (self.size / PAGE_SIZE) as u64
    }
}
