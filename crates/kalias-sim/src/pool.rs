//! Anonymous page-aligned memory pools.

use std::io;
use std::ptr::null_mut;

use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_SHARED};

use kalias_core::util::PAGE_SIZE;

/// A page-aligned, zero-initialized memory region obtained via `mmap`.
///
/// The mapping is released when the pool is dropped.
pub struct PagePool {
    base: *mut u8,
    len: usize,
}

impl PagePool {
    /// Maps `pages` zeroed pages.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the mapping fails.
    ///
    /// # Panics
    ///
    /// Panics if `pages` is zero.
    pub fn new(pages: usize) -> io::Result<Self> {
        assert!(pages > 0, "a pool needs at least one page");
        let len = pages * PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::memset(base, 0x00, len) };
        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }

    /// Base address of the pool.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Pool length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the pool holds no bytes. Unreachable after construction,
    /// kept for completeness of the container API.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address `offset` bytes into the pool.
    ///
    /// # Panics
    ///
    /// Panics if `offset` lies outside the pool.
    pub fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "pool offset {} >= length {}",
            offset,
            self.len
        );
        unsafe { self.base.byte_add(offset) }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}
