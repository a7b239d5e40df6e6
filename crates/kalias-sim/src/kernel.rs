//! The simulated kernel.
//!
//! [`SimKernel`] models just enough of a kernel for the engine to run end
//! to end inside a normal process: a kernel address space backed by a page
//! pool, a bump allocator that carves objects out of it page by page, a
//! fake current-process structure, and a copy churn path with a scripted
//! reclaim plan deciding when a pool page gets reused as a copy
//! destination.
//!
//! Aliased pages are the heart of the simulation. [`SimKernel::alias_pages`]
//! hands out the pool addresses of a page range as if they were dangling
//! user mappings: the engine scans them through one view while the
//! allocator keeps carving objects out of the same memory through the
//! other, which is exactly the aliasing a real puaf condition provides.

use std::cell::RefCell;
use std::io;
use std::ops::Range;
use std::rc::Rc;

use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};

use kalias_core::caps::{Capabilities, StampLayout};
use kalias_core::puaf::{CopyRegion, PuafPages};
use kalias_core::select::ConfigError;
use kalias_core::technique::{KreadTechnique, KwriteTechnique};
use kalias_core::util::PAGE_SIZE;

use crate::pool::PagePool;

/// Unslid base of the simulated kernel address space.
pub const SIM_KAS_BASE: u64 = 0xffff_fff0_0700_4000;
/// Offset of the pid field inside the fake current-process structure.
pub const SIM_PROC_PID_OFFSET: u64 = 0x60;

/// Pool offset of the fake current-process structure.
const PROC_OFFSET: usize = 0x100;
/// Pool offset of a scratch slot reachable through kernel addresses only.
const SCRATCH_OFFSET: usize = 0x200;

struct Reclaim {
    page: usize,
    at_churn: u64,
    applied: bool,
}

/// Shared handle to the simulated kernel.
pub type SimHandle = Rc<RefCell<SimKernel>>;

/// In-process kernel stand-in.
///
/// Page 0 of the pool holds the globals (the fake process structure and a
/// scratch slot); the bump allocator starts at page 1. Kernel addresses are
/// `kas_base + pool offset`, with `kas_base` randomly slid per instance.
pub struct SimKernel {
    pool: PagePool,
    kas_base: u64,
    cursor: usize,
    churned: u64,
    live_objects: u64,
    created: u64,
    destroyed: u64,
    reclaims: Vec<Reclaim>,
}

impl SimKernel {
    /// Maps a pool of `pages` pages and seeds the globals page. The kernel
    /// slide is derived from `seed`, so runs are reproducible.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the pool mapping fails.
    pub fn new(pages: usize, seed: u64) -> io::Result<SimKernel> {
        let pool = PagePool::new(pages)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let slide = rng.random_range(0u64..0x4000) * PAGE_SIZE as u64;
        let kas_base = SIM_KAS_BASE + slide;
        unsafe {
            let pid = pool.addr(PROC_OFFSET + SIM_PROC_PID_OFFSET as usize) as *mut u64;
            pid.write_volatile(u64::from(std::process::id()));
        }
        debug!("simulated kernel: {} pages, kas_base = {:#x}", pages, kas_base);
        Ok(SimKernel {
            pool,
            kas_base,
            cursor: PAGE_SIZE,
            churned: 0,
            live_objects: 0,
            created: 0,
            destroyed: 0,
            reclaims: Vec::new(),
        })
    }

    /// Wraps the kernel for sharing between duplicator, ports, and
    /// techniques.
    pub fn into_shared(self) -> SimHandle {
        Rc::new(RefCell::new(self))
    }

    /// User-view address of pool `page`.
    pub fn user_addr(&self, page: usize) -> usize {
        self.pool.addr(page * PAGE_SIZE) as usize
    }

    /// Kernel address of the byte behind user-view address `uaddr`.
    ///
    /// # Panics
    ///
    /// Panics if `uaddr` lies outside the pool.
    pub fn kaddr_at(&self, uaddr: usize) -> u64 {
        let base = self.pool.base() as usize;
        assert!(
            uaddr >= base && uaddr < base + self.pool.len(),
            "address {:#x} is outside the pool",
            uaddr
        );
        self.kas_base + (uaddr - base) as u64
    }

    /// Treats `pages` of the pool as dangling user mappings and returns
    /// their user-view addresses.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the range is empty.
    pub fn alias_pages(&self, pages: Range<usize>) -> Result<PuafPages, ConfigError> {
        PuafPages::new(pages.map(|page| self.user_addr(page)).collect())
    }

    fn offset_of(&self, kaddr: u64, len: usize) -> io::Result<usize> {
        let offset = kaddr
            .checked_sub(self.kas_base)
            .ok_or_else(|| fault(kaddr))? as usize;
        let end = offset.checked_add(len).ok_or_else(|| fault(kaddr))?;
        if end > self.pool.len() {
            return Err(fault(kaddr));
        }
        Ok(offset)
    }

    /// Reads `data.len()` bytes of kernel memory at `kaddr`.
    ///
    /// # Errors
    ///
    /// Accesses outside the pool fault as I/O errors.
    pub fn kas_read(&self, kaddr: u64, data: &mut [u8]) -> io::Result<()> {
        let offset = self.offset_of(kaddr, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.pool.addr(offset), data.as_mut_ptr(), data.len());
        }
        Ok(())
    }

    /// Writes `data` to kernel memory at `kaddr`.
    ///
    /// # Errors
    ///
    /// Accesses outside the pool fault as I/O errors.
    pub fn kas_write(&mut self, kaddr: u64, data: &[u8]) -> io::Result<()> {
        let offset = self.offset_of(kaddr, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.pool.addr(offset), data.len());
        }
        Ok(())
    }

    /// Reads one little-endian `u64` of kernel memory.
    ///
    /// # Errors
    ///
    /// Accesses outside the pool fault as I/O errors.
    pub fn kas_read_u64(&self, kaddr: u64) -> io::Result<u64> {
        let mut data = [0u8; 8];
        self.kas_read(kaddr, &mut data)?;
        Ok(u64::from_le_bytes(data))
    }

    /// Writes one little-endian `u64` of kernel memory.
    ///
    /// # Errors
    ///
    /// Accesses outside the pool fault as I/O errors.
    pub fn kas_write_u64(&mut self, kaddr: u64, value: u64) -> io::Result<()> {
        self.kas_write(kaddr, &value.to_le_bytes())
    }

    /// Carves one object of `size` bytes out of the next free heap range.
    /// Objects never straddle a page boundary, like a zone allocator.
    ///
    /// # Errors
    ///
    /// Reports `OutOfMemory` when the pool is used up.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or larger than a page.
    pub fn pool_alloc(&mut self, size: usize) -> io::Result<u64> {
        assert!(size > 0 && size <= PAGE_SIZE, "object size {} out of range", size);
        let within = self.cursor % PAGE_SIZE;
        if within != 0 && within + size > PAGE_SIZE {
            self.cursor += PAGE_SIZE - within;
        }
        if self.cursor + size > self.pool.len() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "simulated kernel heap exhausted",
            ));
        }
        let kaddr = self.kas_base + self.cursor as u64;
        self.cursor += size;
        self.live_objects += 1;
        self.created += 1;
        Ok(kaddr)
    }

    /// Scrubs an object's bytes and drops it from the live count. The bump
    /// cursor never moves back; freed ranges are not recycled.
    ///
    /// # Errors
    ///
    /// Accesses outside the pool fault as I/O errors.
    pub fn pool_free(&mut self, kaddr: u64, size: usize) -> io::Result<()> {
        let offset = self.offset_of(kaddr, size)?;
        unsafe { std::ptr::write_bytes(self.pool.addr(offset), 0x00, size) };
        self.live_objects = self.live_objects.saturating_sub(1);
        self.destroyed += 1;
        Ok(())
    }

    /// Duplicates the copy region and applies any reclaim due at the new
    /// churn count by reusing the planned pool page as a copy destination.
    ///
    /// # Errors
    ///
    /// Infallible today; the signature matches the duplication seam.
    pub fn churn_copy(&mut self, copy: &CopyRegion) -> io::Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(copy.src as *const u8, copy.dst as *mut u8, copy.size);
        }
        self.churned += copy.pages();
        for reclaim in self.reclaims.iter_mut() {
            if !reclaim.applied && reclaim.at_churn <= self.churned {
                reclaim.applied = true;
                let page = self.pool.addr(reclaim.page * PAGE_SIZE);
                unsafe { std::ptr::copy_nonoverlapping(copy.src as *const u8, page, PAGE_SIZE) };
                debug!("pool page {} reused as copy destination at churn {}", reclaim.page, self.churned);
            }
        }
        Ok(())
    }

    /// Schedules pool `page` to be reused as a copy destination once the
    /// churn count reaches `at_churn` pages.
    ///
    /// # Panics
    ///
    /// Panics if `page` lies outside the pool.
    pub fn plan_reclaim(&mut self, page: usize, at_churn: u64) {
        assert!(
            (page + 1) * PAGE_SIZE <= self.pool.len(),
            "page {} is outside the pool",
            page
        );
        self.reclaims.push(Reclaim {
            page,
            at_churn,
            applied: false,
        });
    }

    /// Pages churned so far.
    pub fn churned(&self) -> u64 {
        self.churned
    }

    /// Objects currently live.
    pub fn live_objects(&self) -> u64 {
        self.live_objects
    }

    /// Objects created since boot.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Objects destroyed since boot.
    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }

    /// Kernel address of the fake current-process structure.
    pub fn current_proc(&self) -> u64 {
        self.kas_base + PROC_OFFSET as u64
    }

    /// Kernel address of the scratch slot.
    pub fn scratch(&self) -> u64 {
        self.kas_base + SCRATCH_OFFSET as u64
    }

    /// Slid base of the kernel address space.
    pub fn kas_base(&self) -> u64 {
        self.kas_base
    }

    /// Pool size in pages.
    pub fn pages(&self) -> usize {
        self.pool.len() / PAGE_SIZE
    }
}

fn fault(kaddr: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("simulated kernel fault at {kaddr:#x}"),
    )
}

/// Stamp registry layout used by the simulated kernel: a 32-byte header
/// followed by 60 in-line slots.
pub fn sim_stamp_layout() -> StampLayout {
    StampLayout {
        object_size: 512,
        magic: u64::from_le_bytes(*b"STMPREGY"),
        instance_offset: 8,
        slot_ptr_offset: 16,
        owner_proc_offset: 24,
        slot_count: 60,
        maximum_id: 4096,
    }
}

/// Capability descriptor of the simulated kernel build.
pub fn sim_capabilities() -> Capabilities {
    Capabilities {
        build: "sim".to_string(),
        kread: vec![KreadTechnique::Dummy, KreadTechnique::Stamp],
        kwrite: vec![KwriteTechnique::Dummy, KwriteTechnique::Stamp],
        stamp: Some(sim_stamp_layout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliased_pages_share_backing_with_the_kernel_range() {
        let mut kernel = SimKernel::new(8, 7).unwrap();
        let puaf = kernel.alias_pages(4..6).unwrap();
        assert_eq!(puaf.len(), 2);
        let uaddr = puaf.as_slice()[0];

        kernel.kas_write_u64(kernel.kaddr_at(uaddr), 0xdead_beef).unwrap();

        let value = unsafe { (uaddr as *const u64).read_volatile() };
        assert_eq!(value, 0xdead_beef);
    }

    #[test]
    fn allocations_never_straddle_a_page_boundary() {
        let mut kernel = SimKernel::new(8, 7).unwrap();
        let first = kernel.pool_alloc(3000).unwrap();
        let second = kernel.pool_alloc(3000).unwrap();
        assert_eq!(first - kernel.kas_base(), PAGE_SIZE as u64);
        assert_eq!(second - kernel.kas_base(), 2 * PAGE_SIZE as u64);
        assert_eq!(kernel.live_objects(), 2);
    }

    #[test]
    fn exhausted_pool_reports_out_of_memory() {
        let mut kernel = SimKernel::new(2, 7).unwrap();
        kernel.pool_alloc(PAGE_SIZE).unwrap();
        let err = kernel.pool_alloc(8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn freed_objects_are_scrubbed() {
        let mut kernel = SimKernel::new(4, 7).unwrap();
        let kaddr = kernel.pool_alloc(64).unwrap();
        kernel.kas_write_u64(kaddr, 0x4141_4141).unwrap();

        kernel.pool_free(kaddr, 64).unwrap();

        assert_eq!(kernel.kas_read_u64(kaddr).unwrap(), 0);
        assert_eq!(kernel.destroyed(), 1);
        assert_eq!(kernel.live_objects(), 0);
    }

    #[test]
    fn reclaim_plan_fires_at_the_scheduled_churn() {
        let mut kernel = SimKernel::new(8, 7).unwrap();
        kernel.plan_reclaim(5, 3);
        let copy_pool = PagePool::new(2).unwrap();
        let src = copy_pool.addr(0) as usize;
        let dst = copy_pool.addr(PAGE_SIZE) as usize;
        let copy = CopyRegion::new(src, dst, PAGE_SIZE).unwrap();
        unsafe { (src as *mut u64).write_volatile(0x5e17_1111) };

        kernel.churn_copy(&copy).unwrap();
        kernel.churn_copy(&copy).unwrap();
        let before = unsafe { (kernel.user_addr(5) as *const u64).read_volatile() };
        assert_eq!(before, 0, "reclaim must not fire before its churn count");

        kernel.churn_copy(&copy).unwrap();
        let after = unsafe { (kernel.user_addr(5) as *const u64).read_volatile() };
        assert_eq!(after, 0x5e17_1111);
        assert_eq!(kernel.churned(), 3);
    }

    #[test]
    fn kernel_faults_are_io_errors() {
        let kernel = SimKernel::new(4, 7).unwrap();
        assert!(kernel.kas_read_u64(kernel.kas_base() - 8).is_err());
        assert!(kernel.kas_read_u64(kernel.kas_base() + (4 * PAGE_SIZE) as u64).is_err());
    }

    #[test]
    fn slide_is_deterministic_per_seed_and_page_aligned() {
        let a = SimKernel::new(2, 99).unwrap();
        let b = SimKernel::new(2, 99).unwrap();
        assert_eq!(a.kas_base(), b.kas_base());
        assert_eq!(a.kas_base() % PAGE_SIZE as u64, SIM_KAS_BASE % PAGE_SIZE as u64);
    }
}
