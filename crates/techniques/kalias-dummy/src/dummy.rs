//! The tag-spraying stub technique.

use std::ops::Range;

use log::warn;

use kalias_core::technique::{FoundObject, Technique, TechniqueError};
use kalias_core::util;

use kalias_sim::SimHandle;

const KREAD_TAG: u64 = u64::from_le_bytes(*b"DMYKREAD");
const KWRITE_TAG: u64 = u64::from_le_bytes(*b"DMYKWRIT");

/// Dual-capable stub technique for the simulated kernel.
///
/// Every sprayed object is one pool allocation carrying `tag ^ id` in its
/// first word, so recognizing an object behind a puaf alias is a single
/// volatile read. The read and write constructors differ only in name and
/// tag, which keeps the two channels' objects distinguishable in dumps.
pub struct DummyTechnique {
    kernel: SimHandle,
    name: &'static str,
    tag: u64,
    object_size: usize,
    maximum_id: u64,
    objects: Vec<u64>,
}

impl DummyTechnique {
    /// Stub for the read channel.
    pub fn kread(kernel: SimHandle) -> Self {
        Self::with(kernel, "dummy-kread", KREAD_TAG)
    }

    /// Stub for the write channel.
    pub fn kwrite(kernel: SimHandle) -> Self {
        Self::with(kernel, "dummy-kwrite", KWRITE_TAG)
    }

    fn with(kernel: SimHandle, name: &'static str, tag: u64) -> Self {
        Self {
            kernel,
            name,
            tag,
            object_size: 64,
            maximum_id: 4096,
            objects: Vec::new(),
        }
    }

    /// Overrides the sprayed object size.
    pub fn with_object_size(mut self, object_size: usize) -> Self {
        self.object_size = object_size;
        self
    }

    /// Overrides the allocation ceiling.
    pub fn with_maximum_id(mut self, maximum_id: u64) -> Self {
        self.maximum_id = maximum_id;
        self
    }
}

impl Technique for DummyTechnique {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self) -> Result<(), TechniqueError> {
        Ok(())
    }

    fn object_size(&self) -> usize {
        self.object_size
    }

    fn maximum_id(&self) -> u64 {
        self.maximum_id
    }

    fn allocate(&mut self, id: u64) -> Result<(), TechniqueError> {
        let mut kernel = self.kernel.borrow_mut();
        let kaddr = kernel.pool_alloc(self.object_size)?;
        kernel.kas_write_u64(kaddr, self.tag ^ id)?;
        drop(kernel);
        debug_assert_eq!(self.objects.len() as u64, id, "ids must arrive consecutively");
        self.objects.push(kaddr);
        Ok(())
    }

    fn search(&mut self, candidates: Range<u64>, uaddr: usize) -> Option<u64> {
        let id = unsafe { (uaddr as *const u64).read_volatile() } ^ self.tag;
        candidates.contains(&id).then_some(id)
    }

    fn kread(
        &mut self,
        _found: &FoundObject,
        kaddr: u64,
        data: &mut [u8],
    ) -> Result<(), TechniqueError> {
        self.kernel.borrow().kas_read(kaddr, data)?;
        Ok(())
    }

    fn kwrite(
        &mut self,
        _found: &FoundObject,
        data: &[u8],
        kaddr: u64,
    ) -> Result<(), TechniqueError> {
        self.kernel.borrow_mut().kas_write(kaddr, data)?;
        Ok(())
    }

    fn find_proc(&mut self, _found: &FoundObject) -> Option<u64> {
        Some(self.kernel.borrow().current_proc())
    }

    fn deallocate(&mut self, id: u64) {
        let Some(&kaddr) = self.objects.get(id as usize) else {
            return;
        };
        if kaddr == 0 {
            return;
        }
        if let Err(err) = self.kernel.borrow_mut().pool_free(kaddr, self.object_size) {
            warn!("dummy: freeing object {} failed: {}", id, err);
        }
        self.objects[id as usize] = 0;
    }

    fn free(&mut self) {
        for id in 0..self.objects.len() as u64 {
            self.deallocate(id);
        }
        util::wipe(&mut self.objects);
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kalias_core::util::PAGE_SIZE;
    use kalias_sim::SimKernel;

    fn booted() -> SimHandle {
        SimKernel::new(16, 11).unwrap().into_shared()
    }

    #[test]
    fn recognizes_only_its_own_tagged_objects() {
        let kernel = booted();
        let mut dummy = DummyTechnique::kread(kernel.clone());
        for id in 0..8 {
            dummy.allocate(id).unwrap();
        }

        // Objects are carved from the first heap page in id order.
        let object_3 = kernel.borrow().user_addr(1) + 3 * 64;
        assert_eq!(dummy.search(0..8, object_3), Some(3));
        assert_eq!(dummy.search(0..3, object_3), None);
        assert_eq!(dummy.search(0..8, object_3 + 8), None);

        let mut other = DummyTechnique::kwrite(kernel);
        assert_eq!(other.search(0..8, object_3), None, "tags must not cross channels");
    }

    #[test]
    fn kernel_access_round_trips_through_the_pool() {
        let kernel = booted();
        let mut dummy = DummyTechnique::kwrite(kernel.clone());
        let found = FoundObject { id: 0, uaddr: 0 };
        let scratch = kernel.borrow().scratch();

        dummy.kwrite(&found, &0x0bad_cafe_u64.to_le_bytes(), scratch).unwrap();
        let mut data = [0u8; 8];
        dummy.kread(&found, scratch, &mut data).unwrap();

        assert_eq!(u64::from_le_bytes(data), 0x0bad_cafe);
        assert_eq!(dummy.find_proc(&found), Some(kernel.borrow().current_proc()));
    }

    #[test]
    fn cleanup_returns_every_object_to_the_pool_once() {
        let kernel = booted();
        let mut dummy = DummyTechnique::kread(kernel.clone())
            .with_object_size(PAGE_SIZE / 8);
        for id in 0..8 {
            dummy.allocate(id).unwrap();
        }
        assert_eq!(kernel.borrow().live_objects(), 8);

        dummy.deallocate(2);
        dummy.deallocate(2);
        assert_eq!(kernel.borrow().destroyed(), 1);

        dummy.free();
        assert_eq!(kernel.borrow().destroyed(), 8);
        assert_eq!(kernel.borrow().live_objects(), 0);
    }
}
