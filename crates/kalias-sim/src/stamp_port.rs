//! Stamp registry syscalls over the simulated kernel.

use std::collections::HashMap;
use std::io;

use kalias_core::caps::StampLayout;
use kalias_stamp::port::{StampHandle, StampPort};

use crate::kernel::{SimHandle, sim_stamp_layout};

/// Byte offset of the in-line slot array inside a registry object.
const SLOT_AREA_OFFSET: u64 = 32;

/// [`StampPort`] implementation backed by [`crate::kernel::SimKernel`].
///
/// Registries are carved out of the kernel pool with their slot array in
/// line after the 32-byte header. The accessors re-read the slot pointer
/// from the header on every call, which is the behavior the stamp
/// technique leans on.
pub struct SimStampPort {
    kernel: SimHandle,
    layout: StampLayout,
    registries: HashMap<u32, u64>,
    next_port: u32,
    next_instance: u32,
}

impl SimStampPort {
    /// Wraps a shared kernel handle.
    pub fn new(kernel: SimHandle) -> Self {
        // Derive the first instance id from the slide so runs do not hand
        // out the same ids every time.
        let next_instance = (kernel.borrow().kas_base() >> 12) as u32 & 0xffff;
        Self {
            kernel,
            layout: sim_stamp_layout(),
            registries: HashMap::new(),
            next_port: 0,
            next_instance,
        }
    }

    fn header_of(&self, handle: StampHandle) -> io::Result<u64> {
        self.registries
            .get(&handle.port)
            .copied()
            .ok_or_else(|| no_such_registry(handle))
    }

    fn check_slot(&self, slot: u32) -> io::Result<()> {
        if slot >= self.layout.slot_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slot {} out of range", slot),
            ));
        }
        Ok(())
    }
}

impl StampPort for SimStampPort {
    fn create(&mut self) -> io::Result<StampHandle> {
        let mut kernel = self.kernel.borrow_mut();
        let kaddr = kernel.pool_alloc(self.layout.object_size)?;
        self.next_port += 1;
        self.next_instance = self.next_instance.wrapping_add(1);
        let handle = StampHandle {
            port: self.next_port,
            registry_id: self.next_instance,
        };
        kernel.kas_write_u64(kaddr, self.layout.magic)?;
        kernel.kas_write(
            kaddr + self.layout.instance_offset as u64,
            &handle.registry_id.to_le_bytes(),
        )?;
        kernel.kas_write_u64(
            kaddr + self.layout.slot_ptr_offset as u64,
            kaddr + SLOT_AREA_OFFSET,
        )?;
        let current_proc = kernel.current_proc();
        kernel.kas_write_u64(kaddr + self.layout.owner_proc_offset as u64, current_proc)?;
        self.registries.insert(handle.port, kaddr);
        Ok(handle)
    }

    fn destroy(&mut self, handle: StampHandle) -> io::Result<()> {
        let kaddr = self
            .registries
            .remove(&handle.port)
            .ok_or_else(|| no_such_registry(handle))?;
        self.kernel
            .borrow_mut()
            .pool_free(kaddr, self.layout.object_size)
    }

    fn stamp(&mut self, handle: StampHandle, slot: u32) -> io::Result<u64> {
        let kaddr = self.header_of(handle)?;
        self.check_slot(slot)?;
        let kernel = self.kernel.borrow();
        let slot_ptr = kernel.kas_read_u64(kaddr + self.layout.slot_ptr_offset as u64)?;
        kernel.kas_read_u64(slot_ptr + u64::from(slot) * 8)
    }

    fn set_stamp(&mut self, handle: StampHandle, slot: u32, value: u64) -> io::Result<()> {
        let kaddr = self.header_of(handle)?;
        self.check_slot(slot)?;
        let mut kernel = self.kernel.borrow_mut();
        let slot_ptr = kernel.kas_read_u64(kaddr + self.layout.slot_ptr_offset as u64)?;
        kernel.kas_write_u64(slot_ptr + u64::from(slot) * 8, value)
    }
}

fn no_such_registry(handle: StampHandle) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no registry behind port {}", handle.port),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimKernel;
    use kalias_core::util::PAGE_SIZE;

    #[test]
    fn create_writes_a_recognizable_header() {
        let kernel = SimKernel::new(16, 3).unwrap().into_shared();
        let mut port = SimStampPort::new(kernel.clone());
        let handle = port.create().unwrap();
        let layout = sim_stamp_layout();

        let kernel_ref = kernel.borrow();
        // The first object is carved from the first heap page.
        let kaddr = kernel_ref.kas_base() + PAGE_SIZE as u64;
        assert_eq!(kernel_ref.kas_read_u64(kaddr).unwrap(), layout.magic);
        let slot_ptr = kernel_ref
            .kas_read_u64(kaddr + layout.slot_ptr_offset as u64)
            .unwrap();
        assert_eq!(slot_ptr, kaddr + SLOT_AREA_OFFSET);
        assert_eq!(
            kernel_ref
                .kas_read_u64(kaddr + layout.owner_proc_offset as u64)
                .unwrap(),
            kernel_ref.current_proc()
        );
        drop(kernel_ref);

        port.set_stamp(handle, 3, 0x1122).unwrap();
        assert_eq!(port.stamp(handle, 3).unwrap(), 0x1122);
    }

    #[test]
    fn accessors_follow_the_header_pointer() {
        let kernel = SimKernel::new(16, 3).unwrap().into_shared();
        let mut port = SimStampPort::new(kernel.clone());
        let handle = port.create().unwrap();
        let layout = sim_stamp_layout();
        let kaddr = kernel.borrow().kas_base() + PAGE_SIZE as u64;

        // Repoint the slot array at the scratch slot, as the technique
        // does through the puaf alias.
        let scratch = kernel.borrow().scratch();
        kernel
            .borrow_mut()
            .kas_write_u64(kaddr + layout.slot_ptr_offset as u64, scratch)
            .unwrap();

        port.set_stamp(handle, 0, 0xc0ffee).unwrap();
        assert_eq!(kernel.borrow().kas_read_u64(scratch).unwrap(), 0xc0ffee);
        assert_eq!(port.stamp(handle, 0).unwrap(), 0xc0ffee);
    }

    #[test]
    fn slots_and_handles_are_validated() {
        let kernel = SimKernel::new(16, 3).unwrap().into_shared();
        let mut port = SimStampPort::new(kernel);
        let handle = port.create().unwrap();

        assert!(port.stamp(handle, 60).is_err());
        port.destroy(handle).unwrap();
        assert!(port.destroy(handle).is_err());
        assert!(port.stamp(handle, 0).is_err());
    }
}
