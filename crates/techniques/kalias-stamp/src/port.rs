//! The syscall surface of the stamp registry family.

use std::io;

/// Client handle to one kernel stamp registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StampHandle {
    /// Port name through which the registry is reached. Zero is the null
    /// handle.
    pub port: u32,
    /// Kernel-assigned instance id, echoed at a fixed offset in the
    /// registry header.
    pub registry_id: u32,
}

/// Kernel interface for creating stamp registries and driving their
/// indexed stamp accessors.
///
/// `stamp` returns the `u64` stored at `slot` of the registry's slot
/// array; `set_stamp` overwrites it. Both dereference the slot pointer
/// held in the registry header without further validation.
pub trait StampPort {
    /// Creates a registry and returns its handle.
    fn create(&mut self) -> io::Result<StampHandle>;

    /// Destroys the registry behind `handle`.
    fn destroy(&mut self, handle: StampHandle) -> io::Result<()>;

    /// Reads the stamp at `slot`.
    fn stamp(&mut self, handle: StampHandle, slot: u32) -> io::Result<u64>;

    /// Writes `value` into the stamp at `slot`.
    fn set_stamp(&mut self, handle: StampHandle, slot: u32, value: u64) -> io::Result<()>;
}
