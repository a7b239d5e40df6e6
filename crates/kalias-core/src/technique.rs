//! The operation contract shared by all krkw spray techniques.
//!
//! A technique wraps one kernel object family that user space can allocate
//! in bulk. During the spray phase the engine asks it to allocate objects by
//! consecutive ids and to recognize one of its objects inside a PUAF page;
//! once an object is confirmed to overlap a PUAF page, the technique turns
//! it into a kernel read or kernel write lever.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The direction a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    /// The channel performs kernel reads.
    Read,
    /// The channel performs kernel writes.
    Write,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Read => write!(f, "kread"),
            ChannelRole::Write => write!(f, "kwrite"),
        }
    }
}

/// Read-capable technique families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KreadTechnique {
    /// Tag-spraying stub over the simulated kernel.
    Dummy,
    /// Indexed-stamp registry objects (dual-capable).
    Stamp,
}

/// Write-capable technique families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KwriteTechnique {
    /// Tag-spraying stub over the simulated kernel.
    Dummy,
    /// Indexed-stamp registry objects (dual-capable).
    Stamp,
}

/// The object a channel confirmed to overlap a PUAF page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FoundObject {
    /// Allocation id of the object, as passed to [`Technique::allocate`].
    pub id: u64,
    /// User-space address at which the object's bytes are visible through
    /// the PUAF alias.
    pub uaddr: usize,
}

/// Errors surfaced by technique operations.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum TechniqueError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("kernel access of {0} bytes is not a multiple of the technique word size {1}")]
    UnalignedSize(usize, usize),
    #[error("object id {0} has no backing handle")]
    UnknownId(u64),
}

/// Operation contract for a krkw spray technique.
///
/// Lifecycle, driven by the engine:
///
/// 1. `init` - acquire whatever OS resources the family needs.
/// 2. `allocate(id)` - called with consecutive ids, batch by batch, until one
///    object is spotted inside a PUAF page or `maximum_id` is reached.
/// 3. `search(candidates, uaddr)` - decide whether the bytes at `uaddr`
///    are the header of one of the objects allocated for an id inside
///    `candidates`, and if so which one.
/// 4. `kread`/`kwrite` - the actual primitive, exercised through the
///    confirmed object. Exactly one of the two is used per channel.
/// 5. `find_proc` - resolve the kernel address of the current process once,
///    right after confirmation.
/// 6. `deallocate(id)` - cleanup sweep over every unconfirmed id.
/// 7. `free` - release remaining resources and scrub owned state.
///
/// Under twin sharing a second, non-owning instance of a dual-capable family
/// serves the write channel: its `allocate`/`deallocate`/`free` are no-ops
/// and its `search` only recognizes the owning instance's confirmed object,
/// so both channels end up reporting the identical discovery.
pub trait Technique {
    /// Short family name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Acquires the OS resources the technique needs before spraying.
    fn init(&mut self) -> Result<(), TechniqueError>;

    /// Size in bytes of one sprayed object.
    ///
    /// Must be nonzero, 8-byte aligned, and no larger than 15/16 of a page,
    /// so that whole objects fit behind the scan window of a page.
    fn object_size(&self) -> usize;

    /// Hard ceiling on allocation ids (exclusive).
    fn maximum_id(&self) -> u64;

    /// Allocates the object for `id`. Ids arrive consecutively from zero.
    fn allocate(&mut self, id: u64) -> Result<(), TechniqueError>;

    /// Probes `uaddr` for the header of an object whose id lies in
    /// `candidates` (the ids allocated since the last unsuccessful scan).
    /// Returns the matching id, or `None`.
    fn search(&mut self, candidates: Range<u64>, uaddr: usize) -> Option<u64>;

    /// Reads `data.len()` bytes of kernel memory at `kaddr` through the
    /// confirmed object.
    ///
    /// # Panics
    ///
    /// The default implementation panics: requesting a read from a family
    /// without read capability is a programming error.
    fn kread(
        &mut self,
        found: &FoundObject,
        kaddr: u64,
        data: &mut [u8],
    ) -> Result<(), TechniqueError> {
        let _ = (found, kaddr, data);
        panic!("technique {} has no kread capability", self.name());
    }

    /// Writes `data` to kernel memory at `kaddr` through the confirmed
    /// object.
    ///
    /// # Panics
    ///
    /// The default implementation panics: requesting a write from a family
    /// without write capability is a programming error.
    fn kwrite(
        &mut self,
        found: &FoundObject,
        data: &[u8],
        kaddr: u64,
    ) -> Result<(), TechniqueError> {
        let _ = (found, data, kaddr);
        panic!("technique {} has no kwrite capability", self.name());
    }

    /// Resolves the kernel address of the current process, if the family
    /// knows how to. Invoked at most once per channel, right after a
    /// successful search.
    fn find_proc(&mut self, found: &FoundObject) -> Option<u64> {
        let _ = found;
        None
    }

    /// Releases the object for `id` during the cleanup sweep. Failures are
    /// the technique's to log; the sweep itself never fails.
    fn deallocate(&mut self, id: u64);

    /// Releases remaining resources and scrubs technique-owned state.
    fn free(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    impl Technique for ReadOnly {
        fn name(&self) -> &'static str {
            "read-only"
        }
        fn init(&mut self) -> Result<(), TechniqueError> {
            Ok(())
        }
        fn object_size(&self) -> usize {
            64
        }
        fn maximum_id(&self) -> u64 {
            8
        }
        fn allocate(&mut self, _id: u64) -> Result<(), TechniqueError> {
            Ok(())
        }
        fn search(&mut self, _candidates: Range<u64>, _uaddr: usize) -> Option<u64> {
            None
        }
        fn deallocate(&mut self, _id: u64) {}
        fn free(&mut self) {}
    }

    #[test]
    #[should_panic(expected = "no kwrite capability")]
    fn missing_capability_fails_loudly() {
        let mut technique = ReadOnly;
        let found = FoundObject { id: 0, uaddr: 0 };
        let _ = technique.kwrite(&found, &[0u8; 8], 0xffff_fff0_0000_0000);
    }

    #[test]
    fn roles_format_as_channel_names() {
        assert_eq!(ChannelRole::Read.to_string(), "kread");
        assert_eq!(ChannelRole::Write.to_string(), "kwrite");
    }
}
