//! Region duplication through the simulated kernel.

use std::io;

use kalias_core::acquire::RegionDuplicator;
use kalias_core::puaf::CopyRegion;

use crate::kernel::SimHandle;

/// Feeds the engine's copy churn into the simulated kernel, where the
/// reclaim plan decides when an aliased page becomes a copy destination.
pub struct SimDuplicator {
    kernel: SimHandle,
}

impl SimDuplicator {
    /// Wraps a shared kernel handle.
    pub fn new(kernel: SimHandle) -> Self {
        Self { kernel }
    }
}

impl RegionDuplicator for SimDuplicator {
    fn duplicate(&mut self, copy: &CopyRegion) -> io::Result<()> {
        self.kernel.borrow_mut().churn_copy(copy)
    }
}
