//! # kalias Simulated Kernel
//!
//! An in-process substrate that stands in for a kernel with an established
//! puaf condition, so the whole krkw engine can be exercised end to end
//! without a vulnerable kernel: a page pool doubling as kernel address
//! space, aliased "dangling" pages, a bump allocator with a scripted page
//! reclaim plan, and a stamp registry port whose accessors behave like
//! their kernel counterparts.

#![warn(missing_docs)]

pub mod duplicator;
pub mod kernel;
pub mod pool;
pub mod stamp_port;

pub use duplicator::SimDuplicator;
pub use kernel::{
    SIM_KAS_BASE, SIM_PROC_PID_OFFSET, SimHandle, SimKernel, sim_capabilities, sim_stamp_layout,
};
pub use pool::PagePool;
pub use stamp_port::SimStampPort;
