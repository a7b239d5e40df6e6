//! # kalias Core
//!
//! `kalias-core` is the engine that turns a pre-established physical
//! use-after-free (PUAF) condition into a stable kernel read/write (krkw)
//! primitive. The caller supplies a set of user-visible pages whose backing
//! physical pages the kernel erroneously considers free; this crate sprays
//! allocator-reachable kernel objects, scans the PUAF pages for an object
//! signature, and turns the first overlapping object into a read or write
//! lever.
//!
//! ## Architecture Overview
//!
//! The engine is built around two trait seams:
//!
//! - [`technique::Technique`] - The operation contract every spray technique
//!   implements: allocate objects by id, recognize them inside a PUAF page,
//!   perform kernel reads or writes through a confirmed object, and release
//!   everything afterwards.
//!
//! - [`acquire::RegionDuplicator`] - The allocator-churn primitive used
//!   during free-page acquisition: duplicate a sentinel-led memory region so
//!   the kernel recycles the freed physical pages.
//!
//! ## Main Components
//!
//! - [`session::Session`] - The krkw façade. Built via
//!   [`session::SessionBuilder`], it owns the PUAF page set, the copy region,
//!   a region duplicator, and one [`channel::Channel`] per direction
//!   (kread and kwrite). [`session::Session::run`] drives free-page
//!   acquisition, both spray phases, and the cleanup sweeps.
//!
//! - [`caps::Capabilities`] - An explicit per-kernel-build descriptor of
//!   which techniques are usable and which object layouts they need. Passed
//!   by value; nothing in the engine is process-global.
//!
//! - [`select`] module - Validates a requested technique pairing against the
//!   capability descriptor before any channel state exists.
//!
//! ## Safety
//!
//! The engine reads PUAF pages through raw pointers. The caller guarantees
//! that every page address stays mapped and readable for the lifetime of the
//! session; everything else is safe Rust.

#![warn(missing_docs)]

pub mod acquire;
pub mod caps;
pub mod channel;
pub mod puaf;
pub mod select;
pub mod session;
pub mod technique;
pub mod util;

pub use acquire::{AcquireStats, RegionDuplicator};
pub use caps::{Capabilities, StampLayout};
pub use channel::Channel;
pub use puaf::{CopyRegion, PuafPages};
pub use select::ConfigError;
pub use session::{RunError, RunReport, Session, SessionBuilder, SessionConfig};
pub use technique::{
    ChannelRole, FoundObject, KreadTechnique, KwriteTechnique, Technique, TechniqueError,
};
