//! # kalias Stamp Technique
//!
//! A dual-capable krkw technique built on stamp registries, a kernel
//! object family that stores an array of `u64` stamps behind a pointer
//! kept in the object's own header. The indexed stamp accessors trust
//! that pointer, so once a registry header is reachable through a puaf
//! alias, rewriting the pointer turns the accessors into arbitrary kernel
//! reads and writes.
//!
//! The same object family serves both directions. Under twin sharing one
//! owning instance on the read channel allocates and releases registries
//! while a delegate instance on the write channel reuses the owner's
//! confirmed object, so a single registry backs both primitives.

#![warn(missing_docs)]

pub mod port;
pub mod stamp;

pub use port::{StampHandle, StampPort};
pub use stamp::StampTechnique;
