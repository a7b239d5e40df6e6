//! # kalias Dummy Techniques
//!
//! Tag-spraying stub techniques over the simulated kernel. Each sprayed
//! object is one pool allocation whose first word is a family tag xored
//! with the allocation id, which makes search trivial and deterministic.
//! The kernel access primitives go straight through the simulated kernel
//! address space. Useful for exercising the engine without the stamp
//! machinery, and as the minimal reference for writing a new technique.

#![warn(missing_docs)]

pub mod dummy;

pub use dummy::DummyTechnique;
