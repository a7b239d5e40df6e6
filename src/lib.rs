//! # Kalias
//!
//! Kalias converts a physical use-after-free (a set of user pages whose
//! backing frames the kernel considers free) into a stable kernel
//! read/write session.
//!
//! This umbrella crate re-exports the engine from `kalias-core` and, behind
//! feature flags, the simulated kernel substrate and the bundled technique
//! crates. Most users want the `Session` type:
//!
//! ```ignore
//! let mut session = Session::builder()
//!     .kread_technique(kread_family, kread)
//!     .kwrite_technique(kwrite_family, kwrite)
//!     .capabilities(caps)
//!     .puaf_pages(puaf)
//!     .copy_region(copy)
//!     .duplicator(duplicator)
//!     .build()?;
//! let report = session.run()?;
//! let word = session.kread_u64(kaddr)?;
//! ```
//!
//! ## Features
//!
//! - `sim`: the in-process simulated kernel (`kalias-sim`).
//! - `dummy`: tag-spraying stub techniques over the simulated kernel.
//! - `stamp`: the dual-capable stamp registry technique.

pub use kalias_core::*;

#[cfg(feature = "sim")]
pub use kalias_sim;

#[cfg(feature = "dummy")]
pub use kalias_dummy;

#[cfg(feature = "stamp")]
pub use kalias_stamp;
