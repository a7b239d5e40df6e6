//! # Kalias
//!
//! Kalias turns a physical use-after-free (a set of user pages whose backing
//! frames the kernel considers free) into a stable kernel read/write session.
//! It includes modules that handle the different stages of the conversion,
//! such as free-page acquisition, object spraying, and technique cleanup.
//!
//! ## Quickstart guide
//!
//! To build the crate on a Linux system with Rust installed, run the
//! following commands:
//!
//! ```sh
//! # Install Rust using rustup
//! curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh
//!
//! # Build and run the crate
//! cargo build --release
//! cargo run --release --bin=krkw_sim
//!```
//!
//! This compiles the crate and runs a full session against the simulated
//! kernel with default options. The default options use the stamp technique
//! on both channels, which shares one spray between them. After a successful
//! compilation, the binary is located at `target/release/krkw_sim`. Use
//! `target/release/krkw_sim --help` to see available options.
//!
//! ## Modules
//!
//! - `technique`: Resolves technique names from the command line into boxed
//!   technique objects, including the shared twin pair.
//!
//! ## External Crates
//!
//! - `log`: Used for logging throughout the crate.

pub mod technique;

#[macro_use]
extern crate log;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
