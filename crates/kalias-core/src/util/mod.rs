//! Utility functions and constants used throughout the crate.

pub mod constants;
mod dump;

pub use constants::*;
pub use dump::hexdump;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Adds a labeled progress bar for an engine phase to `progress`.
pub fn phase_bar(progress: &MultiProgress, name: &str, len: u64) -> ProgressBar {
    let bar = progress.add(ProgressBar::new(len));
    bar.set_style(
        ProgressStyle::with_template(
            "{msg:<20} {wide_bar:40.cyan/blue} {pos:>8}/{len:<8} [{elapsed_precise}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(name.to_string());
    bar
}

/// Overwrites a slice with its default value using volatile writes, then
/// fences, so the stores survive optimization. Used to scrub technique state
/// holding kernel object handles before release.
pub fn wipe<T: Copy + Default>(items: &mut [T]) {
    for item in items.iter_mut() {
        // Safety: `item` is a valid, aligned, exclusive reference.
        unsafe { std::ptr::write_volatile(item, T::default()) };
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

#[test]
fn wipe_zeroes_every_element() {
    let mut handles = [0xdeadbeefu64; 4];
    wipe(&mut handles);
    assert_eq!(handles, [0u64; 4]);
}

#[test]
fn hexdump_groups_and_breaks_lines() {
    let bytes: Vec<u8> = (0u8..80).collect();
    let dump = hexdump(&bytes);
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0001020304050607 08090a0b"));
    assert_eq!(lines[1].split(' ').count(), 2);
}
