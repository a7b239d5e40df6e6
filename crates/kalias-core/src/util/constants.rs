/// Number of bits to shift to get the page number from an address.
pub const PAGE_SHIFT: usize = 12;
/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask selecting the in-page offset bits of an address.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Length of the leading slice of each PUAF page scanned for object
/// signatures. Objects land page-aligned often enough that scanning the
/// first sixteenth of a page finds them; scanning more only costs time.
pub const SEARCH_WINDOW: usize = PAGE_SIZE / 16;
/// Scan stride in bytes. Object headers are 8-byte aligned.
pub const SEARCH_STRIDE: usize = 8;

/// Free-page acquisition stops once `puaf_pages / GRAB_GOAL_DIVISOR` pages
/// have been seen cycling through the allocator (25% by default).
pub const GRAB_GOAL_DIVISOR: usize = 4;
/// Upper bound on allocator churn during free-page acquisition, counted in
/// page-equivalents of duplicated memory.
pub const CHURN_CAP_PAGES: u64 = 400_000;
