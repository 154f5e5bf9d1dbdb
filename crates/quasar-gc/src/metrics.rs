//! Per-collection statistics.

use std::time::Duration;

/// How the most recent cycle was driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None,
    /// A full cycle marked entirely inside `collect()`.
    Full,
    /// A full cycle whose marking was partially done by earlier
    /// incremental slices.
    IncrementalFull,
}

/// Statistics from the most recent collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// How the cycle was driven.
    pub kind: CollectionKind,
    /// Duration of the final (non-incremental) mark inside `collect()`.
    pub mark_duration: Duration,
    /// Duration of the sweep, including weakref resolution.
    pub sweep_duration: Duration,
    /// Incremental mark slices that contributed to this cycle.
    pub increments: usize,
    /// Free cells registered with the fit allocator after sweep.
    pub free_cells: usize,
    /// Largest contiguous free block after sweep, in cells.
    pub largest_free_block: usize,
    /// Arenas that were scanned.
    pub arenas_swept: usize,
    /// Arenas found empty and moved to the recycling pool.
    pub arenas_recycled: usize,
    /// Huge blocks released back to the OS.
    pub huge_blocks_freed: usize,
    /// Collections since the collector was created.
    pub total_collections: usize,
}

impl GcMetrics {
    /// All-zero metrics, used before the first collection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: CollectionKind::None,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            increments: 0,
            free_cells: 0,
            largest_free_block: 0,
            arenas_swept: 0,
            arenas_recycled: 0,
            huge_blocks_freed: 0,
            total_collections: 0,
        }
    }
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}
