//! Structured collection events.
//!
//! With the `tracing` feature enabled the collector emits one event per
//! phase boundary, carrying the small payload of interest at that point.
//! Without the feature every emitter compiles to nothing.

#[cfg(feature = "tracing")]
mod internal {
    use tracing::{debug, trace};

    pub fn allocate_start(size: usize) {
        trace!(size, "allocate_start");
    }

    pub fn allocate_done(object: usize) {
        trace!(object, "allocate_done");
    }

    pub fn mark_start(incremental: bool, gray_stack_size: usize) {
        debug!(incremental, gray_stack_size, "mark_start");
    }

    pub fn mark_done(incremental: bool, gray_stack_size: usize) {
        debug!(incremental, gray_stack_size, "mark_done");
    }

    pub fn sweep_start(arenas: usize) {
        debug!(arenas, "sweep_start");
    }

    pub fn sweep_done(free_cells: usize, largest_free_block: usize) {
        debug!(free_cells, largest_free_block, "sweep_done");
    }
}

#[cfg(not(feature = "tracing"))]
mod internal {
    #[inline]
    pub fn allocate_start(_size: usize) {}
    #[inline]
    pub fn allocate_done(_object: usize) {}
    #[inline]
    pub fn mark_start(_incremental: bool, _gray_stack_size: usize) {}
    #[inline]
    pub fn mark_done(_incremental: bool, _gray_stack_size: usize) {}
    #[inline]
    pub fn sweep_start(_arenas: usize) {}
    #[inline]
    pub fn sweep_done(_free_cells: usize, _largest_free_block: usize) {}
}

pub(crate) use internal::{
    allocate_done, allocate_start, mark_done, mark_start, sweep_done, sweep_start,
};
