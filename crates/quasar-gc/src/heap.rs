//! Allocator front-end: bump pointer, size-classed free lists, arena pool.
//!
//! Normal objects come from two cooperating paths. The *bump* path carves
//! cells off the tail of the current bump arena; the *fit* path serves
//! requests from free blocks recovered by sweep, held in size-classed
//! lists. Which path is tried first is decided by the sweep-time
//! fragmentation policy (`use_bump_allocator`).

use std::ptr::{self, NonNull};

use sys_pages::{Mmap, MmapOptions};

use crate::arena::{Arena, BlockType, ARENA_CELL_COUNT, ARENA_SIZE, CELL_SIZE, FIRST_CELL_INDEX};
use crate::object::{ObjectHeader, ObjectRef};

/// Free blocks of up to this many cells are kept in exact-size lists.
const SMALL_FREE_LISTS: usize = 31;

/// log2 of the smallest block size handled by the bucketed large lists.
const LARGE_FIRST_EXP: usize = 5;

/// Number of power-of-two buckets for larger free blocks.
const LARGE_FREE_LISTS: usize =
    crate::arena::ARENA_SIZE_EXP - crate::arena::CELL_SIZE_EXP - LARGE_FIRST_EXP + 1;

/// An active arena plus the mapping that backs it.
///
/// The header lives inside the mapping; the handle keeps the mapping alive
/// and drops the header's gray stack before the memory goes away.
pub(crate) struct ArenaHandle {
    pub(crate) header: NonNull<Arena>,
    _map: Mmap,
}

impl ArenaHandle {
    /// Maps and initializes a fresh arena. `None` when the OS cannot back
    /// another arena.
    fn map_new() -> Option<ArenaHandle> {
        let map = unsafe {
            MmapOptions::new()
                .len(ARENA_SIZE)
                .align(ARENA_SIZE)
                .map_anon()
                .ok()?
        };
        let header = unsafe { Arena::init(map.ptr()) };
        Some(ArenaHandle { header, _map: map })
    }
}

impl Drop for ArenaHandle {
    fn drop(&mut self) {
        // The gray stack is the only non-trivial field in the in-place
        // header; it must be dropped before the mapping is released.
        unsafe {
            ptr::drop_in_place(ptr::addr_of_mut!((*self.header.as_ptr()).gray_stack));
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    ptr: NonNull<u8>,
    cells: usize,
}

/// Size-classed free lists over blocks recovered by sweep.
///
/// Blocks of 1..=`SMALL_FREE_LISTS` cells sit in exact-size lists; larger
/// blocks are bucketed by the floor of their log2 size. A request is served
/// first-fit, splitting the remainder back into the lists.
pub(crate) struct FitAllocator {
    small: [Vec<FreeBlock>; SMALL_FREE_LISTS],
    large: [Vec<FreeBlock>; LARGE_FREE_LISTS],
}

impl FitAllocator {
    fn new() -> Self {
        Self {
            small: std::array::from_fn(|_| Vec::new()),
            large: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Empties every list. Sweep re-registers all surviving free blocks.
    pub(crate) fn clear(&mut self) {
        for list in &mut self.small {
            list.clear();
        }
        for list in &mut self.large {
            list.clear();
        }
    }

    /// Registers a free block. The block's head cell is tagged `Free` so
    /// the next sweep recognizes the run even if the block is never
    /// allocated from.
    pub(crate) fn add(&mut self, ptr: NonNull<u8>, cells: usize) {
        debug_assert!(cells > 0);
        unsafe {
            let arena = Arena::from_cell(ptr.as_ptr());
            (*arena.as_ptr()).set_blocktype(Arena::cell_index(ptr.as_ptr()), BlockType::Free);
        }
        let block = FreeBlock { ptr, cells };
        if cells <= SMALL_FREE_LISTS {
            self.small[cells - 1].push(block);
        } else {
            self.large[Self::large_index(cells)].push(block);
        }
    }

    fn large_index(cells: usize) -> usize {
        debug_assert!(cells > SMALL_FREE_LISTS);
        let log2 = usize::BITS as usize - 1 - cells.leading_zeros() as usize;
        (log2 - LARGE_FIRST_EXP).min(LARGE_FREE_LISTS - 1)
    }

    /// Takes `cells` cells from the lists, splitting the remainder of the
    /// chosen block back. `None` when no block fits.
    fn allocate(&mut self, cells: usize) -> Option<NonNull<u8>> {
        let block = self.take_block(cells)?;
        if block.cells > cells {
            let rest = unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(cells * CELL_SIZE)) };
            self.add(rest, block.cells - cells);
        }
        Some(block.ptr)
    }

    fn take_block(&mut self, cells: usize) -> Option<FreeBlock> {
        if cells <= SMALL_FREE_LISTS {
            // Exact list first, then any bigger small list.
            for n in cells..=SMALL_FREE_LISTS {
                if let Some(block) = self.small[n - 1].pop() {
                    return Some(block);
                }
            }
            // Any bucketed block is larger than a small request.
            for bucket in &mut self.large {
                if let Some(block) = bucket.pop() {
                    return Some(block);
                }
            }
            return None;
        }

        let start = Self::large_index(cells);
        // The starting bucket can hold blocks smaller than the request;
        // scan it first-fit.
        if let Some(pos) = self.large[start].iter().position(|b| b.cells >= cells) {
            return Some(self.large[start].swap_remove(pos));
        }
        // Every block in a higher bucket fits.
        for bucket in &mut self.large[start + 1..] {
            if let Some(block) = bucket.pop() {
                return Some(block);
            }
        }
        None
    }
}

/// The arena-backed part of the heap.
pub(crate) struct Heap {
    /// Active arenas in insertion order. Includes the bump arena.
    pub(crate) arenas: Vec<ArenaHandle>,
    /// Swept-empty arenas waiting to be reused as bump arenas.
    pub(crate) free_arenas: Vec<ArenaHandle>,
    pub(crate) fit: FitAllocator,
    /// Prefer the bump path while the heap is not fragmented; set by the
    /// sweep-time fragmentation policy.
    pub(crate) use_bump_allocator: bool,
    bump_ptr: Option<NonNull<u8>>,
    bump_remaining: usize,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            arenas: Vec::new(),
            free_arenas: Vec::new(),
            fit: FitAllocator::new(),
            use_bump_allocator: true,
            bump_ptr: None,
            bump_remaining: 0,
        }
    }

    pub(crate) fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    pub(crate) fn arena(&self, index: usize) -> NonNull<Arena> {
        self.arenas[index].header
    }

    /// The arena currently holding the bump region, if any.
    pub(crate) fn bump_arena(&self) -> Option<NonNull<Arena>> {
        self.bump_ptr.map(|p| Arena::from_cell(p.as_ptr()))
    }

    /// Cell index of the bump pointer within its arena.
    pub(crate) fn bump_cell_index(&self) -> Option<usize> {
        self.bump_ptr.map(|p| Arena::cell_index(p.as_ptr()))
    }

    /// Allocates `cells` contiguous cells and returns the zeroed object,
    /// born white. The fragmentation policy picks the first path; either
    /// path falls back to the other.
    pub(crate) fn allocate(&mut self, cells: usize) -> Option<ObjectRef> {
        debug_assert!(cells > 0 && cells <= ARENA_CELL_COUNT - FIRST_CELL_INDEX);
        let ptr = if self.use_bump_allocator {
            self.bump_allocate(cells)
                .or_else(|| self.fit.allocate(cells))
        } else {
            self.fit
                .allocate(cells)
                .or_else(|| self.bump_allocate(cells))
        }?;
        Some(unsafe { Self::materialize(ptr, cells) })
    }

    fn bump_allocate(&mut self, cells: usize) -> Option<NonNull<u8>> {
        if self.bump_remaining < cells {
            self.renew_bump_arena()?;
        }
        let ptr = self.bump_ptr?;
        self.bump_remaining -= cells;
        self.bump_ptr = if self.bump_remaining == 0 {
            None
        } else {
            Some(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(cells * CELL_SIZE)) })
        };
        Some(ptr)
    }

    /// Retires the current bump region and installs a fresh arena, reusing
    /// a swept-empty one when available.
    fn renew_bump_arena(&mut self) -> Option<()> {
        self.retire_bump_region();
        let handle = self
            .free_arenas
            .pop()
            .or_else(ArenaHandle::map_new)?;
        let base = handle.header.as_ptr().cast::<u8>();
        self.bump_ptr = NonNull::new(unsafe { base.add(FIRST_CELL_INDEX * CELL_SIZE) });
        self.bump_remaining = ARENA_CELL_COUNT - FIRST_CELL_INDEX;
        self.arenas.push(handle);
        Some(())
    }

    /// Hands the unused bump tail to the fit allocator.
    fn retire_bump_region(&mut self) {
        if let Some(ptr) = self.bump_ptr.take() {
            if self.bump_remaining > 0 {
                self.fit.add(ptr, self.bump_remaining);
            }
            self.bump_remaining = 0;
        }
    }

    /// Zeroes the block and tags it: white head, extent interior.
    unsafe fn materialize(ptr: NonNull<u8>, cells: usize) -> ObjectRef {
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, cells * CELL_SIZE);
            let arena = Arena::from_cell(ptr.as_ptr());
            let index = Arena::cell_index(ptr.as_ptr());
            let arena = &mut *arena.as_ptr();
            arena.set_blocktype(index, BlockType::White);
            for i in 1..cells {
                arena.set_blocktype(index + i, BlockType::Extent);
            }
            NonNull::new_unchecked(ptr.as_ptr().cast::<ObjectHeader>())
        }
    }
}
