//! Side table for huge objects.
//!
//! Objects above the large allocation threshold get their own
//! arena-aligned mapping, so their address coincides with an arena base —
//! the recognition predicate for huge objects. Their only metadata is a
//! mark bit in this table; an entry exists iff the huge object is live.

use std::collections::HashMap;

use sys_pages::{Mmap, MmapOptions};

use crate::arena::{self, ARENA_SIZE};
use crate::object::{ObjectHeader, ObjectRef};

struct HugeBlock {
    mark: bool,
    _map: Mmap,
}

/// Maps huge-object addresses to their mark bit and backing memory.
pub(crate) struct HugeBlockTable {
    blocks: HashMap<usize, HugeBlock>,
}

impl HugeBlockTable {
    pub(crate) fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    /// Maps a fresh huge block. The returned object is zeroed (white) and
    /// its address is arena-aligned. `None` when the OS refuses the
    /// mapping.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<ObjectRef> {
        let map = unsafe {
            MmapOptions::new()
                .len(size)
                .align(ARENA_SIZE)
                .map_anon()
                .ok()?
        };
        let ptr = map.ptr();
        debug_assert!(arena::is_arena_base(ptr));
        self.blocks
            .insert(ptr as usize, HugeBlock { mark: false, _map: map });
        std::ptr::NonNull::new(ptr.cast::<ObjectHeader>())
    }

    /// Sets the mark bit; returns whether it flipped from unmarked.
    pub(crate) fn mark(&mut self, object: ObjectRef) -> bool {
        match self.blocks.get_mut(&(object.as_ptr() as usize)) {
            Some(block) if !block.mark => {
                block.mark = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_marked(&self, object: ObjectRef) -> bool {
        self.blocks
            .get(&(object.as_ptr() as usize))
            .is_some_and(|b| b.mark)
    }

    pub(crate) fn has(&self, object: ObjectRef) -> bool {
        self.blocks.contains_key(&(object.as_ptr() as usize))
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Releases every unmarked block back to the OS and clears the mark
    /// bits of the survivors. Returns the number of blocks freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|_, block| std::mem::take(&mut block.mark));
        before - self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::LARGE_ALLOC_EXP;

    #[test]
    fn test_allocate_is_arena_aligned() {
        let mut table = HugeBlockTable::new();
        let obj = table.allocate((1 << LARGE_ALLOC_EXP) + 1).expect("map failed");
        assert!(arena::is_arena_base(obj.as_ptr().cast()));
        assert!(table.has(obj));
        assert!(!table.is_marked(obj));
    }

    #[test]
    fn test_mark_flips_once() {
        let mut table = HugeBlockTable::new();
        let obj = table.allocate(1 << 14).expect("map failed");

        assert!(table.mark(obj));
        assert!(!table.mark(obj), "second mark must not flip");
        assert!(table.is_marked(obj));
    }

    #[test]
    fn test_sweep_releases_unmarked() {
        let mut table = HugeBlockTable::new();
        let dead = table.allocate(1 << 14).expect("map failed");
        let live = table.allocate(1 << 14).expect("map failed");
        table.mark(live);

        assert_eq!(table.sweep(), 1);
        assert!(!table.has(dead));
        assert!(table.has(live));
        // Survivors enter the next cycle unmarked.
        assert!(!table.is_marked(live));
    }
}
