//! The collector: phase machine, allocation entry point, write barrier,
//! mark engine, sweep, and weakref resolution.

use std::ptr::NonNull;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::arena::{self, Arena, BlockType, CELL_SIZE, LARGE_ALLOC_EXP};
use crate::config::CollectorConfig;
use crate::events;
use crate::heap::Heap;
use crate::hugeblock::HugeBlockTable;
use crate::metrics::{CollectionKind, GcMetrics};
use crate::object::{MarkColor, ObjectHeader, ObjectRef};
use crate::shadowstack::ShadowStack;
use crate::trace::Tracer;

/// Floor on the number of gray-stack entries processed per incremental
/// slice. Together with the halving rule this bounds the number of
/// increments per cycle by O(log n) while keeping each pause proportional
/// to the frontier sampled at slice entry.
const INC_MARK_MIN: usize = 64;

/// Collector phase.
///
/// ```text
/// Pause  --(threshold / explicit collect / barrier)--> Mark
/// Mark   --(gray frontier drained)------------------>  Collect
/// Collect --(sweep completes)----------------------->  Pause
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No cycle in progress.
    Pause,
    /// A mark is underway; the write barrier is live.
    Mark,
    /// Marking finished; the heap is waiting to be swept.
    Collect,
}

#[derive(Clone, Copy)]
struct WeakrefEntry {
    holder: ObjectRef,
    slot: NonNull<*mut ObjectHeader>,
}

/// The collector. One value owns the whole heap; every public operation is
/// a method and runs to completion on the caller's thread.
///
/// Dropping the collector releases all arenas and huge blocks and lifts
/// the shadow-stack trap page before its buffer is unmapped.
pub struct Collector {
    phase: Phase,
    bytes_since_collection: usize,
    bytes_since_incmark: usize,
    gray_stack_size: usize,
    free_cells: usize,
    largest_free_block: usize,
    increments_this_cycle: usize,
    total_collections: usize,
    heap: Heap,
    hbtable: HugeBlockTable,
    shadow_stack: ShadowStack,
    prebuilt_objects: Vec<ObjectRef>,
    weakrefs: Vec<WeakrefEntry>,
    gp_gray_stack: Vec<ObjectRef>,
    tracer: Rc<dyn Tracer>,
    config: CollectorConfig,
    last_metrics: GcMetrics,
}

impl Collector {
    /// Creates a collector with thresholds read from the environment
    /// (`MAJOR_COLLECTION`, `INCMARK`; see [`CollectorConfig::from_env`]).
    ///
    /// # Panics
    ///
    /// Panics if the shadow stack cannot be mapped; there is no useful way
    /// to run without roots.
    #[must_use]
    pub fn new(tracer: Rc<dyn Tracer>) -> Self {
        Self::with_config(tracer, CollectorConfig::from_env())
    }

    /// Creates a collector with explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the shadow stack cannot be mapped.
    #[must_use]
    pub fn with_config(tracer: Rc<dyn Tracer>, config: CollectorConfig) -> Self {
        let shadow_stack = ShadowStack::new(config.shadowstack_capacity)
            .expect("quasar-gc: failed to map the shadow stack");
        Self {
            phase: Phase::Pause,
            bytes_since_collection: 0,
            bytes_since_incmark: 0,
            gray_stack_size: 0,
            free_cells: 0,
            largest_free_block: 0,
            increments_this_cycle: 0,
            total_collections: 0,
            heap: Heap::new(),
            hbtable: HugeBlockTable::new(),
            shadow_stack,
            prebuilt_objects: Vec::new(),
            weakrefs: Vec::new(),
            gp_gray_stack: Vec::new(),
            tracer,
            config,
            last_metrics: GcMetrics::new(),
        }
    }

    /// Allocates `size` bytes (the object header included) and returns the
    /// new object, born white. May first run a mark increment or a full
    /// collection when the byte thresholds are exceeded.
    ///
    /// Returns `None` when both allocator paths are exhausted and the OS
    /// cannot back more memory; the mutator decides how to react.
    pub fn allocate(&mut self, size: usize) -> Option<ObjectRef> {
        events::allocate_start(size);

        if self.bytes_since_collection > self.config.major_collection_threshold {
            self.collect();
        } else if self.bytes_since_incmark > self.config.incmark_threshold {
            self.mark(true);
        }

        let result = if size <= 1 << LARGE_ALLOC_EXP {
            let cells = size.div_ceil(CELL_SIZE).max(1);
            self.heap.allocate(cells)
        } else {
            self.hbtable.allocate(size)
        };

        self.bytes_since_collection += size;
        self.bytes_since_incmark += size;

        events::allocate_done(result.map_or(0, |object| object.as_ptr() as usize));
        result
    }

    /// Runs a full cycle: complete mark, then sweep.
    pub fn collect(&mut self) {
        let start = Instant::now();
        self.mark(false);
        let mark_duration = start.elapsed();
        self.sweep();
        self.last_metrics.mark_duration = mark_duration;
        if self.last_metrics.increments > 0 {
            self.last_metrics.kind = CollectionKind::IncrementalFull;
        }
        self.bytes_since_collection = 0;
    }

    /// Write barrier. Call *before* overwriting any reference field of
    /// `object` (Dijkstra style: shade the source).
    ///
    /// Idempotent while the object is already gray. Dirtying an object
    /// outside a pause implicitly keeps the cycle in its mark phase.
    pub fn write(&mut self, object: ObjectRef) {
        let header = unsafe { &mut *object.as_ptr() };
        if header.is_gray() {
            return;
        }
        header.set_gray();

        // One-time registration: from now on this prebuilt is a root of
        // every cycle.
        if header.is_prebuilt() && !header.is_prebuilt_registered() {
            header.set_prebuilt_registered();
            self.prebuilt_objects.push(object);
        }

        if self.phase == Phase::Pause {
            // The gray flag is observed by the next mark start.
            return;
        }

        // The barrier fired mid-cycle: marking must resume before any
        // sweep.
        self.phase = Phase::Mark;

        if header.is_prebuilt() {
            // No reachability test: prebuilt objects are always live.
            self.push_gp(object);
        } else if arena::is_arena_base(object.as_ptr().cast()) {
            if self.hbtable.is_marked(object) {
                self.push_gp(object);
            }
        } else if unsafe { blocktype_of(object) } == BlockType::Black {
            // Black to dark gray: the object must be rescanned.
            self.push_arena_gray(object);
        }
    }

    /// Registers a weak reference: `slot` (a field of `holder`) is nulled
    /// by the sweep that collects its target.
    ///
    /// `holder` must be a normal arena object and `*slot` must point at a
    /// valid object when this is called. Weakrefs to prebuilt targets are
    /// not recorded; prebuilts never die.
    pub fn register_weakref(&mut self, holder: ObjectRef, slot: NonNull<*mut ObjectHeader>) {
        debug_assert!(!unsafe { (*holder.as_ptr()).is_prebuilt() });
        debug_assert!(!arena::is_arena_base(holder.as_ptr().cast()));

        let target = unsafe { slot.as_ptr().read() };
        debug_assert!(!target.is_null());
        if let Some(target) = NonNull::new(target) {
            if unsafe { (*target.as_ptr()).is_prebuilt() } {
                return;
            }
            self.weakrefs.push(WeakrefEntry { holder, slot });
        }
    }

    /// Pushes a root. During a cycle the object is also re-grayed so a
    /// newly surfaced root cannot escape tracing.
    pub fn shadowstack_push(&mut self, object: ObjectRef) {
        if self.phase != Phase::Pause {
            self.phase = Phase::Mark;
            self.push_object(object);
        }
        self.shadow_stack.push(object);
    }

    /// Pops and returns the most recently pushed root.
    pub fn shadowstack_pop(&mut self) -> ObjectRef {
        self.shadow_stack.pop()
    }

    /// Diagnostic tri-color state of an object (see [`MarkColor`]).
    #[must_use]
    pub fn get_mark_color(&self, object: ObjectRef) -> MarkColor {
        let header = unsafe { &*object.as_ptr() };
        if header.is_prebuilt() {
            return MarkColor::Black;
        }
        let gray = header.is_gray();
        if arena::is_arena_base(object.as_ptr().cast()) {
            if !self.hbtable.has(object) {
                return MarkColor::Invalid;
            }
            return match (self.hbtable.is_marked(object), gray) {
                (false, false) => MarkColor::White,
                (false, true) => MarkColor::LightGray,
                (true, true) => MarkColor::DarkGray,
                (true, false) => MarkColor::Black,
            };
        }
        match (unsafe { blocktype_of(object) }, gray) {
            (BlockType::White, false) => MarkColor::White,
            (BlockType::White, true) => MarkColor::LightGray,
            (BlockType::Black, true) => MarkColor::DarkGray,
            (BlockType::Black, false) => MarkColor::Black,
            _ => MarkColor::Invalid,
        }
    }

    /// Advances marking. `incremental` processes one bounded slice of the
    /// gray frontier (half of each stack, with a floor of `INC_MARK_MIN`);
    /// otherwise the frontier is drained completely and the collector
    /// moves to [`Phase::Collect`].
    ///
    /// Usually driven by [`Collector::allocate`] via the thresholds, but
    /// embedders may call it directly to schedule mark work themselves.
    pub fn mark(&mut self, incremental: bool) {
        if self.phase == Phase::Collect {
            return; // nothing left to mark
        }
        events::mark_start(incremental, self.gray_stack_size);

        self.bytes_since_incmark = 0;

        if self.phase == Phase::Pause {
            self.phase = Phase::Mark;

            // First entry into this cycle: push the roots as of now. Roots
            // pushed later are covered by shadowstack_push itself.
            for index in 0..self.shadow_stack.len() {
                let root = self.shadow_stack.get(index);
                self.push_object(root);
            }

            // Registered prebuilts are traced once per cycle, no
            // reachability test. Newly dirtied ones are fed to the
            // general-purpose stack by the barrier.
            for index in 0..self.prebuilt_objects.len() {
                let object = self.prebuilt_objects[index];
                unsafe { (*object.as_ptr()).set_gray() };
                self.push_gp(object);
            }
        }

        if incremental {
            self.increments_this_cycle += 1;
        }

        while self.gray_stack_size > 0 {
            // General-purpose gray stack: prebuilts and huge blocks.
            let depth = self.gp_gray_stack.len();
            let quota = slice_quota(depth, incremental);
            for _ in 0..quota {
                let Some(top) = self.gp_gray_stack.pop() else {
                    break;
                };
                self.gray_stack_size -= 1;
                self.pop_object(top);
            }

            // Arena gray stacks, in arena insertion order.
            for index in 0..self.heap.arena_count() {
                let arena = self.heap.arena(index);
                let depth = unsafe { (*arena.as_ptr()).gray_stack.len() };
                let quota = slice_quota(depth, incremental);
                for _ in 0..quota {
                    let top = unsafe { (*arena.as_ptr()).gray_stack.pop() };
                    let Some(top) = top else { break };
                    self.gray_stack_size -= 1;
                    self.pop_object(top);
                }
            }

            if incremental {
                break; // one slice per increment
            }
        }

        if self.gray_stack_size == 0 {
            self.phase = Phase::Collect;
        }

        events::mark_done(incremental, self.gray_stack_size);
        debug_assert!(incremental || self.phase == Phase::Collect);
        debug_assert!(self.phase != Phase::Pause);
        self.debug_check_gray_counter();
    }

    /// Trace-and-blacken: clears the gray flag and feeds the object's
    /// outgoing references back through [`Collector::push_object`].
    fn pop_object(&mut self, object: ObjectRef) {
        debug_assert!(unsafe { (*object.as_ptr()).is_gray() });
        unsafe { (*object.as_ptr()).clear_gray() };

        let tracer = Rc::clone(&self.tracer);
        tracer.trace(object, &mut |reference| self.push_object(reference));

        #[cfg(debug_assertions)]
        unsafe {
            if !(*object.as_ptr()).is_prebuilt() && !arena::is_arena_base(object.as_ptr().cast()) {
                debug_assert_eq!(blocktype_of(object), BlockType::Black);
            }
        }
    }

    /// Enqueue-if-white: grays a white object (blackening its block-type
    /// up front) and queues it for tracing. Marked and prebuilt objects
    /// are left alone.
    fn push_object(&mut self, object: ObjectRef) {
        debug_assert_eq!(self.phase, Phase::Mark);

        if arena::is_arena_base(object.as_ptr().cast()) {
            // Huge object: the mark bit decides whether this is the first
            // visit of the cycle.
            if self.hbtable.mark(object) {
                unsafe { (*object.as_ptr()).set_gray() };
                self.push_gp(object);
            }
            return;
        }
        if unsafe { (*object.as_ptr()).is_prebuilt() } {
            // Always black; enqueued only at cycle start or by the barrier.
            return;
        }
        if unsafe { blocktype_of(object) } == BlockType::White {
            unsafe {
                (*object.as_ptr()).set_gray();
                set_blocktype_of(object, BlockType::Black);
            }
            self.push_arena_gray(object);
        }
    }

    /// Sweeps after a completed mark: releases dead huge blocks, reclaims
    /// white cells into the fit allocator, recycles empty arenas, decides
    /// the fragmentation policy, and resolves weakrefs.
    fn sweep(&mut self) {
        debug_assert_eq!(self.phase, Phase::Collect);
        events::sweep_start(self.heap.arena_count());
        let start = Instant::now();
        let arenas_before = self.heap.arena_count();

        let huge_blocks_freed = self.hbtable.sweep();

        self.free_cells = 0;
        self.largest_free_block = 0;
        self.heap.fit.clear();

        let bump_arena = self.heap.bump_arena();
        let bump_index = self.heap.bump_cell_index();

        let mut index = 0;
        while index < self.heap.arenas.len() {
            let header = self.heap.arenas[index].header;
            // Only the bump arena's tail is exempt from reclamation.
            let limit = if Some(header) == bump_arena {
                bump_index
            } else {
                None
            };
            let outcome = unsafe { (*header.as_ptr()).sweep(limit) };
            if outcome.empty {
                let handle = self.heap.arenas.remove(index);
                self.heap.free_arenas.push(handle);
                // No index bump: the next arena slid into this slot.
            } else {
                for &(cell, cells) in &outcome.runs {
                    let ptr = unsafe { (*header.as_ptr()).cell_ptr(cell) };
                    // Run cells are inside a live mapping.
                    self.heap.fit.add(unsafe { NonNull::new_unchecked(ptr) }, cells);
                }
                self.free_cells += outcome.free_cells;
                self.largest_free_block = self.largest_free_block.max(outcome.largest_free_block);
                index += 1;
            }
        }

        self.phase = Phase::Pause;

        // Fragmentation = 1 - largest block / total free space. Prefer the
        // bump path while the largest block holds more than half of the
        // free cells.
        self.heap.use_bump_allocator = self.free_cells < 2 * self.largest_free_block;

        self.update_weakrefs();

        events::sweep_done(self.free_cells, self.largest_free_block);

        self.total_collections += 1;
        self.last_metrics = GcMetrics {
            kind: CollectionKind::Full,
            mark_duration: Duration::ZERO,
            sweep_duration: start.elapsed(),
            increments: std::mem::take(&mut self.increments_this_cycle),
            free_cells: self.free_cells,
            largest_free_block: self.largest_free_block,
            arenas_swept: arenas_before,
            arenas_recycled: arenas_before - self.heap.arena_count(),
            huge_blocks_freed,
            total_collections: self.total_collections,
        };
    }

    /// Walks the weakref bag after sweep: records whose holder died are
    /// dropped; slots whose target died are nulled and dropped.
    fn update_weakrefs(&mut self) {
        let mut index = 0;
        while index < self.weakrefs.len() {
            let WeakrefEntry { holder, slot } = self.weakrefs[index];

            // The holder is always a normal arena object.
            match unsafe { blocktype_of(holder) } {
                BlockType::Free | BlockType::Extent => {
                    // The weakref holder itself was collected.
                    self.weakrefs.swap_remove(index);
                    continue;
                }
                BlockType::Black | BlockType::White => {}
            }

            let raw = unsafe { slot.as_ptr().read() };
            let Some(target) = NonNull::new(raw) else {
                self.weakrefs.swap_remove(index);
                continue;
            };
            let target_live = if arena::is_arena_base(target.as_ptr().cast()) {
                self.hbtable.has(target)
            } else {
                matches!(
                    unsafe { blocktype_of(target) },
                    BlockType::Black | BlockType::White
                )
            };
            if target_live {
                index += 1;
            } else {
                unsafe { slot.as_ptr().write(std::ptr::null_mut()) };
                self.weakrefs.swap_remove(index);
            }
        }
    }

    fn push_gp(&mut self, object: ObjectRef) {
        self.gp_gray_stack.push(object);
        self.gray_stack_size += 1;
    }

    fn push_arena_gray(&mut self, object: ObjectRef) {
        let arena = Arena::from_cell(object.as_ptr().cast());
        unsafe { (*arena.as_ptr()).gray_stack.push(object) };
        self.gray_stack_size += 1;
    }

    fn debug_check_gray_counter(&self) {
        #[cfg(debug_assertions)]
        {
            let mut total = self.gp_gray_stack.len();
            for index in 0..self.heap.arena_count() {
                total += unsafe { (*self.heap.arena(index).as_ptr()).gray_stack.len() };
            }
            debug_assert_eq!(self.gray_stack_size, total);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Total entries across the general-purpose and all arena gray stacks.
    #[must_use]
    pub fn gray_stack_size(&self) -> usize {
        self.gray_stack_size
    }

    /// Free cells registered with the fit allocator by the last sweep.
    #[must_use]
    pub fn free_cells(&self) -> usize {
        self.free_cells
    }

    /// Largest contiguous free block found by the last sweep, in cells.
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.largest_free_block
    }

    /// Whether allocation currently tries the bump path first.
    #[must_use]
    pub fn use_bump_allocator(&self) -> bool {
        self.heap.use_bump_allocator
    }

    /// Number of active arenas (including the bump arena).
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.heap.arena_count()
    }

    /// Number of swept-empty arenas waiting for reuse.
    #[must_use]
    pub fn free_arena_count(&self) -> usize {
        self.heap.free_arenas.len()
    }

    /// Number of live huge blocks.
    #[must_use]
    pub fn huge_block_count(&self) -> usize {
        self.hbtable.len()
    }

    /// Number of registered prebuilt objects.
    #[must_use]
    pub fn prebuilt_count(&self) -> usize {
        self.prebuilt_objects.len()
    }

    /// Number of tracked weak references.
    #[must_use]
    pub fn weakref_count(&self) -> usize {
        self.weakrefs.len()
    }

    /// Current shadow stack depth.
    #[must_use]
    pub fn shadowstack_len(&self) -> usize {
        self.shadow_stack.len()
    }

    /// Statistics from the most recent collection.
    #[must_use]
    pub fn last_metrics(&self) -> GcMetrics {
        self.last_metrics
    }
}

/// Entries to pop from a stack of `depth` entries in one go.
fn slice_quota(depth: usize, incremental: bool) -> usize {
    if incremental {
        depth.min((depth / 2).max(INC_MARK_MIN))
    } else {
        depth
    }
}

unsafe fn blocktype_of(object: ObjectRef) -> BlockType {
    let cell = object.as_ptr().cast::<u8>();
    let arena = Arena::from_cell(cell);
    unsafe { (*arena.as_ptr()).get_blocktype(Arena::cell_index(cell)) }
}

unsafe fn set_blocktype_of(object: ObjectRef, blocktype: BlockType) {
    let cell = object.as_ptr().cast::<u8>();
    let arena = Arena::from_cell(cell);
    unsafe { (*arena.as_ptr()).set_blocktype(Arena::cell_index(cell), blocktype) };
}
