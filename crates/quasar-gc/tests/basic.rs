//! Basic allocation, rooting, and collection behavior.

mod common;

use common::{alloc_leaf, alloc_node, collector, get_ref, node_size, set_ref};
use quasar_gc::{MarkColor, Phase, CELL_SIZE};

#[test]
fn test_allocation_returns_white_object() {
    let mut gc = collector();
    let object = alloc_leaf(&mut gc);

    assert_eq!(gc.get_mark_color(object), MarkColor::White);
    assert_eq!(gc.phase(), Phase::Pause);
    assert_eq!(gc.arena_count(), 1);
}

#[test]
fn test_linear_chain_survives() {
    let mut gc = collector();

    let a = alloc_node(&mut gc, 1, 1);
    let b = alloc_node(&mut gc, 1, 1);
    let c = alloc_leaf(&mut gc);
    set_ref(&mut gc, a, 0, Some(b));
    set_ref(&mut gc, b, 0, Some(c));
    gc.shadowstack_push(a);

    gc.collect();

    assert_eq!(gc.get_mark_color(a), MarkColor::White);
    assert_eq!(gc.get_mark_color(b), MarkColor::White);
    assert_eq!(gc.get_mark_color(c), MarkColor::White);
    assert_eq!(gc.gray_stack_size(), 0);
    assert_eq!(gc.phase(), Phase::Pause);
    assert_eq!(gc.free_cells(), 0, "nothing was reclaimed");
}

#[test]
fn test_dropped_chain_is_reclaimed() {
    let mut gc = collector();

    let a = alloc_node(&mut gc, 1, 1);
    let b = alloc_node(&mut gc, 1, 1);
    let c = alloc_leaf(&mut gc);
    set_ref(&mut gc, a, 0, Some(b));
    set_ref(&mut gc, b, 0, Some(c));
    gc.shadowstack_push(a);
    gc.collect();

    assert_eq!(gc.shadowstack_pop(), a);
    gc.collect();

    let chain_cells =
        (2 * node_size(1)).div_ceil(CELL_SIZE) + node_size(0).div_ceil(CELL_SIZE);
    assert_eq!(gc.free_cells(), chain_cells);
    assert_eq!(
        gc.largest_free_block(),
        chain_cells,
        "adjacent dead objects coalesce into one block"
    );
    // The heads are free cells now, not objects.
    assert_eq!(gc.get_mark_color(a), MarkColor::Invalid);
    assert_eq!(gc.get_mark_color(b), MarkColor::Invalid);
    assert_eq!(gc.get_mark_color(c), MarkColor::Invalid);
}

#[test]
fn test_unreferenced_object_is_collected() {
    let mut gc = collector();

    let kept = alloc_leaf(&mut gc);
    let dropped = alloc_leaf(&mut gc);
    gc.shadowstack_push(kept);

    gc.collect();

    assert_eq!(gc.get_mark_color(kept), MarkColor::White);
    assert_eq!(gc.get_mark_color(dropped), MarkColor::Invalid);
    assert_eq!(gc.free_cells(), node_size(0).div_ceil(CELL_SIZE));
}

#[test]
fn test_shadowstack_round_trip() {
    let mut gc = collector();

    let a = alloc_leaf(&mut gc);
    let b = alloc_leaf(&mut gc);
    gc.shadowstack_push(a);
    gc.shadowstack_push(b);

    assert_eq!(gc.shadowstack_len(), 2);
    assert_eq!(gc.shadowstack_pop(), b);
    assert_eq!(gc.shadowstack_pop(), a);
    assert_eq!(gc.shadowstack_len(), 0);
}

#[test]
fn test_collect_on_empty_heap() {
    let mut gc = collector();
    gc.collect();
    gc.collect();

    assert_eq!(gc.phase(), Phase::Pause);
    assert_eq!(gc.free_cells(), 0);
    assert_eq!(gc.last_metrics().total_collections, 2);
}

#[test]
fn test_empty_arena_is_recycled() {
    let mut gc = collector();

    // Fill the first arena with garbage and spill into a second one, so
    // the first is no longer the bump arena at sweep time.
    for _ in 0..130 {
        gc.allocate(512 * CELL_SIZE).expect("allocation failed");
    }
    assert!(gc.arena_count() >= 2);
    let survivor = alloc_leaf(&mut gc);
    gc.shadowstack_push(survivor);

    let arenas_before = gc.arena_count();
    gc.collect();

    assert!(gc.free_arena_count() > 0, "emptied arenas enter the pool");
    assert!(gc.arena_count() < arenas_before);
    assert_eq!(gc.last_metrics().arenas_recycled, gc.free_arena_count());
    assert_eq!(gc.get_mark_color(survivor), MarkColor::White);
}

#[test]
fn test_mutation_without_collection_keeps_references() {
    let mut gc = collector();

    let a = alloc_node(&mut gc, 2, 2);
    let b = alloc_leaf(&mut gc);
    let c = alloc_leaf(&mut gc);
    set_ref(&mut gc, a, 0, Some(b));
    set_ref(&mut gc, a, 1, Some(c));
    gc.shadowstack_push(a);

    gc.collect();

    assert_eq!(get_ref(a, 0), Some(b));
    assert_eq!(get_ref(a, 1), Some(c));
}
