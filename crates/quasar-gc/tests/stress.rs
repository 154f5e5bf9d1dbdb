//! Randomized object graphs checked against a reachability oracle.
//!
//! A deterministic PRNG builds a random graph over a few hundred nodes,
//! roots a subset, and the test asserts that exactly the oracle-reachable
//! nodes survive a collection.

mod common;

use std::collections::{HashMap, HashSet};

use common::{alloc_node, collector, node_size, set_ref};
use quasar_gc::{Collector, MarkColor, ObjectRef, Phase, CELL_SIZE};

const NODES: usize = 240;
const SLOTS: usize = 3;

/// Minimal xorshift PRNG so runs are reproducible.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

struct GraphFixture {
    nodes: Vec<ObjectRef>,
    edges: HashMap<usize, Vec<usize>>,
    roots: Vec<usize>,
}

fn build_graph(gc: &mut Collector, rng: &mut Rng) -> GraphFixture {
    let nodes: Vec<ObjectRef> = (0..NODES).map(|_| alloc_node(gc, SLOTS, SLOTS)).collect();

    let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
    for (index, &node) in nodes.iter().enumerate() {
        let mut outgoing = Vec::new();
        for slot in 0..SLOTS {
            // Two thirds of the slots carry an edge.
            if rng.below(3) < 2 {
                let target = rng.below(NODES);
                set_ref(gc, node, slot, Some(nodes[target]));
                outgoing.push(target);
            }
        }
        edges.insert(index, outgoing);
    }

    let mut roots = Vec::new();
    for index in 0..NODES {
        if rng.below(8) == 0 {
            gc.shadowstack_push(nodes[index]);
            roots.push(index);
        }
    }

    GraphFixture {
        nodes,
        edges,
        roots,
    }
}

fn reachable_closure(fixture: &GraphFixture) -> HashSet<usize> {
    let mut reachable = HashSet::new();
    let mut pending: Vec<usize> = fixture.roots.clone();
    while let Some(index) = pending.pop() {
        if reachable.insert(index) {
            pending.extend(fixture.edges[&index].iter().copied());
        }
    }
    reachable
}

fn check_against_oracle(gc: &Collector, fixture: &GraphFixture, reachable: &HashSet<usize>) {
    for (index, &node) in fixture.nodes.iter().enumerate() {
        let color = gc.get_mark_color(node);
        if reachable.contains(&index) {
            assert_eq!(color, MarkColor::White, "reachable node {index} must survive");
        } else {
            assert_eq!(color, MarkColor::Invalid, "unreachable node {index} must die");
        }
    }

    let node_cells = node_size(SLOTS).div_ceil(CELL_SIZE);
    let dead = NODES - reachable.len();
    assert_eq!(gc.free_cells(), dead * node_cells);
    assert!(gc.largest_free_block() <= gc.free_cells());
    assert_eq!(gc.gray_stack_size(), 0);
    assert_eq!(gc.phase(), Phase::Pause);
}

#[test]
fn test_random_graphs_match_oracle() {
    for seed in [0x9E37_79B9, 0xDEAD_BEEF, 0x1234_5678_9ABC] {
        let mut rng = Rng(seed);
        let mut gc = collector();

        let fixture = build_graph(&mut gc, &mut rng);
        let reachable = reachable_closure(&fixture);
        assert!(!reachable.is_empty());

        gc.collect();
        check_against_oracle(&gc, &fixture, &reachable);
    }
}

#[test]
fn test_random_graph_incremental_matches_oracle() {
    let mut rng = Rng(0xC0FF_EE11);
    let mut gc = collector();

    let fixture = build_graph(&mut gc, &mut rng);
    let reachable = reachable_closure(&fixture);

    // Drive the whole mark with bounded increments before sweeping.
    let mut increments = 0;
    while gc.phase() != Phase::Collect {
        gc.mark(true);
        increments += 1;
        assert!(increments < 100, "incremental marking failed to terminate");
    }
    gc.collect();

    check_against_oracle(&gc, &fixture, &reachable);
}

#[test]
fn test_dropping_all_roots_reclaims_everything() {
    let mut rng = Rng(0x5EED_5EED);
    let mut gc = collector();

    let fixture = build_graph(&mut gc, &mut rng);
    gc.collect();

    for _ in 0..fixture.roots.len() {
        gc.shadowstack_pop();
    }
    gc.collect();

    let node_cells = node_size(SLOTS).div_ceil(CELL_SIZE);
    assert_eq!(gc.free_cells(), NODES * node_cells);
    for &node in &fixture.nodes {
        assert_eq!(gc.get_mark_color(node), MarkColor::Invalid);
    }
}
