//! Shared test mutator: a node object model and its tracer.
//!
//! A `Node` is an object header followed by two counters and `total`
//! pointer slots. The first `strong` slots are traced; the remaining
//! slots are invisible to the tracer and serve as weak fields.

#![allow(dead_code)]

use std::mem;
use std::ptr::NonNull;
use std::rc::Rc;

use quasar_gc::{Collector, CollectorConfig, ObjectHeader, ObjectRef, Tracer};

#[repr(C)]
pub struct Node {
    header: ObjectHeader,
    strong: usize,
    total: usize,
    // `total` slots of `*mut ObjectHeader` follow.
}

/// Allocation size for a node with `total` reference slots.
pub const fn node_size(total: usize) -> usize {
    mem::size_of::<Node>() + total * mem::size_of::<*mut ObjectHeader>()
}

/// Statically allocated node used as a prebuilt object in tests.
#[repr(C)]
pub struct PrebuiltNode {
    header: ObjectHeader,
    strong: usize,
    total: usize,
    refs: [*mut ObjectHeader; 2],
}

impl PrebuiltNode {
    pub const fn new(strong: usize) -> Self {
        Self {
            header: ObjectHeader::prebuilt(),
            strong,
            total: 2,
            refs: [std::ptr::null_mut(); 2],
        }
    }
}

/// Leaks a prebuilt node and returns it as an object reference.
pub fn leak_prebuilt(strong: usize) -> ObjectRef {
    let node: &'static mut PrebuiltNode = Box::leak(Box::new(PrebuiltNode::new(strong)));
    NonNull::from(&mut node.header)
}

pub struct NodeTracer;

impl Tracer for NodeTracer {
    fn trace(&self, object: ObjectRef, visit: &mut dyn FnMut(ObjectRef)) {
        unsafe {
            let node = object.as_ptr().cast::<Node>();
            let strong = (*node).strong;
            let slots = node.add(1).cast::<*mut ObjectHeader>();
            for index in 0..strong {
                if let Some(reference) = NonNull::new(slots.add(index).read()) {
                    visit(reference);
                }
            }
        }
    }
}

/// A collector over the node object model with default thresholds.
pub fn collector() -> Collector {
    Collector::with_config(Rc::new(NodeTracer), CollectorConfig::default())
}

/// A collector with explicit thresholds.
pub fn collector_with(config: CollectorConfig) -> Collector {
    Collector::with_config(Rc::new(NodeTracer), config)
}

/// Allocates a node with `strong` traced slots out of `total`.
pub fn alloc_node(gc: &mut Collector, strong: usize, total: usize) -> ObjectRef {
    assert!(strong <= total);
    let object = gc.allocate(node_size(total)).expect("allocation failed");
    unsafe {
        let node = object.as_ptr().cast::<Node>();
        (*node).strong = strong;
        (*node).total = total;
    }
    object
}

/// Allocates a leaf node (no reference slots).
pub fn alloc_leaf(gc: &mut Collector) -> ObjectRef {
    alloc_node(gc, 0, 0)
}

/// Address of reference slot `index` of a node.
pub fn slot_ptr(object: ObjectRef, index: usize) -> NonNull<*mut ObjectHeader> {
    unsafe {
        let node = object.as_ptr().cast::<Node>();
        debug_assert!(index < (*node).total);
        let slots = node.add(1).cast::<*mut ObjectHeader>();
        NonNull::new_unchecked(slots.add(index))
    }
}

/// Stores `target` into slot `index`, with the write barrier.
pub fn set_ref(gc: &mut Collector, object: ObjectRef, index: usize, target: Option<ObjectRef>) {
    gc.write(object);
    unsafe {
        slot_ptr(object, index)
            .as_ptr()
            .write(target.map_or(std::ptr::null_mut(), NonNull::as_ptr));
    }
}

/// Reads slot `index`.
pub fn get_ref(object: ObjectRef, index: usize) -> Option<ObjectRef> {
    NonNull::new(unsafe { slot_ptr(object, index).as_ptr().read() })
}
