//! A quasi-concurrent incremental garbage collector for embedding runtimes.
//!
//! `quasar-gc` owns a heap on behalf of a hosting language runtime (the
//! *mutator*): it services allocation requests, tracks roots, and reclaims
//! unreachable objects with an incremental **tri-color mark-sweep**
//! discipline guarded by a **Dijkstra-style write barrier**.
//!
//! # Heap layout
//!
//! Normally-sized objects live in **arenas**: megabyte-aligned regions of
//! 16-byte cells whose base address is recoverable from any contained cell
//! with a bitmask. Each cell carries a block-type tag (`FREE`, `WHITE`,
//! `BLACK`, `EXTENT`) in two per-arena bitmaps. Objects above the large
//! allocation threshold are **huge blocks**: standalone arena-aligned
//! mappings tracked in a side table.
//!
//! # Mutator contract
//!
//! - Objects begin with an [`ObjectHeader`]; the collector never looks past
//!   it. Outgoing references are enumerated by the mutator-supplied
//!   [`Tracer`].
//! - Call [`Collector::write`] on a container *before* overwriting any of
//!   its reference fields.
//! - Keep every reference-holding local alive on the shadow stack
//!   ([`Collector::shadowstack_push`] / [`Collector::shadowstack_pop`]).
//!
//! # Quick start
//!
//! ```ignore
//! use quasar_gc::{Collector, CollectorConfig, Tracer, ObjectRef};
//! use std::rc::Rc;
//!
//! let mut gc = Collector::new(Rc::new(MyTracer));
//! let obj = gc.allocate(size).expect("out of memory");
//! gc.shadowstack_push(obj);
//! gc.collect();
//! ```
//!
//! # Thread model
//!
//! The collector is single-threaded and cooperative: every entry point runs
//! to completion on the mutator's thread, and incremental marking bounds
//! pause times by processing a shrinking slice of the gray frontier per
//! increment. `Collector` is `!Send` and `!Sync`.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod config;
mod events;
mod gc;
mod heap;
mod hugeblock;
mod metrics;
mod object;
mod shadowstack;
mod trace;

#[cfg(unix)]
mod signal;

pub use config::CollectorConfig;
pub use gc::{Collector, Phase};
pub use metrics::{CollectionKind, GcMetrics};
pub use object::{MarkColor, ObjectHeader, ObjectRef};
pub use trace::Tracer;

pub use arena::{ARENA_SIZE, CELL_SIZE, LARGE_ALLOC_EXP};
