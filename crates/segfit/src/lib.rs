//! A segregated-fit heap allocator over a grow-only region.
//!
//! `segfit` provides allocate/release/reallocate semantics on top of a
//! single, monotonically growing memory region obtained from the
//! [`sys_brk`] break primitive. The engine combines:
//!
//! - **Boundary tags**: one packed 32-bit word per block header, with a
//!   mirrored footer on free blocks only.
//! - **Segregated free lists**: 28 power-of-two size classes spanning
//!   `[2^4, 2^32)`, each an intrusive doubly-linked list.
//! - **First-fit placement** through the class table, splitting blocks when
//!   the remainder can stand on its own.
//! - **Immediate coalescing** whenever a block becomes free, including the
//!   block created by growing the heap.
//!
//! # Quick Start
//!
//! ```ignore
//! use segfit::Heap;
//!
//! let mut heap = Heap::new()?;
//! let handle = heap.allocate(100).expect("out of memory");
//! assert!(heap.usable_size(handle) >= 100);
//! heap.release(handle);
//! ```
//!
//! # Failure model
//!
//! Running out of region (the provider's simulated memory pressure) is the
//! only recoverable failure and surfaces as `None` from [`Heap::allocate`]
//! and [`Heap::reallocate`]. Misuse such as releasing a foreign handle or
//! corrupting tags is a programming error: the `heap-check` feature detects
//! it after every operation and aborts with a heap dump and backtrace.
//!
//! # Features
//!
//! - `heap-check`: per-operation consistency checking, allocation ledger and
//!   crash diagnostics. Development builds only.
//! - `lifo-ordering`: push freed blocks to their class list head instead of
//!   keeping lists address-ordered.
//! - `tracing`: emit [`tracing`](https://docs.rs/tracing) events for heap
//!   initialization and growth.
//!
//! # Thread Safety
//!
//! A [`Heap`] is a plain value with `&mut self` operations: one logical
//! owner at a time, no internal locking. Wrap it in a `Mutex` to share it,
//! or give each thread its own heap; instances share nothing.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod free_list;
mod heap;
mod layout;
mod region;
mod size_class;

#[cfg(feature = "heap-check")]
mod check;

pub use heap::{BlockHandle, Heap, HeapConfig, DEFAULT_HEAP_LIMIT};
