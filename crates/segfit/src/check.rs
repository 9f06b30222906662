//! Development-build diagnostics.
//!
//! Compiled in only with the `heap-check` feature. The engine calls
//! [`verify`] after every operation; it re-walks the whole region and checks
//! every boundary-tag and free-list invariant, and the allocation [`Ledger`]
//! tracks live payload spans to catch invalid releases and overlapping
//! handles. Any violation is fatal: the failure path prints a dump of the
//! heap followed by a captured backtrace, then panics. None of this is part
//! of production control flow.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, BTreeSet};

use crate::free_list::SegregatedFreeLists;
use crate::heap::Heap;
use crate::layout::{footer_of, payload_of, Tag, ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE};
use crate::size_class::class_of;

/// One live allocation, keyed by payload offset in [`Ledger::live`].
#[derive(Debug, Clone, Copy)]
struct Span {
    block: u32,
    block_size: u32,
}

impl Span {
    const fn end(self) -> u32 {
        self.block + self.block_size
    }
}

/// Records every live allocation the engine has handed out.
#[derive(Debug)]
pub(crate) struct Ledger {
    live: BTreeMap<u32, Span>,
}

impl Ledger {
    pub(crate) const fn new() -> Self {
        Self {
            live: BTreeMap::new(),
        }
    }

    /// Whether `payload` is a live allocation's payload offset.
    pub(crate) fn is_live(&self, payload: u32) -> bool {
        self.live.contains_key(&payload)
    }

    /// Records a fresh allocation and checks it against its ledger
    /// neighbors for overlap.
    pub(crate) fn record_allocate(&mut self, block: u32, block_size: u32, requested: usize) {
        let payload = payload_of(block);
        let span = Span { block, block_size };

        if u64::from(block_size) < requested as u64 + u64::from(WORD_SIZE) {
            fail_ledger(&format!(
                "block at {block} ({block_size} bytes) too small for a {requested}-byte request"
            ));
        }
        if let Some((_, prev)) = self.live.range(..payload).next_back() {
            if prev.end() > block {
                fail_ledger(&format!(
                    "block at {block} overlaps predecessor at {}",
                    prev.block
                ));
            }
        }
        if let Some((_, next)) = self.live.range(payload..).next() {
            if span.end() > next.block {
                fail_ledger(&format!(
                    "block at {block} overlaps successor at {}",
                    next.block
                ));
            }
        }
        if self.live.insert(payload, span).is_some() {
            fail_ledger(&format!("duplicate allocation at payload offset {payload}"));
        }
    }

    /// Drops a released allocation. Call [`Ledger::is_live`] first; releasing
    /// an unknown payload is reported by [`invalid_release`].
    pub(crate) fn record_release(&mut self, payload: u32) {
        let removed = self.live.remove(&payload);
        debug_assert!(removed.is_some());
    }

    /// Updates a live allocation after an in-place resize.
    pub(crate) fn record_resize(&mut self, payload: u32, block_size: u32) {
        match self.live.get_mut(&payload) {
            Some(span) => span.block_size = block_size,
            None => fail_ledger(&format!("resize of unknown payload offset {payload}")),
        }
    }
}

/// Fatal report for a release of a handle the ledger does not know.
pub(crate) fn invalid_release(heap: &Heap, payload: u32) -> ! {
    fail(heap, &format!("release of unknown payload offset {payload}"));
}

/// Walks the region and the class lists, checking every invariant the engine
/// promises between operations. Panics with a dump on the first violation.
pub(crate) fn verify(heap: &Heap) {
    #[allow(clippy::cast_possible_truncation)]
    let len = heap.region_len() as u32;
    let mut offset = Heap::first_block_offset();
    let mut prev_alloc = true;
    let mut free_blocks = BTreeSet::new();

    loop {
        let tag = heap.tag(offset);

        if tag.size() == 0 {
            if !tag.is_alloc() || offset != len - WORD_SIZE {
                fail(heap, &format!("bad epilogue at offset {offset}"));
            }
            if tag.prev_alloc() != prev_alloc {
                fail(heap, &format!("epilogue prev_alloc disagrees at {offset}"));
            }
            break;
        }

        let size = tag.size();
        if size % ALIGNMENT != 0 || size < MIN_BLOCK_SIZE {
            fail(heap, &format!("illegal block size {size} at offset {offset}"));
        }
        if u64::from(offset) + u64::from(size) > u64::from(len) {
            fail(heap, &format!("block at {offset} overruns the region"));
        }
        if tag.prev_alloc() != prev_alloc {
            fail(heap, &format!("prev_alloc mismatch at offset {offset}"));
        }

        if !tag.is_alloc() {
            if !prev_alloc {
                fail(heap, &format!("adjacent free blocks at offset {offset}"));
            }
            let footer = Tag::from_word(heap.region.word(footer_of(offset, size)));
            if footer.word() != tag.word() {
                fail(heap, &format!("footer disagrees with header at offset {offset}"));
            }
            free_blocks.insert(offset);
        }

        prev_alloc = tag.is_alloc();
        offset += size;
    }

    // Every free block must be reachable from exactly the class matching its
    // size, through intact links, and from nowhere else.
    let mut listed = BTreeSet::new();
    for (class, &head) in heap.free.heads.iter().enumerate() {
        let mut prev = None;
        let mut cursor = head;
        while let Some(block) = cursor {
            if !listed.insert(block) {
                fail(heap, &format!("block at {block} linked more than once"));
            }
            let tag = heap.tag(block);
            if tag.is_alloc() {
                fail(heap, &format!("allocated block at {block} on a free list"));
            }
            if class_of(tag.size()) != class {
                fail(
                    heap,
                    &format!("block at {block} (size {}) in class {class}", tag.size()),
                );
            }
            if SegregatedFreeLists::prev(&heap.region, block) != prev {
                fail(heap, &format!("broken prev link at block {block}"));
            }
            prev = cursor;
            cursor = SegregatedFreeLists::next(&heap.region, block);
        }
    }
    if listed != free_blocks {
        fail(heap, "free lists disagree with the heap walk");
    }

    // Ledger entries must describe allocated blocks inside the region.
    for (&payload, span) in &heap.ledger.live {
        let tag = heap.tag(span.block);
        if !tag.is_alloc() || tag.size() != span.block_size || payload_of(span.block) != payload {
            fail(heap, &format!("ledger disagrees with block at {}", span.block));
        }
    }
}

fn fail(heap: &Heap, msg: &str) -> ! {
    eprintln!("heap-check failure: {msg}");
    dump(heap);
    eprintln!("{}", Backtrace::force_capture());
    panic!("heap-check failure: {msg}");
}

fn fail_ledger(msg: &str) -> ! {
    eprintln!("heap-check ledger failure: {msg}");
    eprintln!("{}", Backtrace::force_capture());
    panic!("heap-check ledger failure: {msg}");
}

/// Prints one line per block, defensively: a corrupted size stops the walk
/// instead of running off the region.
fn dump(heap: &Heap) {
    #[allow(clippy::cast_possible_truncation)]
    let len = heap.region_len() as u32;
    eprintln!("heap dump: region length {len}");

    let mut offset = Heap::first_block_offset();
    while offset + WORD_SIZE <= len {
        let tag = heap.tag(offset);
        let size = tag.size();
        eprintln!(
            "  block at {offset:>10}: size {size:>10} alloc {} prev_alloc {}",
            u8::from(tag.is_alloc()),
            u8::from(tag.prev_alloc()),
        );
        if size == 0 {
            break;
        }
        if size % ALIGNMENT != 0 || u64::from(offset) + u64::from(size) > u64::from(len) {
            eprintln!("  ...walk stopped: corrupted size");
            break;
        }
        offset += size;
    }
}
