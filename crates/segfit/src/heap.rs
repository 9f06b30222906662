//! The allocator engine.
//!
//! A [`Heap`] owns one growing region and the 28 class-list heads, and wires
//! the placement, splitting, coalescing and extension policies together:
//!
//! - first-fit placement through the segregated class table, splitting the
//!   chosen block when the remainder is big enough to stand alone;
//! - immediate coalescing with boundary tags whenever a block becomes free;
//! - heap growth that merges newly appended memory with the free run abutting
//!   the old heap end, asking the provider only for what that run cannot
//!   already cover.
//!
//! Each heap is a self-contained value; independent instances share nothing.
//! Access is single-threaded by construction (`&mut self` everywhere).

use std::io;
use std::ptr::{self, NonNull};

use crate::free_list::SegregatedFreeLists;
use crate::layout::{
    block_of_payload, footer_of, payload_of, Tag, ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
    WORD_SIZE,
};
use crate::region::HeapRegion;

/// Growth requests to the provider are rounded up to this granularity.
pub(crate) const CHUNK_SIZE: u32 = 4096;

/// Default simulated-pressure ceiling for [`Heap::new`]: 256 MiB.
pub const DEFAULT_HEAP_LIMIT: usize = 1 << 28;

/// Offset of the first block header. The 16 initialization bytes hold the
/// prologue sentinel word, two dead filler words and the epilogue sentinel,
/// which places every later header at an offset of 12 mod 16 and therefore
/// every payload on a 16-byte boundary.
const FIRST_BLOCK_OFFSET: u32 = ALIGNMENT - WORD_SIZE;

/// Construction parameters for a [`Heap`].
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Maximum number of bytes the region may grow to. Reaching it makes
    /// further allocations fail recoverably.
    pub limit: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HEAP_LIMIT,
        }
    }
}

/// An opaque handle to a live allocation.
///
/// Resolve it to usable memory with [`Heap::payload_ptr`] and
/// [`Heap::usable_size`]. A handle is only meaningful to the heap that
/// returned it, and only until it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub(crate) payload: u32,
}

/// A segregated-fit heap over a grow-only region.
#[derive(Debug)]
pub struct Heap {
    pub(crate) region: HeapRegion,
    pub(crate) free: SegregatedFreeLists,
    #[cfg(feature = "heap-check")]
    pub(crate) ledger: crate::check::Ledger,
}

impl Heap {
    /// Creates a heap with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails only if the region cannot be reserved or the initial chunk
    /// extension fails.
    pub fn new() -> io::Result<Self> {
        Self::with_config(HeapConfig::default())
    }

    /// Creates a heap with the given configuration: reserves the region,
    /// writes the prologue and epilogue sentinels, and performs one initial
    /// chunk-sized extension.
    ///
    /// # Errors
    ///
    /// Fails only if the region cannot be reserved or the initial chunk
    /// extension fails.
    pub fn with_config(config: HeapConfig) -> io::Result<Self> {
        let mut region = HeapRegion::reserve(config.limit)?;

        region.extend(ALIGNMENT as usize)?;
        region.set_word(0, Tag::pack(0, true).word());
        region.set_word(WORD_SIZE, 0);
        region.set_word(2 * WORD_SIZE, 0);
        // The first real block will sit right before this epilogue, which is
        // why it starts with prev_alloc set: there is no block before it yet.
        region.set_word(
            FIRST_BLOCK_OFFSET,
            Tag::pack(0, true).with_prev_alloc(true).word(),
        );

        let mut heap = Self {
            region,
            free: SegregatedFreeLists::new(),
            #[cfg(feature = "heap-check")]
            ledger: crate::check::Ledger::new(),
        };

        heap.extend_heap(CHUNK_SIZE)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(limit = config.limit, "heap initialized");

        Ok(heap)
    }

    /// Allocates a block with at least `size` usable bytes.
    ///
    /// Returns `None` for `size == 0`, for sizes beyond the largest size
    /// class, and when the region cannot grow any further. The last case is
    /// the only recoverable failure in the engine; the heap stays fully
    /// usable afterwards.
    pub fn allocate(&mut self, size: usize) -> Option<BlockHandle> {
        if size == 0 {
            return None;
        }

        let asize = aligned_block_size(size)?;

        let block = match self.free.find_fit(&self.region, asize) {
            Some(block) => block,
            None => self.extend_heap(asize).ok()?,
        };

        self.free.remove(&mut self.region, block);
        let handle = self.place(block, asize);

        #[cfg(feature = "heap-check")]
        {
            self.ledger
                .record_allocate(block, self.tag(block).size(), size);
            self.consistency_check();
        }

        Some(handle)
    }

    /// Releases an allocation: the block is marked free, merged with any
    /// free neighbor, and reinserted into the class matching the merged size.
    ///
    /// Releasing a handle that is not currently allocated by this heap is a
    /// programming error: it is detected (and fatal) when the `heap-check`
    /// feature is active and undefined otherwise.
    pub fn release(&mut self, handle: BlockHandle) {
        #[cfg(feature = "heap-check")]
        {
            if !self.ledger.is_live(handle.payload) {
                crate::check::invalid_release(self, handle.payload);
            }
            self.ledger.record_release(handle.payload);
        }

        let block = block_of_payload(handle.payload);
        let tag = self.tag(block);
        debug_assert!(tag.is_alloc(), "releasing a block that is not allocated");

        self.write_free_block(block, tag.size(), tag.prev_alloc());
        let merged = self.coalesce(block);
        self.free.insert(&mut self.region, merged);

        let merged_size = self.tag(merged).size();
        self.set_prev_alloc(merged + merged_size, false);

        #[cfg(feature = "heap-check")]
        self.consistency_check();
    }

    /// Resizes an allocation to at least `new_size` usable bytes.
    ///
    /// Shrinking splits the tail back off in place. Growing first tries to
    /// absorb free blocks that follow the allocation; only when that is not
    /// enough does it fall back to allocate-copy-release, returning the new
    /// handle. `new_size == 0` releases the block and returns `None`.
    ///
    /// On failure (`None` for a non-zero `new_size`), the original handle is
    /// still valid and its contents are untouched.
    pub fn reallocate(&mut self, handle: BlockHandle, new_size: usize) -> Option<BlockHandle> {
        if new_size == 0 {
            self.release(handle);
            return None;
        }

        let block = block_of_payload(handle.payload);
        let tag = self.tag(block);
        debug_assert!(tag.is_alloc(), "reallocating a block that is not allocated");

        let asize = aligned_block_size(new_size)?;
        let current = tag.size();

        if asize <= current {
            self.shrink_in_place(block, asize);
            #[cfg(feature = "heap-check")]
            {
                self.ledger
                    .record_resize(handle.payload, self.tag(block).size());
                self.consistency_check();
            }
            return Some(handle);
        }

        self.absorb_following(block, asize);
        if self.tag(block).size() >= asize {
            self.shrink_in_place(block, asize);
            #[cfg(feature = "heap-check")]
            {
                self.ledger
                    .record_resize(handle.payload, self.tag(block).size());
                self.consistency_check();
            }
            return Some(handle);
        }

        // No room in place; move the payload. The old block may have grown
        // over absorbed neighbors above, which is harmless if the allocation
        // below fails: the handle stays valid, just roomier.
        #[cfg(feature = "heap-check")]
        self.ledger
            .record_resize(handle.payload, self.tag(block).size());

        let new_handle = self.allocate(new_size)?;
        let old_payload_len = (current - WORD_SIZE) as usize;
        // SAFETY: both payloads are live, in-bounds and disjoint, and the new
        // block's payload is at least old_payload_len bytes by construction.
        unsafe {
            ptr::copy_nonoverlapping(
                self.region.ptr_at(handle.payload).as_ptr(),
                self.region.ptr_at(new_handle.payload).as_ptr(),
                old_payload_len,
            );
        }
        self.release(handle);

        Some(new_handle)
    }

    /// Pointer to the handle's payload bytes.
    #[must_use]
    pub fn payload_ptr(&self, handle: BlockHandle) -> NonNull<u8> {
        self.region.ptr_at(handle.payload)
    }

    /// Number of usable payload bytes behind the handle. At least the size
    /// requested, usually a little more due to alignment.
    #[must_use]
    pub fn usable_size(&self, handle: BlockHandle) -> usize {
        (self.tag(block_of_payload(handle.payload)).size() - WORD_SIZE) as usize
    }

    /// Current region length in bytes. Grows monotonically; useful for
    /// harnesses measuring space utilization.
    #[must_use]
    pub fn region_len(&self) -> usize {
        self.region.len() as usize
    }

    /// Places an allocation of `asize` bytes into `block`, which must be free
    /// and already unlinked. Splits the tail off into a new free block when
    /// it is at least a minimum block; otherwise the whole block is consumed
    /// so no unusable fragment is created.
    fn place(&mut self, block: u32, asize: u32) -> BlockHandle {
        let tag = self.tag(block);
        debug_assert!(!tag.is_alloc());
        let size = tag.size();
        debug_assert!(size >= asize);
        let remainder = size - asize;

        if remainder >= MIN_BLOCK_SIZE {
            self.region.set_word(
                block,
                Tag::pack(asize, true)
                    .with_prev_alloc(tag.prev_alloc())
                    .word(),
            );
            let rest = block + asize;
            self.write_free_block(rest, remainder, true);
            self.free.insert(&mut self.region, rest);
            // The block after `rest` already sees a free predecessor, so its
            // prev_alloc bit is correct as is.
        } else {
            self.region.set_word(
                block,
                Tag::pack(size, true)
                    .with_prev_alloc(tag.prev_alloc())
                    .word(),
            );
            self.set_prev_alloc(block + size, true);
        }

        BlockHandle {
            payload: payload_of(block),
        }
    }

    /// Boundary-tag coalescing. `block` must be free, with header and footer
    /// written, and not linked into any class list. Free neighbors are
    /// unlinked and merged; the merged block is returned unregistered, and
    /// the caller decides which class list it joins.
    fn coalesce(&mut self, block: u32) -> u32 {
        let tag = self.tag(block);
        let size = tag.size();
        let next = block + size;
        let next_tag = self.tag(next);

        let prev_free = !tag.prev_alloc();
        let next_free = !next_tag.is_alloc();

        match (prev_free, next_free) {
            (false, false) => block,
            (false, true) => {
                self.free.remove(&mut self.region, next);
                self.write_free_block(block, size + next_tag.size(), tag.prev_alloc());
                block
            }
            (true, false) => {
                let prev = self.prev_neighbor(block);
                self.free.remove(&mut self.region, prev);
                let prev_tag = self.tag(prev);
                self.write_free_block(prev, prev_tag.size() + size, prev_tag.prev_alloc());
                prev
            }
            (true, true) => {
                let prev = self.prev_neighbor(block);
                self.free.remove(&mut self.region, prev);
                self.free.remove(&mut self.region, next);
                let prev_tag = self.tag(prev);
                self.write_free_block(
                    prev,
                    prev_tag.size() + size + next_tag.size(),
                    prev_tag.prev_alloc(),
                );
                prev
            }
        }
    }

    /// Grows the region enough to carve a free block of at least `asize`
    /// bytes at the old heap end, and returns that block registered in its
    /// class list.
    ///
    /// When the request exceeds the chunk size and a free block already abuts
    /// the old epilogue, its bytes are deducted from the amount requested
    /// from the provider, so the region never grows more than necessary.
    fn extend_heap(&mut self, asize: u32) -> io::Result<u32> {
        let old_len = self.region.len();
        let epilogue = old_len - WORD_SIZE;
        let epilogue_tag = self.tag(epilogue);

        let mut need = asize;
        if asize > CHUNK_SIZE && !epilogue_tag.prev_alloc() {
            let trailing = Tag::from_word(self.region.word(epilogue - WORD_SIZE)).size();
            // A trailing block that could satisfy the request on its own
            // would have been found by find_fit already.
            debug_assert!(trailing < asize);
            need = asize - trailing;
        }

        let grow = u64::from(need).next_multiple_of(u64::from(CHUNK_SIZE));
        let grow = usize::try_from(grow).map_err(|_| {
            io::Error::new(io::ErrorKind::OutOfMemory, "growth request overflows")
        })?;

        let appended_at = match self.region.extend(grow) {
            Ok(offset) => offset,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(asize, grow, "heap extension failed: {err}");
                return Err(err);
            }
        };
        debug_assert_eq!(appended_at, old_len);

        // The old epilogue word becomes the new block's header; a fresh
        // epilogue caps the appended space.
        #[allow(clippy::cast_possible_truncation)]
        let appended = grow as u32;
        self.write_free_block(epilogue, appended, epilogue_tag.prev_alloc());
        self.region
            .set_word(epilogue + appended, Tag::pack(0, true).word());

        let merged = self.absorb_preceding(epilogue);
        self.free.insert(&mut self.region, merged);

        #[cfg(feature = "tracing")]
        tracing::trace!(
            appended,
            merged_size = self.tag(merged).size(),
            region_len = self.region.len(),
            "heap extended"
        );

        Ok(merged)
    }

    /// Merges `block` with the run of free blocks preceding it, walking
    /// backward through their footers. `block` must be free, tagged, and
    /// unlinked; the absorbed predecessors are unlinked from their lists.
    /// Returns the merged block's offset.
    fn absorb_preceding(&mut self, mut block: u32) -> u32 {
        loop {
            let tag = self.tag(block);
            if tag.prev_alloc() {
                return block;
            }

            let prev = self.prev_neighbor(block);
            self.free.remove(&mut self.region, prev);
            let prev_tag = self.tag(prev);
            self.write_free_block(prev, prev_tag.size() + tag.size(), prev_tag.prev_alloc());
            block = prev;
        }
    }

    /// Grows the allocated `block` in place by absorbing following free
    /// blocks, walking forward through their headers, until the block
    /// reaches `target` bytes or the next neighbor is allocated.
    fn absorb_following(&mut self, block: u32, target: u32) {
        loop {
            let tag = self.tag(block);
            if tag.size() >= target {
                return;
            }

            let next = block + tag.size();
            let next_tag = self.tag(next);
            if next_tag.is_alloc() {
                return;
            }

            self.free.remove(&mut self.region, next);
            let new_size = tag.size() + next_tag.size();
            self.region.set_word(
                block,
                Tag::pack(new_size, true)
                    .with_prev_alloc(tag.prev_alloc())
                    .word(),
            );
            self.set_prev_alloc(block + new_size, true);
        }
    }

    /// Trims an allocated block down to `asize` bytes, refreeing the tail.
    /// A tail smaller than a minimum block stays attached to the allocation.
    fn shrink_in_place(&mut self, block: u32, asize: u32) {
        let tag = self.tag(block);
        let remainder = tag.size() - asize;
        if remainder < MIN_BLOCK_SIZE {
            return;
        }

        self.region.set_word(
            block,
            Tag::pack(asize, true)
                .with_prev_alloc(tag.prev_alloc())
                .word(),
        );
        let rest = block + asize;
        self.write_free_block(rest, remainder, true);
        let merged = self.coalesce(rest);
        self.free.insert(&mut self.region, merged);
        let merged_size = self.tag(merged).size();
        self.set_prev_alloc(merged + merged_size, false);
    }

    /// Locates the free block immediately before `block` via its footer.
    fn prev_neighbor(&self, block: u32) -> u32 {
        let prev_size = Tag::from_word(self.region.word(block - WORD_SIZE)).size();
        block - prev_size
    }

    /// Writes a free block's header and mirrored footer. Link words are left
    /// for the class list to fill on insertion.
    fn write_free_block(&mut self, block: u32, size: u32, prev_alloc: bool) {
        let tag = Tag::pack(size, false).with_prev_alloc(prev_alloc);
        self.region.set_word(block, tag.word());
        self.region.set_word(footer_of(block, size), tag.word());
    }

    /// Updates the `prev_alloc` bit of the block at `block`, mirroring it
    /// into the footer when that block is free so backward scans stay
    /// coherent. Size and alloc bits are untouched.
    fn set_prev_alloc(&mut self, block: u32, prev_alloc: bool) {
        let tag = self.tag(block).with_prev_alloc(prev_alloc);
        self.region.set_word(block, tag.word());
        if !tag.is_alloc() && tag.size() > 0 {
            self.region
                .set_word(footer_of(block, tag.size()), tag.word());
        }
    }

    pub(crate) fn tag(&self, block: u32) -> Tag {
        Tag::from_word(self.region.word(block))
    }

    /// Offset of the first block header; the walk anchor for diagnostics.
    pub(crate) const fn first_block_offset() -> u32 {
        FIRST_BLOCK_OFFSET
    }

    #[cfg(feature = "heap-check")]
    fn consistency_check(&self) {
        crate::check::verify(self);
    }
}

/// Rounds a requested payload size up to a legal block size: payload plus
/// header word, aligned to the block granularity. `None` when the result
/// would not fit the largest size class; such requests are rejected
/// outright rather than wrapped or truncated.
fn aligned_block_size(size: usize) -> Option<u32> {
    let asize = (size as u64)
        .checked_add(u64::from(WORD_SIZE))?
        .checked_next_multiple_of(u64::from(ALIGNMENT))?
        .max(u64::from(MIN_BLOCK_SIZE));

    if asize > u64::from(MAX_BLOCK_SIZE) {
        return None;
    }

    #[allow(clippy::cast_possible_truncation)]
    Some(asize as u32)
}
