//! Segregated, intrusive free lists.
//!
//! One doubly-linked list per size class. The links live inside the free
//! blocks themselves, as 32-bit offsets in the first two payload words, so
//! the lists own no storage beyond the 28 head slots. A block belongs to
//! exactly one class list while free and to none while allocated.

use crate::layout::{next_link_of, prev_link_of, Tag, Word};
use crate::region::HeapRegion;
use crate::size_class::{class_of, CLASS_COUNT};

/// Offset 0 is the prologue sentinel word, which can never be a block
/// header, so it doubles as the null link.
const NO_LINK: Word = 0;

#[derive(Debug)]
pub(crate) struct SegregatedFreeLists {
    pub(crate) heads: [Option<u32>; CLASS_COUNT],
}

impl SegregatedFreeLists {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; CLASS_COUNT],
        }
    }

    /// Links a free block into the class matching its size.
    ///
    /// With the `lifo-ordering` feature the block is pushed to the head in
    /// O(1). The default keeps each list address-ordered, trading a linear
    /// walk on insertion for a deterministic list layout.
    pub(crate) fn insert(&mut self, region: &mut HeapRegion, block: u32) {
        let tag = Tag::from_word(region.word(block));
        debug_assert!(!tag.is_alloc(), "inserting an allocated block");
        let class = class_of(tag.size());

        #[cfg(feature = "lifo-ordering")]
        self.push_front(region, class, block);

        #[cfg(not(feature = "lifo-ordering"))]
        self.insert_ordered(region, class, block);
    }

    /// Unlinks `block` from its class list in O(1) using its own links.
    pub(crate) fn remove(&mut self, region: &mut HeapRegion, block: u32) {
        let size = Tag::from_word(region.word(block)).size();
        let class = class_of(size);
        let prev = Self::prev(region, block);
        let next = Self::next(region, block);

        match prev {
            None => {
                debug_assert_eq!(self.heads[class], Some(block), "block not at its class head");
                self.heads[class] = next;
            }
            Some(prev) => Self::write_link(region, next_link_of(prev), next),
        }

        if let Some(next) = next {
            Self::write_link(region, prev_link_of(next), prev);
        }
    }

    /// First-fit search: scans the class covering `size` and then each larger
    /// class, returning the first block big enough.
    pub(crate) fn find_fit(&self, region: &HeapRegion, size: u32) -> Option<u32> {
        for class in class_of(size)..CLASS_COUNT {
            let mut cursor = self.heads[class];
            while let Some(block) = cursor {
                if Tag::from_word(region.word(block)).size() >= size {
                    return Some(block);
                }
                cursor = Self::next(region, block);
            }
        }

        None
    }

    fn push_front(&mut self, region: &mut HeapRegion, class: usize, block: u32) {
        let head = self.heads[class];
        Self::write_link(region, prev_link_of(block), None);
        Self::write_link(region, next_link_of(block), head);
        if let Some(head) = head {
            Self::write_link(region, prev_link_of(head), Some(block));
        }
        self.heads[class] = Some(block);
    }

    #[cfg(not(feature = "lifo-ordering"))]
    fn insert_ordered(&mut self, region: &mut HeapRegion, class: usize, block: u32) {
        match self.heads[class] {
            Some(head) if head < block => {
                // All predecessors of the insertion point have lower
                // addresses, so walking next links is enough.
                let mut at = head;
                while let Some(next) = Self::next(region, at) {
                    if next > block {
                        break;
                    }
                    at = next;
                }

                let next = Self::next(region, at);
                Self::write_link(region, prev_link_of(block), Some(at));
                Self::write_link(region, next_link_of(block), next);
                Self::write_link(region, next_link_of(at), Some(block));
                if let Some(next) = next {
                    Self::write_link(region, prev_link_of(next), Some(block));
                }
            }
            _ => self.push_front(region, class, block),
        }
    }

    pub(crate) fn next(region: &HeapRegion, block: u32) -> Option<u32> {
        Self::read_link(region, next_link_of(block))
    }

    pub(crate) fn prev(region: &HeapRegion, block: u32) -> Option<u32> {
        Self::read_link(region, prev_link_of(block))
    }

    fn read_link(region: &HeapRegion, offset: u32) -> Option<u32> {
        match region.word(offset) {
            NO_LINK => None,
            link => Some(link),
        }
    }

    fn write_link(region: &mut HeapRegion, offset: u32, link: Option<u32>) {
        region.set_word(offset, link.unwrap_or(NO_LINK));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scratch region with free-block tags written at the given offsets.
    fn scratch(blocks: &[(u32, u32)]) -> HeapRegion {
        let mut region = HeapRegion::reserve(1 << 16).expect("reserve failed");
        region.extend(1 << 12).expect("extend failed");
        for &(offset, size) in blocks {
            region.set_word(offset, Tag::pack(size, false).word());
        }
        region
    }

    fn collect(lists: &SegregatedFreeLists, region: &HeapRegion, class: usize) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = lists.heads[class];
        while let Some(block) = cursor {
            out.push(block);
            cursor = SegregatedFreeLists::next(region, block);
        }
        out
    }

    #[cfg(not(feature = "lifo-ordering"))]
    #[test]
    fn insert_keeps_address_order() {
        let mut region = scratch(&[(140, 32), (12, 32), (60, 32)]);
        let mut lists = SegregatedFreeLists::new();

        lists.insert(&mut region, 140);
        lists.insert(&mut region, 12);
        lists.insert(&mut region, 60);

        assert_eq!(collect(&lists, &region, class_of(32)), vec![12, 60, 140]);
    }

    #[cfg(feature = "lifo-ordering")]
    #[test]
    fn insert_pushes_to_head() {
        let mut region = scratch(&[(140, 32), (12, 32), (60, 32)]);
        let mut lists = SegregatedFreeLists::new();

        lists.insert(&mut region, 140);
        lists.insert(&mut region, 12);
        lists.insert(&mut region, 60);

        assert_eq!(collect(&lists, &region, class_of(32)), vec![60, 12, 140]);
    }

    #[test]
    fn remove_handles_head_middle_and_tail() {
        let mut region = scratch(&[(12, 32), (60, 32), (140, 32), (204, 32)]);
        let mut lists = SegregatedFreeLists::new();
        for block in [12, 60, 140, 204] {
            lists.insert(&mut region, block);
        }
        let class = class_of(32);

        lists.remove(&mut region, 60);
        let after_middle = collect(&lists, &region, class);
        assert_eq!(after_middle.len(), 3);
        assert!(!after_middle.contains(&60));

        let head = lists.heads[class].unwrap();
        lists.remove(&mut region, head);
        assert!(!collect(&lists, &region, class).contains(&head));

        let remaining = collect(&lists, &region, class);
        let tail = *remaining.last().unwrap();
        lists.remove(&mut region, tail);
        assert_eq!(collect(&lists, &region, class).len(), 1);
    }

    #[test]
    fn remove_singleton_empties_the_class() {
        let mut region = scratch(&[(12, 64)]);
        let mut lists = SegregatedFreeLists::new();
        lists.insert(&mut region, 12);
        lists.remove(&mut region, 12);
        assert!(lists.heads[class_of(64)].is_none());
    }

    #[test]
    fn find_fit_escalates_to_larger_classes() {
        // A 32-byte block shares the search-start class with a 48-byte
        // request but is too small; the 256-byte block in a larger class
        // must be found instead.
        let mut region = scratch(&[(12, 32), (60, 256)]);
        let mut lists = SegregatedFreeLists::new();
        lists.insert(&mut region, 12);
        lists.insert(&mut region, 60);

        assert_eq!(lists.find_fit(&region, 48), Some(60));
        assert_eq!(lists.find_fit(&region, 32), Some(12));
        assert_eq!(lists.find_fit(&region, 512), None);
    }
}
