//! The engine-side view of the growing memory region.
//!
//! `HeapRegion` wraps the [`sys_brk::Brk`] provider and speaks the engine's
//! language: word reads and writes by 32-bit byte offset from the region
//! base. The reservation base never moves, so offsets handed out before an
//! extension stay valid after it.

use std::io;
use std::ptr::NonNull;

use sys_brk::Brk;

use crate::layout::{Word, WORD_SIZE};

/// Offsets are 32-bit, so the region must stay addressable by `u32`.
const MAX_REGION_BYTES: u64 = u32::MAX as u64;

#[derive(Debug)]
pub(crate) struct HeapRegion {
    brk: Brk,
}

impl HeapRegion {
    /// Reserves the backing range. `limit` is the simulated memory pressure
    /// ceiling; growth past it makes [`HeapRegion::extend`] fail.
    pub(crate) fn reserve(limit: usize) -> io::Result<Self> {
        if limit as u64 > MAX_REGION_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region limit exceeds 32-bit offset addressability",
            ));
        }

        Ok(Self {
            brk: Brk::reserve(limit)?,
        })
    }

    /// Grows the region by `bytes`, returning the offset of the old end.
    ///
    /// # Errors
    ///
    /// Propagates [`io::ErrorKind::OutOfMemory`] from the provider when the
    /// limit is exhausted; the region is unchanged in that case.
    pub(crate) fn extend(&mut self, bytes: usize) -> io::Result<u32> {
        debug_assert!(bytes % WORD_SIZE as usize == 0, "extension must be word-granular");

        let old_len = self.brk.len();
        if old_len as u64 + bytes as u64 > MAX_REGION_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "region would outgrow 32-bit offsets",
            ));
        }

        self.brk.extend(bytes)?;

        #[allow(clippy::cast_possible_truncation)]
        Ok(old_len as u32)
    }

    /// Current region length in bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn len(&self) -> u32 {
        self.brk.len() as u32
    }

    /// Reads the word at `offset`.
    pub(crate) fn word(&self, offset: u32) -> Word {
        self.check_word_offset(offset);
        // SAFETY: offset is word-aligned and in bounds; the base is at least
        // page-aligned, so the word access is aligned too.
        unsafe {
            self.brk
                .base()
                .as_ptr()
                .add(offset as usize)
                .cast::<Word>()
                .read()
        }
    }

    /// Writes the word at `offset`.
    pub(crate) fn set_word(&mut self, offset: u32, word: Word) {
        self.check_word_offset(offset);
        // SAFETY: as in `word`.
        unsafe {
            self.brk
                .base()
                .as_ptr()
                .add(offset as usize)
                .cast::<Word>()
                .write(word);
        }
    }

    /// Pointer to the byte at `offset`.
    pub(crate) fn ptr_at(&self, offset: u32) -> NonNull<u8> {
        debug_assert!(offset <= self.len());
        // SAFETY: the base is non-null and offset stays within the region.
        unsafe { NonNull::new_unchecked(self.brk.base().as_ptr().add(offset as usize)) }
    }

    fn check_word_offset(&self, offset: u32) {
        debug_assert!(offset % WORD_SIZE == 0, "misaligned word offset {offset}");
        debug_assert!(
            offset + WORD_SIZE <= self.len(),
            "word offset {offset} out of bounds (len {})",
            self.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_reports_old_end() {
        let mut region = HeapRegion::reserve(1 << 16).expect("reserve failed");
        assert_eq!(region.extend(64).expect("extend failed"), 0);
        assert_eq!(region.extend(32).expect("extend failed"), 64);
        assert_eq!(region.len(), 96);
    }

    #[test]
    fn words_round_trip() {
        let mut region = HeapRegion::reserve(1 << 16).expect("reserve failed");
        region.extend(64).expect("extend failed");

        region.set_word(0, 0xDEAD_BEEF);
        region.set_word(60, 0x0000_1001);
        assert_eq!(region.word(0), 0xDEAD_BEEF);
        assert_eq!(region.word(60), 0x0000_1001);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        // The provider rounds the limit up to a whole page, so fill exactly
        // one page before expecting failure.
        let page = sys_brk::page_size();
        let mut region = HeapRegion::reserve(page).expect("reserve failed");
        region.extend(page).expect("extend within limit failed");

        let err = region.extend(16).expect_err("extend past limit succeeded");
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert_eq!(region.len() as usize, page);
    }
}
