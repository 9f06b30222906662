//! Grow-only program-break primitive.
//!
//! A [`Brk`] reserves a fixed virtual address range once and then hands out
//! memory by advancing an internal break pointer, like a private `sbrk(2)`.
//! The range only ever grows; nothing is ever handed back until the whole
//! reservation is dropped. The reservation limit acts as simulated memory
//! pressure: once the break reaches it, [`Brk::extend`] fails with
//! [`io::ErrorKind::OutOfMemory`] and the caller has to cope.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A reserved, monotonically growing memory region.
///
/// The region `[base, base + len)` is always readable and writable; the rest
/// of the reservation up to `limit` is claimed address space that `extend`
/// makes usable on demand.
#[derive(Debug)]
pub struct Brk {
    reservation: os::Reservation,
    brk: usize,
}

impl Brk {
    /// Reserves `limit` bytes of address space with an empty initial region.
    ///
    /// `limit` is rounded up to the system page size. No memory is usable
    /// until the first [`Brk::extend`] call.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error if the reservation cannot be created.
    pub fn reserve(limit: usize) -> io::Result<Self> {
        if limit == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation limit must be greater than 0",
            ));
        }

        let page = page_size();
        let limit = limit
            .checked_next_multiple_of(page)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "limit overflows"))?;

        // SAFETY: limit is non-zero and page-aligned.
        let reservation = unsafe { os::Reservation::reserve(limit)? };

        Ok(Self { reservation, brk: 0 })
    }

    /// Advances the break by `incr` bytes.
    ///
    /// Returns a pointer to the start of the newly usable area, i.e. the old
    /// break. The break never moves backwards; `incr == 0` is allowed and
    /// simply reports the current break.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::OutOfMemory`] when the new break would
    /// exceed the reservation limit. The region is unchanged in that case.
    pub fn extend(&mut self, incr: usize) -> io::Result<NonNull<u8>> {
        let new_brk = self
            .brk
            .checked_add(incr)
            .filter(|&end| end <= self.reservation.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "reservation limit exceeded")
            })?;

        self.reservation.commit(self.brk, incr)?;

        let old_brk = self.brk;
        self.brk = new_brk;

        // SAFETY: old_brk is within the reservation, whose base is non-null.
        Ok(unsafe { NonNull::new_unchecked(self.reservation.ptr().add(old_brk)) })
    }

    /// Returns a pointer to the start of the region.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        // SAFETY: the reservation pointer is never null while it is alive.
        unsafe { NonNull::new_unchecked(self.reservation.ptr()) }
    }

    /// Returns the current break offset, i.e. the number of usable bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.brk
    }

    /// Returns `true` if no memory has been made usable yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.brk == 0
    }

    /// Returns the reservation limit in bytes (page-rounded).
    #[must_use]
    pub fn limit(&self) -> usize {
        self.reservation.len()
    }

    /// Returns how many bytes the break can still advance.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.reservation.len() - self.brk
    }
}

// SAFETY: Brk exclusively owns its reservation; moving it between threads is
// fine as long as access stays externally serialized, which &mut enforces.
unsafe impl Send for Brk {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "page size should be a power of 2");
    }

    #[test]
    fn extend_returns_old_break() {
        let mut brk = Brk::reserve(1 << 20).expect("failed to reserve");
        assert_eq!(brk.len(), 0);

        let first = brk.extend(4096).expect("first extend failed");
        assert_eq!(first, brk.base());
        assert_eq!(brk.len(), 4096);

        let second = brk.extend(8192).expect("second extend failed");
        assert_eq!(second.as_ptr() as usize, brk.base().as_ptr() as usize + 4096);
        assert_eq!(brk.len(), 4096 + 8192);
    }

    #[test]
    fn extended_memory_is_writable() {
        let mut brk = Brk::reserve(1 << 16).expect("failed to reserve");
        let ptr = brk.extend(4096).expect("extend failed");

        unsafe {
            std::ptr::write_volatile(ptr.as_ptr(), 42);
            std::ptr::write_volatile(ptr.as_ptr().add(4095), 43);
            assert_eq!(std::ptr::read_volatile(ptr.as_ptr()), 42);
            assert_eq!(std::ptr::read_volatile(ptr.as_ptr().add(4095)), 43);
        }
    }

    #[test]
    fn limit_exhaustion_is_out_of_memory() {
        let page = page_size();
        let mut brk = Brk::reserve(page).expect("failed to reserve");

        brk.extend(page).expect("extend within limit failed");

        let err = brk.extend(1).expect_err("extend past limit succeeded");
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        // The failed call must not have moved the break.
        assert_eq!(brk.len(), page);
        assert_eq!(brk.remaining(), 0);
    }

    #[test]
    fn zero_length_extend_reports_current_break() {
        let mut brk = Brk::reserve(1 << 16).expect("failed to reserve");
        brk.extend(128).expect("extend failed");
        let here = brk.extend(0).expect("zero extend failed");
        assert_eq!(here.as_ptr() as usize, brk.base().as_ptr() as usize + 128);
    }
}
