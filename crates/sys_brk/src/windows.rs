use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

#[derive(Debug)]
pub struct Reservation {
    ptr: *mut std::ffi::c_void,
    len: usize,
    committed: usize,
}

impl Reservation {
    /// Reserves `len` bytes of address space without committing any of it.
    ///
    /// # Safety
    ///
    /// `len` must be non-zero and a multiple of the page size.
    pub unsafe fn reserve(len: usize) -> io::Result<Self> {
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_READWRITE) };

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self {
            ptr,
            len,
            committed: 0,
        })
    }

    /// Commits pages so that `[0, offset + bytes)` is usable. Windows commits
    /// at page granularity, so the committed watermark can run ahead of the
    /// break; recommitting an already committed page is a no-op for the OS.
    pub fn commit(&mut self, offset: usize, bytes: usize) -> io::Result<()> {
        let end = offset + bytes;
        if end <= self.committed || bytes == 0 {
            return Ok(());
        }

        let page = page_size();
        let commit_end = end.next_multiple_of(page).min(self.len);
        let commit_len = commit_end - self.committed;

        let ptr = unsafe {
            VirtualAlloc(
                self.ptr.cast::<u8>().add(self.committed).cast(),
                commit_len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        self.committed = commit_end;

        Ok(())
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0.
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
