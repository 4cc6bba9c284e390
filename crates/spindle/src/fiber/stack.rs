//! Fiber stacks: anonymous mappings with a guard page below the usable area.
//!
//! A stack is allocated once per fiber and reused across `reset`, so the
//! mapping cost is paid only when a fresh fiber is created.

use std::io;
use std::ptr::NonNull;

use crate::error::{RuntimeError, RuntimeResult};

/// An owned, fixed-size execution stack
pub struct Stack {
    /// Lowest address of the mapping (the guard page)
    base: NonNull<u8>,
    /// Total mapping length including the guard page
    mapped: usize,
    /// Usable bytes above the guard page
    size: usize,
}

// The mapping is plain memory owned by exactly one fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> RuntimeResult<Self> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let mapped = usable + page;

        // SAFETY: anonymous private mapping, no fd involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::StackAlloc {
                size,
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: the first page belongs to the mapping created above.
        if unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            let source = io::Error::last_os_error();
            // SAFETY: unmapping exactly what was mapped.
            unsafe { libc::munmap(ptr, mapped) };
            return Err(RuntimeError::StackAlloc { size, source });
        }

        Ok(Self {
            // mmap never returns null on success
            base: NonNull::new(ptr as *mut u8).ok_or_else(|| RuntimeError::StackAlloc {
                size,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            })?,
            mapped,
            size: usable,
        })
    }

    /// One past the highest usable address; stacks grow down from here
    pub fn top(&self) -> *mut u8 {
        // SAFETY: `mapped` is the length of the mapping starting at `base`.
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Lowest usable address (just above the guard page)
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: the guard page is inside the mapping.
        unsafe { self.top().sub(self.size) }
    }

    /// Usable size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base`/`mapped` describe a live mapping owned by `self`.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("size", &self.size)
            .finish()
    }
}
