use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{Error, Result};

/// One saturating age byte per PFN. Backed by a private anonymous mapping so
/// the kernel only commits the regions a scan actually touches.
pub struct AgeArray {
    ptr: NonNull<c_void>,
    len: usize,
}

impl AgeArray {
    pub fn new(nr_pfns: u64) -> Result<Self> {
        let len = NonZeroUsize::new(nr_pfns as usize)
            .ok_or_else(|| Error::init("cannot allocate an empty page age array"))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| Error::init(format!("failed to map {nr_pfns} byte page age array: {e}")))?;
        Ok(Self {
            ptr,
            len: len.get(),
        })
    }
}

impl Deref for AgeArray {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast(), self.len) }
    }
}

impl DerefMut for AgeArray {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len) }
    }
}

impl Drop for AgeArray {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped once
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

// the mapping is process-private and owned exclusively by the array
unsafe impl Send for AgeArray {}
