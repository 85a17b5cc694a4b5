//! Memory-mapped files.
//!
//! `map` carves a request into page-granular lazy FileBacked entries;
//! nothing is read until the pages fault in. Every page reopens the
//! target file and owns its handle, so pages of one mapping can be torn
//! down independently of the caller's descriptor and of each other.
//! `unmap` walks forward from the original base one page at a time,
//! running each page's full destroy contract, until no entry remains.

use core::cmp::min;
use core::sync::atomic::{AtomicU64, Ordering};

use super::page::{FileSegment, InitArg, PageTarget};
use super::{page_offset, ProcessVm, VmError, PAGE_SIZE};
use crate::fs::FileRef;

static MMAP_PAGES_BUILT: AtomicU64 = AtomicU64::new(0);

impl ProcessVm {
    /// Map `length` bytes of `file` starting at `offset` to the
    /// page-aligned `addr`. Returns the base address of the mapping.
    ///
    /// Fails atomically — with no pages inserted — if the arguments are
    /// malformed, the file is empty, or any page of the target range is
    /// already occupied. A failure while building the range unmaps
    /// whatever was built through the same path as explicit unmap.
    pub fn map(
        &mut self,
        addr: u64,
        length: u64,
        writable: bool,
        file: &FileRef,
        offset: u64,
    ) -> Result<u64, VmError> {
        if addr == 0 {
            return Err(VmError::BadAddress);
        }
        if page_offset(addr) != 0 || page_offset(offset) != 0 {
            return Err(VmError::InvalidArgument);
        }
        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let file_len = file.length();
        if file_len == 0 {
            return Err(VmError::InvalidArgument);
        }

        let page_count = (length + PAGE_SIZE - 1) / PAGE_SIZE;

        // Occupancy pre-scan: reject the whole request before touching
        // anything.
        for i in 0..page_count {
            if self.spt.find(addr + i * PAGE_SIZE).is_some() {
                return Err(VmError::Occupied);
            }
        }

        for i in 0..page_count {
            let page_va = addr + i * PAGE_SIZE;
            let page_off = offset + i * PAGE_SIZE;
            let req_remaining = length - i * PAGE_SIZE;
            let file_remaining = file_len.saturating_sub(page_off);
            let read_bytes = min(PAGE_SIZE, min(req_remaining, file_remaining)) as usize;

            let result = file
                .reopen()
                .map_err(VmError::from)
                .and_then(|handle| {
                    let seg = FileSegment {
                        file: handle,
                        offset: page_off,
                        read_bytes,
                        zero_bytes: PAGE_SIZE as usize - read_bytes,
                        owns_handle: true,
                    };
                    self.allocate_lazy(
                        PageTarget::FileBacked,
                        page_va,
                        writable,
                        None,
                        InitArg::File(seg),
                    )
                });

            if let Err(err) = result {
                crate::kerror!(
                    "[vm] mmap of {} pages at {:#x} failed on page {}: {:?}",
                    page_count,
                    addr,
                    i,
                    err
                );
                self.unmap(addr);
                return Err(err);
            }
        }

        MMAP_PAGES_BUILT.fetch_add(page_count, Ordering::Relaxed);
        Ok(addr)
    }

    /// Unmap the mapping whose base is `addr`: remove and destroy one
    /// page after another until an address with no entry is reached.
    pub fn unmap(&mut self, addr: u64) {
        let mut va = super::page_round_down(addr);
        while let Some(cell) = self.spt.remove(va) {
            cell.lock().destroy(&self.services, &self.mapper);
            va += PAGE_SIZE;
        }
    }
}

/// Lazy file pages registered since boot
pub fn mmap_pages_built() -> u64 {
    MMAP_PAGES_BUILT.load(Ordering::Relaxed)
}
