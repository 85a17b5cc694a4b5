//! Supplemental page table: the per-process map from virtual page base
//! to page descriptor.
//!
//! The table owns its pages. It is private to its process and unlocked
//! in normal operation; the per-page mutex exists because the frame
//! table may reach a resident page from another process's eviction.
//! Fork-time copy builds the child table before it is visible to anyone,
//! and unwinds it completely if any step fails.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::fault::claim_ref;
use super::page::{FileSegment, InitArg, Page, PageKind};
use super::{
    page_round_down, MapperRef, PageRef, ProcessVm, VmError, VmServices, PAGE_SIZE,
};

/// Per-process supplemental page table
pub struct SupplementalPageTable {
    pages: BTreeMap<u64, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Look up the page covering `va`
    pub fn find(&self, va: u64) -> Option<PageRef> {
        self.pages.get(&page_round_down(va)).cloned()
    }

    /// Insert a page descriptor; fails if its address is occupied
    pub fn insert(&mut self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        debug_assert_eq!(va, page_round_down(va));
        if self.pages.contains_key(&va) {
            page.discard_inert();
            return Err(VmError::Occupied);
        }
        let cell: PageRef = Arc::new(Mutex::new(page));
        self.pages.insert(va, cell.clone());
        Ok(cell)
    }

    /// Detach the page at `va` without destroying it
    pub fn remove(&mut self, va: u64) -> Option<PageRef> {
        self.pages.remove(&page_round_down(va))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterate page cells in address order
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &PageRef)> {
        self.pages.iter()
    }

    /// Run the destroy contract on every entry and drop the descriptors.
    pub fn destroy_all(&mut self, services: &VmServices, mapper: &MapperRef) {
        while let Some((_, cell)) = self.pages.pop_first() {
            cell.lock().destroy(services, mapper);
        }
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Fork copy
// =============================================================================

/// Snapshot of one parent entry, taken under the parent page's lock so
/// the fields and the optional content capture are consistent.
enum EntrySnapshot {
    Uninit {
        target: super::page::PageTarget,
        init: Option<super::page::PageInit>,
        arg_seg: Option<SegmentFields>,
    },
    Anonymous {
        content: Option<Vec<u8>>,
    },
    FileBacked {
        seg: SegmentFields,
        content: Option<Vec<u8>>,
    },
    Dead,
}

struct SegmentFields {
    file: crate::fs::FileRef,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl SegmentFields {
    fn capture(seg: &FileSegment) -> Self {
        Self {
            file: seg.file.clone(),
            offset: seg.offset,
            read_bytes: seg.read_bytes,
            zero_bytes: seg.zero_bytes,
        }
    }

    /// Reopen the captured handle so the child owns an independent one.
    fn reopen_owned(&self) -> Result<FileSegment, VmError> {
        let file = self.file.reopen().map_err(VmError::from)?;
        Ok(FileSegment {
            file,
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
            owns_handle: true,
        })
    }
}

impl ProcessVm {
    /// Fork-time deep copy: build a child `ProcessVm` whose table mirrors
    /// this one, with independently owned content and file handles.
    ///
    /// Resident parent entries are claimed in the child and byte-copied;
    /// swapped-out anonymous entries are claimed and filled from the
    /// parent's slot (the slot itself is untouched); lazy entries are
    /// recreated lazy, reopening any embedded file handle. Any failure
    /// unwinds the child table fully before reporting.
    pub fn fork(&self, child_mapper: MapperRef) -> Result<ProcessVm, VmError> {
        let mut child = ProcessVm::new(self.services.clone(), child_mapper);

        for (&va, parent_cell) in self.spt.iter() {
            let snapshot = snapshot_entry(&self.services, parent_cell);
            let (writable, snapshot) = match snapshot {
                Ok(pair) => pair,
                Err(err) => {
                    child.teardown();
                    return Err(err);
                }
            };
            if let Err(err) = build_child_entry(&mut child, va, writable, snapshot) {
                child.teardown();
                return Err(err);
            }
        }

        Ok(child)
    }
}

/// Capture everything needed to recreate one entry, then drop the parent
/// lock before the child does any claiming (claiming can evict, and an
/// eviction may want this very parent page).
fn snapshot_entry(
    services: &VmServices,
    cell: &PageRef,
) -> Result<(bool, EntrySnapshot), VmError> {
    let guard = cell.lock();
    let writable = guard.writable();

    let resident_copy = |frame| -> Option<Vec<u8>> {
        services.frames.phys_of(frame?).map(|phys| {
            let mut content = vec![0u8; PAGE_SIZE as usize];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys.kva(),
                    content.as_mut_ptr(),
                    PAGE_SIZE as usize,
                );
            }
            content
        })
    };

    let snapshot = match guard.kind() {
        PageKind::Uninit { target, init, arg } => EntrySnapshot::Uninit {
            target: *target,
            init: *init,
            arg_seg: match arg {
                InitArg::File(seg) => Some(SegmentFields::capture(seg)),
                InitArg::None => None,
            },
        },
        PageKind::Anonymous { slot } => {
            let content = match resident_copy(guard.frame_id()) {
                Some(content) => Some(content),
                None => match *slot {
                    Some(idx) => {
                        let mut content = vec![0u8; PAGE_SIZE as usize];
                        services.swap.read_slot(idx, &mut content)?;
                        Some(content)
                    }
                    None => None,
                },
            };
            EntrySnapshot::Anonymous { content }
        }
        PageKind::FileBacked(seg) => EntrySnapshot::FileBacked {
            seg: SegmentFields::capture(seg),
            content: resident_copy(guard.frame_id()),
        },
        PageKind::Dead => EntrySnapshot::Dead,
    };

    Ok((writable, snapshot))
}

fn build_child_entry(
    child: &mut ProcessVm,
    va: u64,
    writable: bool,
    snapshot: EntrySnapshot,
) -> Result<(), VmError> {
    match snapshot {
        EntrySnapshot::Uninit {
            target,
            init,
            arg_seg,
        } => {
            let arg = match arg_seg {
                Some(fields) => InitArg::File(fields.reopen_owned()?),
                None => InitArg::None,
            };
            let page = Page::new_uninit(va, writable, target, init, arg);
            child.spt.insert(page)?;
            Ok(())
        }

        EntrySnapshot::Anonymous { content } => {
            let page = Page::new_with_kind(va, writable, PageKind::Anonymous { slot: None });
            let cell = child.spt.insert(page)?;
            if let Some(content) = content {
                claim_with_content(child, &cell, &content)?;
            }
            Ok(())
        }

        EntrySnapshot::FileBacked { seg, content } => {
            let seg = seg.reopen_owned()?;
            let page = Page::new_with_kind(va, writable, PageKind::FileBacked(seg));
            let cell = child.spt.insert(page)?;
            if let Some(content) = content {
                claim_with_content(child, &cell, &content)?;
            }
            Ok(())
        }

        // The parent poisoned this address; the child inherits that.
        EntrySnapshot::Dead => {
            let page = Page::new_with_kind(va, writable, PageKind::Dead);
            child.spt.insert(page)?;
            Ok(())
        }
    }
}

/// Claim the child page, then overwrite its freshly loaded frame with
/// the captured parent content.
fn claim_with_content(
    child: &ProcessVm,
    cell: &PageRef,
    content: &[u8],
) -> Result<(), VmError> {
    claim_ref(&child.services, &child.mapper, cell)?;
    let guard = cell.lock();
    let frame = guard.frame_id().ok_or(VmError::InvalidState)?;
    let phys = child
        .services
        .frames
        .phys_of(frame)
        .ok_or(VmError::InvalidState)?;
    unsafe {
        core::ptr::copy_nonoverlapping(content.as_ptr(), phys.kva(), PAGE_SIZE as usize);
    }
    Ok(())
}
