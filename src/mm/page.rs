//! Page descriptors and the page-type state machine.
//!
//! Every page is born `Uninit` and transitions exactly once, on first
//! claim, into its target variant:
//!
//! ```text
//!            first claim
//! Uninit ───────────────────▶ Anonymous (swap-slot backed)
//!    │                        FileBacked (file-offset backed)
//!    │ failed transition,
//!    │ destroy
//!    ▼
//!   Dead
//! ```
//!
//! The transition never reverses; a failed transition leaves the page
//! permanently unusable. All variants answer the same dispatch surface:
//! `swap_in` (materialize content into a frame), `swap_out` (save content
//! for eviction) and `destroy` (idempotent teardown that never leaks a
//! frame, slot or owned file handle).

use core::sync::atomic::{AtomicU64, Ordering};

use super::frame::FrameId;
use super::{MapperRef, VmError, VmServices, PAGE_SIZE};
use crate::fs::FileRef;

static SWAP_INS: AtomicU64 = AtomicU64::new(0);
static SWAP_OUTS: AtomicU64 = AtomicU64::new(0);

/// Variant a lazily-registered page will transition into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTarget {
    Anonymous,
    FileBacked,
}

/// One page-sized window into a file
pub struct FileSegment {
    pub file: FileRef,
    /// Byte offset of the window in the file
    pub offset: u64,
    /// Live bytes read from (and written back to) the file
    pub read_bytes: usize,
    /// Zero-filled tail after the live bytes
    pub zero_bytes: usize,
    /// Whether this page privately owns `file` and must close it.
    /// True for per-page handles opened during a mapping request,
    /// false for borrowed handles.
    pub owns_handle: bool,
}

/// Argument retained by an `Uninit` page for its deferred initializer
pub enum InitArg {
    None,
    File(FileSegment),
}

/// Deferred initializer, run against the freshly materialized frame
/// after the variant's default content is in place.
pub type PageInit = fn(&mut [u8], &InitArg) -> Result<(), VmError>;

/// Active variant of a page
pub enum PageKind {
    /// Inert; carries everything needed for the one-shot transition
    Uninit {
        target: PageTarget,
        init: Option<PageInit>,
        arg: InitArg,
    },
    /// Content lives in a frame or in the recorded swap slot
    Anonymous { slot: Option<usize> },
    /// Content lives in a frame or at the recorded file window
    FileBacked(FileSegment),
    /// Destroyed or failed transition; faults on it cannot be handled
    Dead,
}

/// A virtual page and its backing state. Owned by its SPT entry; the
/// frame table holds a second reference while the page is resident.
pub struct Page {
    va: u64,
    writable: bool,
    frame: Option<FrameId>,
    kind: PageKind,
}

impl Page {
    pub fn new_uninit(
        va: u64,
        writable: bool,
        target: PageTarget,
        init: Option<PageInit>,
        arg: InitArg,
    ) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Uninit { target, init, arg },
        }
    }

    /// Build an already-transitioned page (fork copies)
    pub(crate) fn new_with_kind(va: u64, writable: bool, kind: PageKind) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind,
        }
    }

    #[inline]
    pub fn va(&self) -> u64 {
        self.va
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn frame_id(&self) -> Option<FrameId> {
        self.frame
    }

    #[inline]
    pub(crate) fn set_frame(&mut self, frame: Option<FrameId>) {
        self.frame = frame;
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// Swap slot of an anonymous page, if one is assigned
    pub fn anon_slot(&self) -> Option<usize> {
        match &self.kind {
            PageKind::Anonymous { slot } => *slot,
            _ => None,
        }
    }

    /// File window of a file-backed page
    pub fn file_segment(&self) -> Option<&FileSegment> {
        match &self.kind {
            PageKind::FileBacked(seg) => Some(seg),
            _ => None,
        }
    }

    /// Drop a never-inserted (or rejected) descriptor, closing any file
    /// handle it already owns. Only valid before the page ever held a
    /// frame or slot.
    pub(crate) fn discard_inert(self) {
        debug_assert!(self.frame.is_none());
        match self.kind {
            PageKind::Uninit { arg, .. } => consume_arg(arg),
            PageKind::FileBacked(seg) => {
                if seg.owns_handle {
                    seg.file.close();
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Dispatch surface
    // =========================================================================

    /// Materialize this page's content into the frame at `kva`.
    ///
    /// For an `Uninit` page this performs the one-shot transition: the
    /// target variant's fields are installed, its default content is
    /// produced (zero fill for anonymous, file window for file-backed),
    /// and the deferred initializer, if any, runs last. Failure of
    /// either step leaves the page `Dead`.
    pub fn swap_in(&mut self, services: &VmServices, kva: *mut u8) -> Result<(), VmError> {
        let buf = frame_bytes(kva);
        match core::mem::replace(&mut self.kind, PageKind::Dead) {
            PageKind::Dead => Err(VmError::Unusable),

            PageKind::Uninit { target, init, arg } => {
                if let Err(err) = materialize(buf, target, init, &arg) {
                    crate::kerror!(
                        "[vm] uninit transition failed at {:#x}: {:?}",
                        self.va,
                        err
                    );
                    consume_arg(arg);
                    return Err(err);
                }
                self.kind = match target {
                    PageTarget::Anonymous => {
                        consume_arg(arg);
                        PageKind::Anonymous { slot: None }
                    }
                    PageTarget::FileBacked => match arg {
                        InitArg::File(seg) => PageKind::FileBacked(seg),
                        // materialize already rejected this
                        InitArg::None => return Err(VmError::InvalidArgument),
                    },
                };
                Ok(())
            }

            PageKind::Anonymous { slot: Some(idx) } => {
                if let Err(err) = services.swap.read_slot(idx, buf) {
                    self.kind = PageKind::Anonymous { slot: Some(idx) };
                    return Err(err);
                }
                services.swap.free_slot(idx);
                SWAP_INS.fetch_add(1, Ordering::Relaxed);
                self.kind = PageKind::Anonymous { slot: None };
                Ok(())
            }

            PageKind::Anonymous { slot: None } => {
                // Fresh anonymous page (stack growth); nothing in swap.
                buf.fill(0);
                self.kind = PageKind::Anonymous { slot: None };
                Ok(())
            }

            PageKind::FileBacked(seg) => {
                let result = load_file_segment(buf, &seg);
                self.kind = PageKind::FileBacked(seg);
                result
            }
        }
    }

    /// Save this page's content ahead of eviction. The caller (the
    /// eviction path) removes the mapping afterwards; this only persists
    /// content and records where it went.
    pub fn swap_out(
        &mut self,
        services: &VmServices,
        mapper: &MapperRef,
        kva: *mut u8,
    ) -> Result<(), VmError> {
        let va = self.va;
        let buf = frame_bytes(kva);
        match &mut self.kind {
            PageKind::Anonymous { slot } => {
                let idx = match *slot {
                    Some(idx) => idx,
                    None => services.swap.alloc_slot()?,
                };
                if let Err(err) = services.swap.write_slot(idx, buf) {
                    if slot.is_none() {
                        services.swap.free_slot(idx);
                    }
                    return Err(err);
                }
                *slot = Some(idx);
                SWAP_OUTS.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }

            PageKind::FileBacked(seg) => {
                let mut guard = mapper.lock();
                if guard.is_dirty(va) {
                    let n = seg
                        .file
                        .write_at(seg.offset, &buf[..seg.read_bytes])
                        .map_err(VmError::from)?;
                    if n < seg.read_bytes {
                        return Err(VmError::Io);
                    }
                    guard.clear_dirty(va);
                }
                Ok(())
            }

            PageKind::Uninit { .. } | PageKind::Dead => Err(VmError::InvalidState),
        }
    }

    /// Tear this page down: conditional writeback, mapping and frame
    /// release, slot release, owned-handle close. Idempotent; the page
    /// ends `Dead`. Writeback failure is logged but never blocks the
    /// release of the frame or slot.
    pub fn destroy(&mut self, services: &VmServices, mapper: &MapperRef) {
        let va = self.va;

        if let (PageKind::FileBacked(seg), Some(id)) = (&self.kind, self.frame) {
            if mapper.lock().is_dirty(va) {
                match services.frames.phys_of(id) {
                    Some(phys) => {
                        let buf = frame_bytes(phys.kva());
                        match seg.file.write_at(seg.offset, &buf[..seg.read_bytes]) {
                            Ok(n) if n == seg.read_bytes => {}
                            _ => crate::kwarn!(
                                "[vm] writeback failed tearing down {:#x}",
                                va
                            ),
                        }
                    }
                    None => crate::kwarn!("[vm] dirty page {:#x} lost its frame", va),
                }
            }
        }

        if let Some(id) = self.frame.take() {
            mapper.lock().unmap(va);
            services.frames.unlink(id, self);
            services.frames.release(id);
        }

        match core::mem::replace(&mut self.kind, PageKind::Dead) {
            PageKind::Uninit { arg, .. } => consume_arg(arg),
            PageKind::Anonymous { slot } => {
                if let Some(idx) = slot {
                    services.swap.free_slot(idx);
                }
            }
            PageKind::FileBacked(seg) => {
                if seg.owns_handle {
                    seg.file.close();
                }
            }
            PageKind::Dead => {}
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

// The frame's storage is exclusively ours while the page lock is held.
fn frame_bytes<'a>(kva: *mut u8) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(kva, PAGE_SIZE as usize) }
}

fn materialize(
    buf: &mut [u8],
    target: PageTarget,
    init: Option<PageInit>,
    arg: &InitArg,
) -> Result<(), VmError> {
    match target {
        PageTarget::Anonymous => buf.fill(0),
        PageTarget::FileBacked => match arg {
            InitArg::File(seg) => load_file_segment(buf, seg)?,
            InitArg::None => return Err(VmError::InvalidArgument),
        },
    }
    if let Some(hook) = init {
        hook(buf, arg)?;
    }
    Ok(())
}

/// Fill a frame from a file window: `read_bytes` live bytes at the
/// recorded offset, zeros after them (including short reads at EOF).
pub fn load_file_segment(buf: &mut [u8], seg: &FileSegment) -> Result<(), VmError> {
    debug_assert_eq!(seg.read_bytes + seg.zero_bytes, PAGE_SIZE as usize);
    let n = seg
        .file
        .read_at(seg.offset, &mut buf[..seg.read_bytes])
        .map_err(VmError::from)?;
    buf[n..].fill(0);
    Ok(())
}

fn consume_arg(arg: InitArg) {
    if let InitArg::File(seg) = arg {
        if seg.owns_handle {
            seg.file.close();
        }
    }
}

/// Anonymous pages read back from swap since boot
pub fn swap_ins() -> u64 {
    SWAP_INS.load(Ordering::Relaxed)
}

/// Anonymous pages written to swap since boot
pub fn swap_outs() -> u64 {
    SWAP_OUTS.load(Ordering::Relaxed)
}
