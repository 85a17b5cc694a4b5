//! Physical frame table and eviction.
//!
//! Frames live in an index-addressed arena; pages refer to their frame
//! by stable [`FrameId`], never by pointer. One lock serializes the
//! table; it is dropped across the swap-out I/O of an eviction and
//! reacquired only to finalize unlinking, so disk writes never run under
//! the frame lock.
//!
//! A frame becomes an eviction candidate only once its page is fully
//! claimed (linked, mapped and loaded); a frame in the middle of being
//! claimed is invisible to the victim scan.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::page::Page;
use super::phys::{PhysPage, PhysPageProvider};
use super::{MapperRef, PageRef, VmError, VmServices};

/// Frames evicted since boot
static FRAMES_EVICTED: AtomicU64 = AtomicU64::new(0);

/// Stable index of a frame in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

impl FrameId {
    pub fn index(&self) -> usize {
        self.0
    }
}

// =============================================================================
// Eviction policy
// =============================================================================

/// Victim selection over the eviction-candidate queue. The queue is kept
/// in insertion order (oldest claim first); a policy picks a position in
/// it. Swapping in a different policy only requires honoring that
/// contract — positions past the queue length are treated as "no pick".
pub trait EvictionPolicy: Send {
    fn select(&mut self, candidates: &VecDeque<FrameId>) -> Option<usize>;
}

/// Reference policy: evict the frame whose page was claimed earliest.
pub struct OldestFirst;

impl EvictionPolicy for OldestFirst {
    fn select(&mut self, candidates: &VecDeque<FrameId>) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

// =============================================================================
// Frame table
// =============================================================================

struct FrameSlot {
    phys: PhysPage,
    /// Back-reference to the occupying page; None while the frame is
    /// being handed to a new page or drained by an eviction.
    page: Option<PageRef>,
    /// Address space the occupying page is mapped in
    mapper: Option<MapperRef>,
    /// Set while an eviction owns this frame's storage. A concurrent
    /// destroy may unlink the page but must leave the storage to the
    /// evictor.
    evicting: bool,
}

struct FrameTableInner {
    slots: Vec<Option<FrameSlot>>,
    free_ids: Vec<usize>,
    /// Fully-claimed frames, insertion order
    queue: VecDeque<FrameId>,
    pool: Box<dyn PhysPageProvider>,
    policy: Box<dyn EvictionPolicy>,
}

impl FrameTableInner {
    fn adopt(&mut self, phys: PhysPage) -> FrameId {
        let slot = FrameSlot {
            phys,
            page: None,
            mapper: None,
            evicting: false,
        };
        match self.free_ids.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                FrameId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                FrameId(self.slots.len() - 1)
            }
        }
    }
}

/// Process-wide frame table
pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
    pool_total: usize,
}

impl FrameTable {
    pub fn new(pool: Box<dyn PhysPageProvider>, policy: Box<dyn EvictionPolicy>) -> Self {
        let pool_total = pool.total();
        Self {
            inner: Mutex::new(FrameTableInner {
                slots: Vec::new(),
                free_ids: Vec::new(),
                queue: VecDeque::new(),
                pool,
                policy,
            }),
            pool_total,
        }
    }

    /// Pool capacity in pages
    pub fn pool_total(&self) -> usize {
        self.pool_total
    }

    /// Pages currently free in the pool
    pub fn pool_available(&self) -> usize {
        self.inner.lock().pool.available()
    }

    /// Physical-page handle of a live frame, None once retired
    pub fn phys_of(&self, id: FrameId) -> Option<PhysPage> {
        let inner = self.inner.lock();
        inner.slots[id.0].as_ref().map(|slot| slot.phys)
    }

    /// Page currently linked to a frame, if any
    pub fn linked_page(&self, id: FrameId) -> Option<PageRef> {
        let inner = self.inner.lock();
        inner.slots[id.0].as_ref().and_then(|slot| slot.page.clone())
    }

    /// Link a page to a frame. Caller holds the page lock; the link and
    /// the page's back-reference are set together under the frame lock.
    pub fn link(&self, id: FrameId, page: &PageRef, mapper: &MapperRef, guard: &mut Page) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots[id.0].as_mut() {
            debug_assert!(slot.page.is_none());
            slot.page = Some(page.clone());
            slot.mapper = Some(mapper.clone());
            guard.set_frame(Some(id));
        }
    }

    /// Make a fully-claimed frame visible to the victim scan.
    pub fn enqueue(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.queue.contains(&id));
        inner.queue.push_back(id);
    }

    /// Sever the frame↔page link. Caller holds the page lock.
    pub fn unlink(&self, id: FrameId, guard: &mut Page) {
        let mut inner = self.inner.lock();
        guard.set_frame(None);
        inner.queue.retain(|f| *f != id);
        if let Some(slot) = inner.slots[id.0].as_mut() {
            slot.page = None;
            slot.mapper = None;
        }
    }

    /// Return an unlinked frame's storage to the pool and retire the
    /// descriptor. If an eviction currently owns the storage, retirement
    /// is left to it.
    pub fn release(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots[id.0].take() else {
            return;
        };
        debug_assert!(slot.page.is_none(), "release of a linked frame");
        if slot.evicting {
            // The evictor still holds this slot; put it back and let the
            // eviction outcome decide the storage's fate.
            inner.slots[id.0] = Some(slot);
            return;
        }
        inner.queue.retain(|f| *f != id);
        inner.free_ids.push(id.0);
        inner.pool.free(slot.phys);
    }
}

// =============================================================================
// Acquisition and eviction
// =============================================================================

enum EvictOutcome {
    /// Victim written out and unlinked; its storage is ours.
    Evicted,
    /// Victim vanished under us (concurrent destroy); storage is ours.
    Gone,
    /// Swap-out failed; victim is still resident.
    Failed(VmError),
}

/// Acquire a frame for a new claim: direct allocation from the pool, or
/// eviction of a victim chosen by the table's policy. The returned frame
/// is unlinked and not yet an eviction candidate.
///
/// Total resource exhaustion (no free frame and no swap slot) is fatal.
/// A writeback I/O error during eviction is not: the victim is requeued
/// and the error is returned for the caller to unwind.
pub fn acquire(services: &VmServices) -> Result<FrameId, VmError> {
    let frames = &services.frames;
    let mut inner = frames.inner.lock();
    loop {
        if let Some(phys) = inner.pool.alloc() {
            return Ok(inner.adopt(phys));
        }

        let picked = {
            let FrameTableInner { policy, queue, .. } = &mut *inner;
            policy.select(queue).and_then(|pos| queue.remove(pos))
        };
        let Some(victim) = picked else {
            drop(inner);
            crate::kfatal!("[vm] out of physical frames with no eviction candidate");
            panic!("vm: frame exhaustion");
        };

        let (page, mapper, phys) = {
            let Some(slot) = inner.slots[victim.0].as_mut() else {
                continue;
            };
            slot.evicting = true;
            match (slot.page.clone(), slot.mapper.clone()) {
                (Some(p), Some(m)) => (p, m, slot.phys),
                _ => {
                    // Already unlinked; adopt the storage directly.
                    slot.evicting = false;
                    return Ok(victim);
                }
            }
        };

        drop(inner);
        let outcome = evict_one(services, victim, &page, &mapper, phys);
        inner = frames.inner.lock();

        if let Some(slot) = inner.slots[victim.0].as_mut() {
            slot.evicting = false;
        }

        match outcome {
            EvictOutcome::Evicted => {
                FRAMES_EVICTED.fetch_add(1, Ordering::Relaxed);
                crate::kdebug!("[vm] evicted frame {}", victim.0);
                return Ok(victim);
            }
            EvictOutcome::Gone => return Ok(victim),
            EvictOutcome::Failed(err) => {
                if err == VmError::SwapExhausted {
                    drop(inner);
                    crate::kfatal!("[vm] no free frames and swap store exhausted");
                    panic!("vm: frame and swap exhaustion");
                }
                inner.queue.push_back(victim);
                return Err(err);
            }
        }
    }
}

/// Write a victim out and unlink it. Runs without the frame lock; the
/// victim is already off the candidate queue, so no second eviction can
/// pick it meanwhile.
fn evict_one(
    services: &VmServices,
    id: FrameId,
    page: &PageRef,
    mapper: &MapperRef,
    phys: PhysPage,
) -> EvictOutcome {
    let mut guard = page.lock();
    if guard.frame_id() != Some(id) {
        // Destroyed while we were acquiring the page lock.
        return EvictOutcome::Gone;
    }
    match guard.swap_out(services, mapper, phys.kva()) {
        Ok(()) => {
            mapper.lock().unmap(guard.va());
            let mut inner = services.frames.inner.lock();
            guard.set_frame(None);
            if let Some(slot) = inner.slots[id.0].as_mut() {
                slot.page = None;
                slot.mapper = None;
            }
            EvictOutcome::Evicted
        }
        Err(err) => EvictOutcome::Failed(err),
    }
}

/// Frames evicted since boot
pub fn evictions() -> u64 {
    FRAMES_EVICTED.load(Ordering::Relaxed)
}
