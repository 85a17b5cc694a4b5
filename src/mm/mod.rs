//! Demand-paged virtual memory management for NexaOS
//!
//! This module contains the whole VM core:
//! - Supplemental page tables (per-process page descriptors)
//! - Physical frame table with eviction
//! - Disk-backed swap store
//! - Page-type state machine (uninit / anonymous / file-backed)
//! - Page-fault control path with stack growth
//! - mmap-style lazy file mappings
//!
//! # Architecture
//!
//! ```text
//! fault / syscall layer
//!         │
//! ┌───────▼────────┐     ┌──────────────────┐
//! │   ProcessVm    │────▶│ SupplementalPage │  per process
//! │ (one/process)  │     │      Table       │
//! └───────┬────────┘     └──────────────────┘
//!         │ claims / evictions
//! ┌───────▼────────┐     ┌──────────────────┐
//! │   VmServices   │────▶│ FrameTable       │  process-wide,
//! │ (one at boot)  │     │ SwapStore        │  explicitly owned
//! └────────────────┘     └──────────────────┘
//! ```
//!
//! `VmServices` is constructed exactly once at boot and handed by
//! reference to every consumer; there are no ambient globals behind the
//! allocation paths.

use alloc::sync::Arc;
use spin::Mutex;

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
#[cfg(target_arch = "x86_64")]
pub mod paging;
pub mod phys;
pub mod spt;
pub mod swap;

pub use fault::FaultInfo;
pub use frame::{EvictionPolicy, FrameId, FrameTable, OldestFirst};
pub use page::{FileSegment, InitArg, Page, PageInit, PageKind, PageTarget};
pub use phys::{PhysPage, PhysPageProvider, RegionPool};
pub use spt::SupplementalPageTable;
pub use swap::SwapStore;

// =============================================================================
// Constants
// =============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// First non-canonical-adjacent kernel address; everything at or above
/// this is kernel space and never demand-paged through this subsystem.
pub const KERNEL_SPACE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Top of the user stack region (exclusive ceiling for stack faults)
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Maximum size the user stack may grow to (1 MiB)
pub const MAX_STACK_SIZE: u64 = 1 << 20;

/// How far below the effective stack pointer a fault may land and still
/// count as stack growth. Covers a `push` issued before the fault.
pub const STACK_SLACK: u64 = 8;

/// Round an address down to its containing page base
#[inline]
pub const fn page_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round an address up to the next page boundary
#[inline]
pub const fn page_round_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Offset of an address within its page
#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}

/// Check whether an address belongs to kernel space
#[inline]
pub const fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_SPACE_BASE
}

// =============================================================================
// Error type
// =============================================================================

/// Error type for VM operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Metadata or page-table memory could not be allocated
    NoMemory,
    /// Swap store has no free slot (or no swap capacity at all)
    SwapExhausted,
    /// Disk or file I/O failed
    Io,
    /// Virtual address already carries a page in this table
    Occupied,
    /// No page registered at the given address
    NotFound,
    /// Address is null, kernel-space, or otherwise outside the mappable range
    BadAddress,
    /// Write access to a read-only page
    ReadOnly,
    /// Malformed arguments (alignment, zero length, empty file)
    InvalidArgument,
    /// Page went through a failed transition and is permanently unusable
    Unusable,
    /// Operation does not apply to the page's current variant
    InvalidState,
}

impl VmError {
    /// Convert to POSIX errno value
    pub fn to_errno(&self) -> i32 {
        match self {
            VmError::NoMemory => -crate::posix::errno::ENOMEM,
            VmError::SwapExhausted => -crate::posix::errno::ENOSPC,
            VmError::Io => -crate::posix::errno::EIO,
            VmError::Occupied => -crate::posix::errno::EEXIST,
            VmError::NotFound => -crate::posix::errno::ENOENT,
            VmError::BadAddress => -crate::posix::errno::EFAULT,
            VmError::ReadOnly => -crate::posix::errno::EACCES,
            VmError::InvalidArgument => -crate::posix::errno::EINVAL,
            VmError::Unusable => -crate::posix::errno::EFAULT,
            VmError::InvalidState => -crate::posix::errno::EINVAL,
        }
    }
}

impl From<crate::fs::FsError> for VmError {
    fn from(_: crate::fs::FsError) -> Self {
        VmError::Io
    }
}

// =============================================================================
// Address-space interface
// =============================================================================

/// Hardware page-table operations the VM core needs from an address
/// space: install and remove leaf mappings and track the per-mapping
/// dirty bit (the "modified marker" of file-backed pages).
///
/// The x86_64 implementation is [`paging::X86AddressSpace`]; tests use a
/// software mock.
pub trait AddressSpaceOps: Send {
    /// Map `va` to the physical page `frame`, user-accessible, writable
    /// iff `writable`.
    fn map(&mut self, va: u64, frame: &PhysPage, writable: bool) -> Result<(), VmError>;

    /// Remove the mapping at `va`, if any.
    fn unmap(&mut self, va: u64);

    /// Whether the mapping at `va` has been written through since the
    /// dirty bit was last cleared.
    fn is_dirty(&self, va: u64) -> bool;

    /// Clear the dirty bit of the mapping at `va`.
    fn clear_dirty(&mut self, va: u64);
}

/// Shared handle to a process address space
pub type MapperRef = Arc<Mutex<dyn AddressSpaceOps>>;

/// Shared handle to a page descriptor. The owning SPT holds one
/// reference; the frame table holds a second while the page is resident.
pub type PageRef = Arc<Mutex<Page>>;

// =============================================================================
// Process-wide services
// =============================================================================

/// The process-wide VM services: the frame table (with its physical-page
/// pool and eviction policy) and the swap store. Constructed once at
/// boot and passed by reference to every consumer.
pub struct VmServices {
    pub frames: FrameTable,
    pub swap: SwapStore,
}

impl VmServices {
    pub fn new(frames: FrameTable, swap: SwapStore) -> Self {
        kinfo_geometry(&frames, &swap);
        Self { frames, swap }
    }
}

fn kinfo_geometry(frames: &FrameTable, swap: &SwapStore) {
    crate::kinfo!(
        "[vm] services up: {} physical frames, {} swap slots",
        frames.pool_total(),
        swap.slot_count()
    );
}

// =============================================================================
// Per-process facade
// =============================================================================

/// Per-process view of the VM: the supplemental page table plus the
/// process's address space, bound to the boot-time services. This is the
/// surface the syscall layer and process creation talk to.
pub struct ProcessVm {
    services: Arc<VmServices>,
    mapper: MapperRef,
    spt: SupplementalPageTable,
}

impl ProcessVm {
    pub fn new(services: Arc<VmServices>, mapper: MapperRef) -> Self {
        Self {
            services,
            mapper,
            spt: SupplementalPageTable::new(),
        }
    }

    pub fn services(&self) -> &Arc<VmServices> {
        &self.services
    }

    pub fn mapper(&self) -> &MapperRef {
        &self.mapper
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// Register a not-yet-resident page at `va`. The page stays inert
    /// until its first claim, at which point it transitions to `target`
    /// and `init` (if any) populates the fresh frame.
    pub fn allocate_lazy(
        &mut self,
        target: PageTarget,
        va: u64,
        writable: bool,
        init: Option<PageInit>,
        arg: InitArg,
    ) -> Result<(), VmError> {
        let va = page_round_down(va);
        let page = Page::new_uninit(va, writable, target, init, arg);
        self.spt.insert(page)?;
        Ok(())
    }

    /// Tear down every page of this process. Runs each page's destroy
    /// contract exactly once; the table is empty afterwards.
    pub fn teardown(&mut self) {
        self.spt.destroy_all(&self.services, &self.mapper);
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Print VM subsystem statistics
pub fn print_vm_statistics(services: &VmServices) {
    crate::kinfo!("=== VM Statistics ===");
    crate::kinfo!(
        "  Frames:   {} total, {} free in pool, {} evictions",
        services.frames.pool_total(),
        services.frames.pool_available(),
        frame::evictions()
    );
    crate::kinfo!(
        "  Swap:     {} slots, {} free, {} outs, {} ins",
        services.swap.slot_count(),
        services.swap.free_slots(),
        page::swap_outs(),
        page::swap_ins()
    );
    crate::kinfo!(
        "  Faults:   {} handled, {} stack growths",
        fault::faults_handled(),
        fault::stack_growths()
    );
    crate::kinfo!("  Mmap:     {} pages built", mmap::mmap_pages_built());
}
