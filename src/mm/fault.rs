//! Page-fault control path.
//!
//! Order of business on a fault: reject protection violations, null and
//! kernel addresses; look the page up; if absent, check stack-growth
//! eligibility and materialize a fresh zero page; reject writes to
//! read-only pages; claim. A handled fault returns `true` and the caller
//! re-executes the faulting instruction; `false` means the caller
//! terminates the offending process.

use core::sync::atomic::{AtomicU64, Ordering};

use super::frame;
use super::page::{InitArg, PageTarget};
use super::{
    is_kernel_address, page_round_down, MapperRef, PageRef, ProcessVm, VmError, VmServices,
    MAX_STACK_SIZE, STACK_SLACK, USER_STACK_TOP,
};

static FAULTS_HANDLED: AtomicU64 = AtomicU64::new(0);
static STACK_GROWTHS: AtomicU64 = AtomicU64::new(0);

/// Everything the fault path needs to know about one fault. The stack
/// pointers come from the trap frame and from the per-thread snapshot
/// taken at system-call entry; a kernel-origin fault's trap frame does
/// not reveal the user stack pointer, hence both.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting address
    pub addr: u64,
    /// Fault originated in user mode
    pub user: bool,
    /// Access was a write
    pub write: bool,
    /// True page fault (page not present); false means a protection
    /// violation on a present page
    pub not_present: bool,
    /// Stack pointer from the trap frame
    pub trap_sp: u64,
    /// User stack pointer recorded at the last system-call entry
    pub saved_user_sp: u64,
}

impl ProcessVm {
    /// Handle a page fault. Returns whether the fault was resolved; an
    /// unresolved fault terminates the offending process at the caller.
    pub fn handle_fault(&mut self, info: &FaultInfo) -> bool {
        match self.try_handle_fault(info) {
            Ok(()) => {
                FAULTS_HANDLED.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                crate::kdebug!("[vm] fault at {:#x} not handled: {:?}", info.addr, err);
                false
            }
        }
    }

    fn try_handle_fault(&mut self, info: &FaultInfo) -> Result<(), VmError> {
        if !info.not_present {
            // Protection violation on a present page
            return Err(VmError::ReadOnly);
        }
        if info.addr == 0 || is_kernel_address(info.addr) {
            return Err(VmError::BadAddress);
        }

        let va = page_round_down(info.addr);
        let mut page = self.spt.find(va);

        if page.is_none() {
            if !self.try_stack_growth(info, va) {
                return Err(VmError::NotFound);
            }
            page = self.spt.find(va);
        }

        let cell = page.ok_or(VmError::NotFound)?;

        if info.write && !cell.lock().writable() {
            return Err(VmError::ReadOnly);
        }

        claim_ref(&self.services, &self.mapper, &cell)
    }

    /// Force residency of an existing page
    pub fn claim(&mut self, va: u64) -> Result<(), VmError> {
        let cell = self
            .spt
            .find(page_round_down(va))
            .ok_or(VmError::NotFound)?;
        claim_ref(&self.services, &self.mapper, &cell)
    }

    /// Stack growth: the faulting address must sit below the stack
    /// ceiling, within the slack below the effective stack pointer, and
    /// within the maximum stack size. Eligible faults get a fresh
    /// zero-filled anonymous page registered at `va`.
    fn try_stack_growth(&mut self, info: &FaultInfo, va: u64) -> bool {
        let sp = if info.user {
            info.trap_sp
        } else {
            info.saved_user_sp
        };
        if sp == 0 {
            return false;
        }
        if info.addr >= USER_STACK_TOP {
            return false;
        }
        if info.addr.wrapping_add(STACK_SLACK) < sp {
            return false;
        }
        if info.addr < USER_STACK_TOP - MAX_STACK_SIZE {
            return false;
        }

        match self.allocate_lazy(PageTarget::Anonymous, va, true, None, InitArg::None) {
            Ok(()) => {
                STACK_GROWTHS.fetch_add(1, Ordering::Relaxed);
                crate::kdebug!("[vm] stack grows to {:#x}", va);
                true
            }
            Err(_) => false,
        }
    }
}

/// Claim a page cell: acquire a frame, link it, install the mapping and
/// materialize content. Any failure unwinds the partial mapping, link
/// and frame before returning.
pub fn claim_ref(
    services: &VmServices,
    mapper: &MapperRef,
    cell: &PageRef,
) -> Result<(), VmError> {
    let mut page = cell.lock();
    if page.is_resident() {
        return Ok(());
    }

    let id = frame::acquire(services)?;
    let phys = services
        .frames
        .phys_of(id)
        .ok_or(VmError::InvalidState)?;

    services.frames.link(id, cell, mapper, &mut page);

    if let Err(err) = mapper.lock().map(page.va(), &phys, page.writable()) {
        services.frames.unlink(id, &mut page);
        services.frames.release(id);
        return Err(err);
    }

    if let Err(err) = page.swap_in(services, phys.kva()) {
        mapper.lock().unmap(page.va());
        services.frames.unlink(id, &mut page);
        services.frames.release(id);
        return Err(err);
    }

    services.frames.enqueue(id);
    Ok(())
}

/// Faults resolved since boot
pub fn faults_handled() -> u64 {
    FAULTS_HANDLED.load(Ordering::Relaxed)
}

/// Stack pages grown since boot
pub fn stack_growths() -> u64 {
    STACK_GROWTHS.load(Ordering::Relaxed)
}
