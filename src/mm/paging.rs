//! x86_64 address-space backend.
//!
//! Implements [`AddressSpaceOps`] by walking the four-level page tables
//! directly. The walk expects the intermediate structure (PML4 → PDP →
//! PD → PT) covering the user regions to have been built by the process
//! address-space constructor; only leaf entries are installed and
//! cleared here. Physical table addresses are converted to kernel
//! pointers through the boot-time physical mapping offset.

use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::VirtAddr;

use super::phys::PhysPage;
use super::{AddressSpaceOps, VmError};

/// One process's hardware page tables
pub struct X86AddressSpace {
    pml4_phys: u64,
    phys_offset: u64,
}

unsafe impl Send for X86AddressSpace {}

impl X86AddressSpace {
    /// # Safety
    ///
    /// `pml4_phys` must be the physical address of a live PML4 whose
    /// user-region structure is already built, and `phys_offset` must be
    /// the offset of the kernel's linear physical mapping.
    pub unsafe fn new(pml4_phys: u64, phys_offset: u64) -> Self {
        Self {
            pml4_phys,
            phys_offset,
        }
    }

    fn table_mut(&self, phys: u64) -> &mut PageTable {
        unsafe { &mut *((phys + self.phys_offset) as *mut PageTable) }
    }

    /// Walk to the PT entry covering `va`. Fails on missing intermediate
    /// tables and on huge-page mappings, which this subsystem never
    /// installs.
    fn walk(&self, va: u64) -> Result<&mut x86_64::structures::paging::page_table::PageTableEntry, VmError> {
        let pml4_index = ((va >> 39) & 0x1FF) as usize;
        let pdp_index = ((va >> 30) & 0x1FF) as usize;
        let pd_index = ((va >> 21) & 0x1FF) as usize;
        let pt_index = ((va >> 12) & 0x1FF) as usize;

        let pml4 = self.table_mut(self.pml4_phys);
        let pml4_entry = &pml4[pml4_index];
        if !pml4_entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(VmError::NoMemory);
        }

        let pdp = self.table_mut(pml4_entry.addr().as_u64());
        let pdp_entry = &pdp[pdp_index];
        if !pdp_entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(VmError::NoMemory);
        }
        if pdp_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(VmError::InvalidState);
        }

        let pd = self.table_mut(pdp_entry.addr().as_u64());
        let pd_entry = &pd[pd_index];
        if !pd_entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(VmError::NoMemory);
        }
        if pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(VmError::InvalidState);
        }

        let pt = self.table_mut(pd_entry.addr().as_u64());
        Ok(&mut pt[pt_index])
    }
}

impl AddressSpaceOps for X86AddressSpace {
    fn map(&mut self, va: u64, frame: &PhysPage, writable: bool) -> Result<(), VmError> {
        let entry = self.walk(va)?;
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(VmError::Occupied);
        }
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        entry.set_addr(x86_64::PhysAddr::new(frame.pa()), flags);
        x86_64::instructions::tlb::flush(VirtAddr::new(va));
        Ok(())
    }

    fn unmap(&mut self, va: u64) {
        if let Ok(entry) = self.walk(va) {
            if entry.flags().contains(PageTableFlags::PRESENT) {
                entry.set_unused();
                x86_64::instructions::tlb::flush(VirtAddr::new(va));
            }
        }
    }

    fn is_dirty(&self, va: u64) -> bool {
        match self.walk(va) {
            Ok(entry) => entry.flags().contains(PageTableFlags::DIRTY),
            Err(_) => false,
        }
    }

    fn clear_dirty(&mut self, va: u64) {
        if let Ok(entry) = self.walk(va) {
            let flags = entry.flags();
            if flags.contains(PageTableFlags::DIRTY) {
                entry.set_flags(flags & !PageTableFlags::DIRTY);
                x86_64::instructions::tlb::flush(VirtAddr::new(va));
            }
        }
    }
}
