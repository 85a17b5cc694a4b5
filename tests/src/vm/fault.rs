//! Fault-handler policy tests: rejection rules, stack growth bounds,
//! claim behavior.

#[cfg(test)]
mod tests {
    use crate::mm::page::{InitArg, PageTarget};
    use crate::mm::{
        FaultInfo, VmError, MAX_STACK_SIZE, PAGE_SIZE, STACK_SLACK, USER_STACK_TOP,
    };
    use crate::mock::{process, services, user_fault};

    const VA: u64 = 0x60_0000;

    // =========================================================================
    // Rejection policy
    // =========================================================================

    #[test]
    fn test_protection_violation_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        let mut info = user_fault(VA, true, 0);
        info.not_present = false;
        assert!(!pvm.handle_fault(&info));
    }

    #[test]
    fn test_null_and_kernel_addresses_are_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        assert!(!pvm.handle_fault(&user_fault(0, false, 0)));
        assert!(!pvm.handle_fault(&user_fault(0xFFFF_8000_0000_1000, false, 0)));
    }

    #[test]
    fn test_unmapped_non_stack_address_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        assert!(!pvm.handle_fault(&user_fault(VA, false, 0)));
    }

    #[test]
    fn test_write_to_read_only_page_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, false, None, InitArg::None)
            .unwrap();

        assert!(!pvm.handle_fault(&user_fault(VA, true, 0)));
        // Reading the same page is fine
        assert!(pvm.handle_fault(&user_fault(VA, false, 0)));
    }

    #[test]
    fn test_resolved_fault_installs_mapping() {
        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, None, InitArg::None)
            .unwrap();

        assert!(pvm.handle_fault(&user_fault(VA + 0x123, true, 0)));
        assert!(mapper.is_mapped(VA));
        assert!(pvm.spt().find(VA).unwrap().lock().is_resident());
    }

    #[test]
    fn test_claim_of_unregistered_address_fails() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        assert_eq!(pvm.claim(VA), Err(VmError::NotFound));
    }

    #[test]
    fn test_claim_is_idempotent_while_resident() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, None, InitArg::None)
            .unwrap();
        pvm.claim(VA).unwrap();
        pvm.claim(VA).unwrap();
        assert_eq!(services.frames.pool_available(), 1);
    }

    // =========================================================================
    // Stack growth
    // =========================================================================

    fn stack_fault(addr: u64, sp: u64) -> FaultInfo {
        user_fault(addr, true, sp)
    }

    #[test]
    fn test_fault_within_slack_below_sp_grows_stack() {
        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);

        let sp = USER_STACK_TOP - 0x1000;
        let addr = sp - STACK_SLACK;
        assert!(pvm.handle_fault(&stack_fault(addr, sp)));

        let va = addr & !(PAGE_SIZE - 1);
        let page = pvm.spt().find(va).unwrap();
        assert!(page.lock().is_resident());
        assert!(page.lock().writable());
        assert!(mapper.read_user(va).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fault_at_sp_grows_stack() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        let sp = USER_STACK_TOP - 0x2000;
        assert!(pvm.handle_fault(&stack_fault(sp, sp)));
    }

    #[test]
    fn test_fault_too_far_below_sp_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        let sp = USER_STACK_TOP - 0x1000;
        assert!(!pvm.handle_fault(&stack_fault(sp - STACK_SLACK - 1, sp)));
    }

    #[test]
    fn test_fault_at_or_above_stack_ceiling_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        assert!(!pvm.handle_fault(&stack_fault(USER_STACK_TOP, USER_STACK_TOP)));
    }

    #[test]
    fn test_fault_beyond_max_stack_size_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        let addr = USER_STACK_TOP - MAX_STACK_SIZE - PAGE_SIZE;
        // Keep the slack rule satisfied so only the size rule rejects
        assert!(!pvm.handle_fault(&stack_fault(addr, addr)));
    }

    #[test]
    fn test_kernel_origin_fault_uses_saved_stack_pointer() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        let sp = USER_STACK_TOP - 0x3000;
        let info = FaultInfo {
            addr: sp - 8,
            user: false,
            write: true,
            not_present: true,
            trap_sp: 0,
            saved_user_sp: sp,
        };
        assert!(pvm.handle_fault(&info));

        // Without a recorded user stack pointer the fault cannot be
        // attributed to the stack
        let info = FaultInfo {
            addr: sp - PAGE_SIZE - 8,
            user: false,
            write: true,
            not_present: true,
            trap_sp: 0,
            saved_user_sp: 0,
        };
        assert!(!pvm.handle_fault(&info));
    }
}
