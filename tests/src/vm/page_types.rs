//! Page-type state machine tests: one-shot transitions, deferred
//! initializers, destroy idempotence, handle ownership.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::fs::{FileRef, VmFile};
    use crate::mm::page::{FileSegment, InitArg, PageInit, PageTarget};
    use crate::mm::{VmError, PAGE_SIZE};
    use crate::mock::{process, services, user_fault, MockFile};

    const VA: u64 = 0x50_0000;
    const VA2: u64 = 0x50_1000;

    // =========================================================================
    // Uninit transition
    // =========================================================================

    #[test]
    fn test_fresh_anonymous_page_is_zero_filled() {
        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, None, InitArg::None)
            .unwrap();

        pvm.claim(VA).unwrap();
        assert!(mapper.read_user(VA).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deferred_initializer_runs_after_default_fill() {
        fn stamp(buf: &mut [u8], _arg: &InitArg) -> Result<(), VmError> {
            buf[..4].copy_from_slice(b"NEXA");
            Ok(())
        }
        let init: PageInit = stamp;

        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, Some(init), InitArg::None)
            .unwrap();

        pvm.claim(VA).unwrap();
        let content = mapper.read_user(VA);
        assert_eq!(&content[..4], b"NEXA");
        assert!(content[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_failed_initializer_poisons_the_page() {
        fn broken(_buf: &mut [u8], _arg: &InitArg) -> Result<(), VmError> {
            Err(VmError::Io)
        }
        let init: PageInit = broken;

        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, Some(init), InitArg::None)
            .unwrap();

        assert_eq!(pvm.claim(VA), Err(VmError::Io));
        // The partial claim was unwound completely
        assert_eq!(services.frames.pool_available(), 2);
        assert!(!mapper.is_mapped(VA));

        // The page is permanently unusable from here on
        assert_eq!(pvm.claim(VA), Err(VmError::Unusable));
        assert!(!pvm.handle_fault(&user_fault(VA, false, 0)));
    }

    #[test]
    fn test_file_target_without_segment_is_rejected() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::FileBacked, VA, true, None, InitArg::None)
            .unwrap();

        assert_eq!(pvm.claim(VA), Err(VmError::InvalidArgument));
        assert_eq!(pvm.claim(VA), Err(VmError::Unusable));
    }

    #[test]
    fn test_file_backed_transition_loads_window_and_zero_tail() {
        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);

        let data: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let file = MockFile::new(data.clone());
        let file_ref: FileRef = Arc::new(file.clone());

        let seg = FileSegment {
            file: file_ref,
            offset: 100,
            read_bytes: 200,
            zero_bytes: PAGE_SIZE as usize - 200,
            owns_handle: false,
        };
        pvm.allocate_lazy(PageTarget::FileBacked, VA, false, None, InitArg::File(seg))
            .unwrap();

        pvm.claim(VA).unwrap();
        let content = mapper.read_user(VA);
        assert_eq!(&content[..200], &data[100..300]);
        assert!(content[200..].iter().all(|&b| b == 0));

        // Borrowed handle: teardown must not close it
        pvm.teardown();
        assert_eq!(file.closes(), 0);
    }

    // =========================================================================
    // Destroy contract
    // =========================================================================

    #[test]
    fn test_destroy_releases_frame_and_mapping() {
        let services = services(2, 4);
        let (mut pvm, mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, None, InitArg::None)
            .unwrap();
        pvm.claim(VA).unwrap();
        assert_eq!(services.frames.pool_available(), 1);

        pvm.teardown();
        assert_eq!(services.frames.pool_available(), 2);
        assert_eq!(mapper.mapping_count(), 0);
        assert!(pvm.spt().is_empty());
    }

    #[test]
    fn test_destroy_releases_swap_slot_of_evicted_page() {
        let services = services(1, 4);
        let (mut pvm, _mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, None, InitArg::None)
            .unwrap();
        pvm.allocate_lazy(PageTarget::Anonymous, VA2, true, None, InitArg::None)
            .unwrap();

        pvm.claim(VA).unwrap();
        pvm.claim(VA2).unwrap(); // evicts VA into a slot
        assert_eq!(services.swap.free_slots(), 3);

        pvm.teardown();
        assert_eq!(services.swap.free_slots(), 4);
        assert_eq!(services.frames.pool_available(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);
        pvm.allocate_lazy(PageTarget::Anonymous, VA, true, None, InitArg::None)
            .unwrap();
        pvm.claim(VA).unwrap();

        let cell = pvm.spt().find(VA).unwrap();
        let mapper_ref = pvm.mapper().clone();
        cell.lock().destroy(&services, &mapper_ref);
        assert_eq!(services.frames.pool_available(), 2);

        // A second destroy must not double-free the frame
        cell.lock().destroy(&services, &mapper_ref);
        assert_eq!(services.frames.pool_available(), 2);
        assert_eq!(services.swap.free_slots(), 4);
    }

    #[test]
    fn test_uninit_destroy_frees_retained_owned_handle() {
        let services = services(2, 4);
        let (mut pvm, _mapper) = process(&services);

        let file = MockFile::new(vec![1u8; 64]);
        let handle = file.reopen().unwrap();
        assert_eq!(file.open_handles(), 2);

        let seg = FileSegment {
            file: handle,
            offset: 0,
            read_bytes: 64,
            zero_bytes: PAGE_SIZE as usize - 64,
            owns_handle: true,
        };
        pvm.allocate_lazy(PageTarget::FileBacked, VA, false, None, InitArg::File(seg))
            .unwrap();

        // Never materialized; teardown still closes the retained handle
        pvm.teardown();
        assert_eq!(file.open_handles(), 1);
    }
}
