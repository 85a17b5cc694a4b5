//! Supplemental page table tests: lookup, occupancy, teardown.

#[cfg(test)]
mod tests {
    use crate::mm::page::{InitArg, Page, PageTarget};
    use crate::mm::{SupplementalPageTable, VmError};
    use crate::mock::{process, services};

    fn uninit_anon(va: u64) -> Page {
        Page::new_uninit(va, true, PageTarget::Anonymous, None, InitArg::None)
    }

    #[test]
    fn test_find_rounds_down_to_page_base() {
        let mut table = SupplementalPageTable::new();
        table.insert(uninit_anon(0x40_0000)).unwrap();

        assert!(table.find(0x40_0000).is_some());
        assert!(table.find(0x40_0123).is_some());
        assert!(table.find(0x40_0FFF).is_some());
        assert!(table.find(0x40_1000).is_none());
    }

    #[test]
    fn test_insert_rejects_occupied_address() {
        let mut table = SupplementalPageTable::new();
        table.insert(uninit_anon(0x40_0000)).unwrap();
        assert!(matches!(
            table.insert(uninit_anon(0x40_0000)),
            Err(VmError::Occupied)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_detaches_entry() {
        let mut table = SupplementalPageTable::new();
        table.insert(uninit_anon(0x40_0000)).unwrap();
        assert!(table.remove(0x40_0000).is_some());
        assert!(table.find(0x40_0000).is_none());
        assert!(table.remove(0x40_0000).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_entries_iterate_in_address_order() {
        let mut table = SupplementalPageTable::new();
        for va in [0x42_0000u64, 0x40_0000, 0x41_0000] {
            table.insert(uninit_anon(va)).unwrap();
        }
        let addrs: Vec<u64> = table.iter().map(|(va, _)| *va).collect();
        assert_eq!(addrs, vec![0x40_0000, 0x41_0000, 0x42_0000]);
    }

    #[test]
    fn test_destroy_all_runs_every_destroy_once() {
        let services = services(4, 8);
        let (mut pvm, mapper) = process(&services);

        for va in [0x40_0000u64, 0x40_1000, 0x40_2000] {
            pvm.allocate_lazy(PageTarget::Anonymous, va, true, None, InitArg::None)
                .unwrap();
        }
        pvm.claim(0x40_0000).unwrap();
        pvm.claim(0x40_1000).unwrap();

        pvm.teardown();
        assert!(pvm.spt().is_empty());
        assert_eq!(services.frames.pool_available(), 4);
        assert_eq!(mapper.mapping_count(), 0);

        // A second teardown over the now-empty table is harmless
        pvm.teardown();
        assert_eq!(services.frames.pool_available(), 4);
    }
}
