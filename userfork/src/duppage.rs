//! Per-page transfer of a mapping into another address space.

use exofork_abi::{Exokernel, PageNumber, PagePerms, ProcId, Result};

/// Maps `page` of the calling process into `target` at the same virtual
/// address, then re-applies the resulting permissions to the caller's own
/// mapping.
///
/// Permission rule, in order:
/// - `SHARED` pages keep their full permission set; both processes write
///   through to the same frame;
/// - writable or already-`COW` pages are transferred as `COW`, write access
///   removed on both sides;
/// - plain read-only pages are transferred read-only.
///
/// The target mapping is installed first; it is the canonical record of the
/// transfer, and the caller's own mapping is re-applied to match it even
/// when the permissions look unchanged.
pub(crate) fn duppage(sys: &dyn Exokernel, target: ProcId, page: PageNumber) -> Result<()> {
    let va = page.base();
    let src = sys.page_perms(page);

    let perms = if src.is_shared() {
        src & PagePerms::MAPPABLE
    } else if src.is_writable() || src.is_cow() {
        PagePerms::COW_RO
    } else {
        PagePerms::RO
    };

    sys.page_map(ProcId::SELF, va, target, va, perms)?;
    sys.page_map(ProcId::SELF, va, ProcId::SELF, va, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use exofork_abi::{
        CreateChild, ErrorCode, FaultUpcall, ProcStatus, SysError, VirtAddr,
    };
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MapCall {
        src: ProcId,
        src_va: VirtAddr,
        dst: ProcId,
        dst_va: VirtAddr,
        perms: PagePerms,
    }

    /// Records every `page_map` the duplicator issues.
    struct Recorder {
        src_perms: PagePerms,
        fail_first_map: bool,
        calls: RefCell<Vec<MapCall>>,
    }

    impl Recorder {
        fn with_perms(src_perms: PagePerms) -> Self {
            Recorder {
                src_perms,
                fail_first_map: false,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Exokernel for Recorder {
        fn page_alloc(&self, _: ProcId, _: VirtAddr, _: PagePerms) -> Result<()> {
            unimplemented!()
        }
        fn page_map(
            &self,
            src: ProcId,
            src_va: VirtAddr,
            dst: ProcId,
            dst_va: VirtAddr,
            perms: PagePerms,
        ) -> Result<()> {
            if self.fail_first_map && self.calls.borrow().is_empty() {
                return Err(SysError::new(ErrorCode::OutOfMemory));
            }
            self.calls.borrow_mut().push(MapCall {
                src,
                src_va,
                dst,
                dst_va,
                perms,
            });
            Ok(())
        }
        fn page_unmap(&self, _: ProcId, _: VirtAddr) -> Result<()> {
            unimplemented!()
        }
        fn create_child(&self) -> Result<CreateChild> {
            unimplemented!()
        }
        fn set_status(&self, _: ProcId, _: ProcStatus) -> Result<()> {
            unimplemented!()
        }
        fn set_fault_upcall(&self, _: ProcId, _: FaultUpcall) -> Result<()> {
            unimplemented!()
        }
        fn getpid(&self) -> ProcId {
            ProcId::new(1)
        }
        fn fault_upcall(&self) -> Option<FaultUpcall> {
            None
        }
        fn table_present(&self, _: PageNumber) -> bool {
            true
        }
        fn page_perms(&self, _: PageNumber) -> PagePerms {
            self.src_perms
        }
        fn read_bytes(&self, _: VirtAddr, _: &mut [u8]) -> Result<()> {
            unimplemented!()
        }
        fn write_bytes(&self, _: VirtAddr, _: &[u8]) -> Result<()> {
            unimplemented!()
        }
    }

    const CHILD: ProcId = ProcId::new(7);
    const PAGE: PageNumber = PageNumber::new(5);

    fn run(src_perms: PagePerms) -> Vec<MapCall> {
        let sys = Recorder::with_perms(src_perms);
        duppage(&sys, CHILD, PAGE).unwrap();
        sys.calls.into_inner()
    }

    #[test]
    fn writable_page_is_demoted_to_cow_on_both_sides() {
        let calls = run(PagePerms::RW);
        assert_eq!(calls.len(), 2);

        // Target first, then the caller's own re-map, same permissions.
        assert_eq!(calls[0].dst, CHILD);
        assert_eq!(calls[1].dst, ProcId::SELF);
        for call in &calls {
            assert_eq!(call.src, ProcId::SELF);
            assert_eq!(call.src_va, PAGE.base());
            assert_eq!(call.dst_va, PAGE.base());
            assert_eq!(call.perms, PagePerms::COW_RO);
        }
    }

    #[test]
    fn cow_page_is_remarked_cow() {
        let calls = run(PagePerms::COW_RO);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].perms, PagePerms::COW_RO);
        assert_eq!(calls[1].perms, PagePerms::COW_RO);
        assert_eq!(calls[1].dst, ProcId::SELF);
    }

    #[test]
    fn shared_page_keeps_its_permissions() {
        let calls = run(PagePerms::RW | PagePerms::SHARED);
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert_eq!(call.perms, PagePerms::RW | PagePerms::SHARED);
        }
    }

    #[test]
    fn shared_wins_over_writable_demotion() {
        let calls = run(PagePerms::RW | PagePerms::SHARED | PagePerms::COW);
        assert_eq!(
            calls[0].perms,
            PagePerms::RW | PagePerms::SHARED | PagePerms::COW
        );
    }

    #[test]
    fn read_only_page_stays_read_only() {
        let calls = run(PagePerms::RO);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].perms, PagePerms::RO);
        assert_eq!(calls[1].perms, PagePerms::RO);
    }

    #[test]
    fn map_failure_propagates_without_the_second_call() {
        let mut sys = Recorder::with_perms(PagePerms::RW);
        sys.fail_first_map = true;
        let err = duppage(&sys, CHILD, PAGE).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        assert!(sys.calls.borrow().is_empty());
    }
}
