//! Copy-on-write page-fault handler.

use exofork_abi::layout::{PAGE_SIZE, SCRATCH_BASE, UXSTACK_BASE};
use exofork_abi::{Exokernel, FaultContext, PagePerms, ProcId};

/// Page-fault upcall: resolves a write to a copy-on-write page by remapping
/// a private copy of the frame in place of the shared one.
///
/// Only write faults on `COW` pages are in contract; any other fault class
/// reaching this handler is a bug in the faulting process and terminates it.
/// A syscall failure mid-resolution also panics: a partially applied copy
/// would leave the address space inconsistent.
pub fn pgfault(sys: &dyn Exokernel, utf: &FaultContext) {
    let perms = sys.page_perms(utf.va.page_number());
    if !utf.cause.is_write() || !perms.is_cow() {
        panic!(
            "pgfault: not a write to a copy-on-write page (va={:#x}, cause={:?}, perms={:?})",
            utf.va.as_u64(),
            utf.cause,
            perms
        );
    }

    log::trace!("pgfault: private copy for va={:#x}", utf.va.as_u64());

    // Stage a fresh writable page at the scratch slot, fill it with the
    // faulting page's contents, then move it over the faulting address.
    if let Err(e) = sys.page_alloc(ProcId::SELF, SCRATCH_BASE, PagePerms::RW) {
        panic!("pgfault: page_alloc failed: {}", e);
    }

    let base = utf.va.page_base();
    let mut buf = [0u8; PAGE_SIZE];
    if let Err(e) = sys.read_bytes(base, &mut buf) {
        panic!("pgfault: reading the faulting page failed: {}", e);
    }
    if let Err(e) = sys.write_bytes(SCRATCH_BASE, &buf) {
        panic!("pgfault: filling the scratch page failed: {}", e);
    }

    if let Err(e) = sys.page_map(ProcId::SELF, SCRATCH_BASE, ProcId::SELF, base, PagePerms::RW) {
        panic!("pgfault: page_map failed: {}", e);
    }
    if let Err(e) = sys.page_unmap(ProcId::SELF, SCRATCH_BASE) {
        panic!("pgfault: page_unmap failed: {}", e);
    }
}

/// Installs [`pgfault`] as the calling process's page-fault upcall.
///
/// The first installation allocates the process's exception stack before
/// registering the upcall; later calls are no-ops.
pub fn install_pgfault_handler(sys: &dyn Exokernel) {
    if sys.fault_upcall().is_some() {
        return;
    }
    if let Err(e) = sys.page_alloc(ProcId::SELF, UXSTACK_BASE, PagePerms::RW) {
        panic!("install_pgfault_handler: exception stack allocation failed: {}", e);
    }
    if let Err(e) = sys.install_local_fault_handler(pgfault) {
        panic!("install_pgfault_handler: upcall registration failed: {}", e);
    }
}
