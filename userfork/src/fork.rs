//! Fork orchestration: address-space duplication and child activation.

use core::cell::Cell;

use exofork_abi::layout::{USER_PAGES, UXSTACK_BASE};
use exofork_abi::{
    CreateChild, ErrorCode, Exokernel, PageNumber, PagePerms, ProcId, ProcStatus, Result, SysError,
};

use crate::duppage::duppage;
use crate::pgfault::install_pgfault_handler;

/// Outcome of a successful [`Proc::fork`], one variant per return path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// Parent path: the child's identifier.
    Parent(ProcId),
    /// The new process's path.
    Child,
}

/// A process's handle to its own execution environment: the exokernel call
/// surface plus a cached copy of the process's identity.
///
/// Each process owns exactly one of these; the cached identity is refreshed
/// on the child side of a fork, where the handle suddenly belongs to a
/// different process than the one that created it.
pub struct Proc<'k> {
    sys: &'k dyn Exokernel,
    id: Cell<ProcId>,
}

impl<'k> Proc<'k> {
    /// Attaches to the calling process.
    pub fn attach(sys: &'k dyn Exokernel) -> Self {
        Proc {
            sys,
            id: Cell::new(sys.getpid()),
        }
    }

    /// Identity of the process this handle belongs to.
    pub fn id(&self) -> ProcId {
        self.id.get()
    }

    /// Duplicates the calling process.
    ///
    /// Returns [`ForkResult::Parent`] with the child's identifier in the
    /// calling process and [`ForkResult::Child`] in the new one. The child
    /// shares every present user page with the parent: writable pages are
    /// demoted to copy-on-write on both sides and materialize lazily through
    /// [`crate::pgfault`]; `SHARED` pages stay shared; the exception stack
    /// is the one page that is never shared and gets a fresh frame instead.
    ///
    /// Panics if any underlying syscall fails: a partially duplicated child
    /// is not cleaned up, and the parent's address space may already carry
    /// demoted permissions.
    pub fn fork(&self) -> ForkResult {
        install_pgfault_handler(self.sys);

        let child = match self.sys.create_child() {
            Ok(CreateChild::InChild) => {
                // Second return path: this handle now belongs to the child.
                self.id.set(self.sys.getpid());
                return ForkResult::Child;
            }
            Ok(CreateChild::Spawned(id)) => id,
            Err(e) => panic!("fork: create_child failed: {}", e),
        };

        log::debug!("fork: duplicating address space into {}", child);

        let uxstack_page = UXSTACK_BASE.page_number();
        for index in 0..USER_PAGES {
            let page = PageNumber::new(index);
            if !self.sys.table_present(page) {
                continue;
            }
            if !self.sys.page_perms(page).is_user_present() {
                continue;
            }
            if page == uxstack_page {
                continue;
            }
            if let Err(e) = duppage(self.sys, child, page) {
                panic!("fork: duppage({:?}) failed: {}", page, e);
            }
        }

        // The child handles its own faults from the very first write, so it
        // needs a private exception stack and the parent's upcall before it
        // becomes runnable.
        if let Err(e) = self.sys.page_alloc(child, UXSTACK_BASE, PagePerms::RW) {
            panic!("fork: exception stack allocation for {} failed: {}", child, e);
        }
        let upcall = match self.sys.fault_upcall() {
            Some(upcall) => upcall,
            None => panic!("fork: no fault upcall registered after install"),
        };
        if let Err(e) = self.sys.set_fault_upcall(child, upcall) {
            panic!("fork: upcall registration for {} failed: {}", child, e);
        }
        if let Err(e) = self.sys.set_status(child, ProcStatus::Runnable) {
            panic!("fork: activating {} failed: {}", child, e);
        }

        log::debug!("fork: {} is runnable", child);
        ForkResult::Parent(child)
    }

    /// Shared-memory fork: every writable page would stay writable and
    /// shared. Reserved; always fails with `InvalidArgument`.
    pub fn sfork(&self) -> Result<ForkResult> {
        Err(SysError::with_message(
            ErrorCode::InvalidArgument,
            "sfork is not implemented",
        ))
    }
}
