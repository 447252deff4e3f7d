//! The call surface a user process consumes from the exokernel.

use core::fmt;

use crate::addr::{PageNumber, VirtAddr};
use crate::error::Result;
use crate::fault::FaultUpcall;
use crate::perms::PagePerms;

/// Opaque identifier of a process (the owner of one address space).
///
/// [`ProcId::SELF`] stands for the calling process in syscall arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ProcId(u32);

impl ProcId {
    /// Alias for the calling process.
    pub const SELF: ProcId = ProcId(0);

    pub const fn new(id: u32) -> Self {
        ProcId(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// True for the [`ProcId::SELF`] alias.
    pub const fn is_self_alias(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc:{}", self.0)
    }
}

/// Scheduling states a process moves through during fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    /// Created but not yet eligible to run.
    NotRunnable,
    /// Eligible to run.
    Runnable,
}

/// Outcome of [`Exokernel::create_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateChild {
    /// The caller's return path: the new process's identifier.
    Spawned(ProcId),
    /// The new process's own (single) return path.
    InChild,
}

/// Raw page-mapping and process primitives exposed by the privileged layer.
///
/// Mapping calls are individually atomic and either complete or fail; there
/// is no partial application and no retry at this layer. A target other than
/// the caller must be a direct child of the caller.
pub trait Exokernel {
    // ── Mapping syscalls ────────────────────────────────────────────────

    /// Reserves a fresh zeroed frame and maps it at `va` in `target` with
    /// `perms`. An existing mapping at `va` is replaced.
    fn page_alloc(&self, target: ProcId, va: VirtAddr, perms: PagePerms) -> Result<()>;

    /// Maps the frame backing `src_va` in `src` at `dst_va` in `dst` with
    /// `perms`. Fails if `src_va` has no mapping in `src`, or if `perms`
    /// requests write access to a frame whose source mapping is read-only.
    /// An existing mapping at `dst_va` is replaced.
    fn page_map(
        &self,
        src: ProcId,
        src_va: VirtAddr,
        dst: ProcId,
        dst_va: VirtAddr,
        perms: PagePerms,
    ) -> Result<()>;

    /// Removes the mapping at `va` in `target`, if any.
    fn page_unmap(&self, target: ProcId, va: VirtAddr) -> Result<()>;

    // ── Process lifecycle ───────────────────────────────────────────────

    /// Duplicates the calling process's execution context (registers only)
    /// into a new process with an empty address space, no fault upcall and
    /// status [`ProcStatus::NotRunnable`].
    fn create_child(&self) -> Result<CreateChild>;

    /// Moves `target` between scheduling states.
    fn set_status(&self, target: ProcId, status: ProcStatus) -> Result<()>;

    /// Registers `upcall` as `target`'s page-fault upcall.
    fn set_fault_upcall(&self, target: ProcId, upcall: FaultUpcall) -> Result<()>;

    /// Registers the calling process's own upcall entry point with the
    /// kernel's trap-delivery mechanism.
    fn install_local_fault_handler(&self, upcall: FaultUpcall) -> Result<()> {
        self.set_fault_upcall(ProcId::SELF, upcall)
    }

    // ── Self introspection (read-only) ──────────────────────────────────

    /// Identity of the calling process.
    fn getpid(&self) -> ProcId;

    /// The calling process's registered fault upcall, if any.
    fn fault_upcall(&self) -> Option<FaultUpcall>;

    /// Whether the directory-level entry covering `page` is present in the
    /// calling process's address space.
    fn table_present(&self, page: PageNumber) -> bool;

    /// Leaf permissions for `page` in the calling process's address space;
    /// empty if unmapped.
    fn page_perms(&self, page: PageNumber) -> PagePerms;

    // ── User memory ─────────────────────────────────────────────────────
    //
    // The MMU door: these model ordinary loads and stores issued by the
    // process itself. An access that violates the current mapping raises a
    // page fault, which the kernel resolves by delivering the registered
    // upcall and retrying the access exactly once.

    /// Reads `buf.len()` bytes starting at `va`.
    fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()>;

    /// Writes `bytes` starting at `va`.
    fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) -> Result<()>;
}
