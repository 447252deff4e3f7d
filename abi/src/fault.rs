//! Page-fault records and the upcall entry-point type.

use crate::addr::VirtAddr;
use crate::calls::Exokernel;
use bitflags::bitflags;

bitflags! {
    /// Cause bits reported with a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u32 {
        /// The faulting access hit a present mapping.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE   = 1 << 1;
        /// The fault was raised from user mode.
        const USER    = 1 << 2;
    }
}

impl FaultCause {
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// Snapshot delivered to a fault upcall.
///
/// Valid for one fault occurrence; never persisted.
#[derive(Debug, Clone, Copy)]
pub struct FaultContext {
    /// Faulting virtual address (not page-aligned).
    pub va: VirtAddr,
    /// Cause bitmask for this fault.
    pub cause: FaultCause,
}

/// Entry point of a user-installed page-fault upcall.
///
/// The kernel's dispatch invokes it synchronously on the faulting process's
/// exception stack; `sys` is the faulting process's own call surface. The
/// upcall must not assume any other concurrency context.
pub type FaultUpcall = fn(sys: &dyn Exokernel, utf: &FaultContext);
