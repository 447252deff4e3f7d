//! User address-space layout.
//!
//! The user-visible range runs from zero to [`USER_TOP`]. The single page
//! below [`UXSTACK_TOP`] is the exception stack, used only while a fault
//! upcall runs; [`SCRATCH_BASE`] is a staging slot for fault resolution and
//! is never left mapped outside of it.

use crate::addr::VirtAddr;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Size of one page in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Top of the user-addressable range.
pub const USER_TOP: u64 = 0x0800_0000;

/// Number of user-addressable pages.
pub const USER_PAGES: usize = (USER_TOP as usize) / PAGE_SIZE;

/// Pages covered by one directory-level entry.
pub const TABLE_SPAN: usize = 512;

/// Top of the exception stack; the stack itself is the single page below.
pub const UXSTACK_TOP: u64 = USER_TOP;

/// Base of the exception-stack page.
pub const UXSTACK_BASE: VirtAddr = VirtAddr::new(UXSTACK_TOP - PAGE_SIZE as u64);

/// Staging slot used while resolving a copy-on-write fault.
pub const SCRATCH_BASE: VirtAddr = VirtAddr::new(USER_TOP - 2 * PAGE_SIZE as u64);
