//! Page-mapping permission bits.

use bitflags::bitflags;

bitflags! {
    /// Permission bits carried by a page mapping.
    ///
    /// The low bits mirror the hardware layout; `COW` and `SHARED` live in
    /// the software-available range and are never interpreted by hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PagePerms: u32 {
        /// The mapping is present.
        const PRESENT  = 1 << 0;
        /// The mapping allows writes.
        const WRITABLE = 1 << 1;
        /// The mapping is reachable from user mode.
        const USER     = 1 << 2;
        /// Copy-on-write: the frame is shared and a private copy is made on
        /// the first write.
        const COW      = 1 << 9;
        /// Explicitly opted out of copy-on-write; writes go through to the
        /// shared frame.
        const SHARED   = 1 << 10;

        /// Read-only user mapping.
        const RO = Self::PRESENT.bits() | Self::USER.bits();
        /// Writable user mapping.
        const RW = Self::RO.bits() | Self::WRITABLE.bits();
        /// Demoted copy-on-write mapping.
        const COW_RO = Self::RO.bits() | Self::COW.bits();
        /// Every bit a mapping syscall accepts.
        const MAPPABLE = Self::RW.bits() | Self::COW.bits() | Self::SHARED.bits();
    }
}

impl PagePerms {
    /// True for a mapping the fork walk considers: present and user-visible.
    pub fn is_user_present(self) -> bool {
        self.contains(Self::RO)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_cow(self) -> bool {
        self.contains(Self::COW)
    }

    pub fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }
}
